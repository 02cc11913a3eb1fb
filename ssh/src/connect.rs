use russh::{
    client::{Config, Handle, Handler, connect_stream},
    keys::{PrivateKey, PrivateKeyWithHashAlg},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    time::{Instant, sleep},
};
use tracing::debug;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SshConnectError {
    #[error("failed to open TCP connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Russh(#[from] russh::Error),

    #[error("timed out connecting via SSH")]
    Timeout,

    #[error("SSH authentication (public key) failed for user '{username}'")]
    AuthFailed { username: String },
}

#[derive(Debug, Clone)]
pub struct SshConnectOptions<Addrs>
where
    Addrs: ToSocketAddrs + Clone + Send,
{
    pub private_key: PrivateKey,
    pub addrs: Addrs,
    pub username: String,
    pub config: Arc<Config>,
    /// How long to keep retrying refused connections. Zero means a single attempt.
    pub timeout: Duration,
}

// The guest is a local VM we just created, so its host key is not pinned.
#[derive(Debug, Clone)]
pub struct SshClient;

impl Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn is_retryable(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotFound
    )
}

pub(crate) async fn connect_with_retry<Addrs>(
    options: SshConnectOptions<Addrs>,
) -> Result<Handle<SshClient>, SshConnectError>
where
    Addrs: ToSocketAddrs + Clone + Send,
{
    let SshConnectOptions {
        private_key,
        addrs,
        username,
        config,
        timeout,
    } = options;

    let start = Instant::now();

    let mut handle = loop {
        match TcpStream::connect(addrs.clone()).await {
            Ok(stream) => match connect_stream(config.clone(), stream, SshClient).await {
                Ok(handle) => break handle,
                Err(russh::Error::IO(ref error)) if is_retryable(error.kind()) => {
                    debug!(%error, "SSH handshake failed, retrying");
                }
                Err(russh::Error::Disconnect) => {
                    debug!("SSH server disconnected during handshake, retrying");
                }
                Err(error) => return Err(SshConnectError::from(error)),
            },
            Err(ref error) if is_retryable(error.kind()) => {
                debug!(%error, "TCP connect failed, retrying");
            }
            Err(error) => return Err(SshConnectError::from(error)),
        }

        if start.elapsed() >= timeout {
            return Err(SshConnectError::Timeout);
        }
        sleep(CONNECT_RETRY_INTERVAL).await;
    };

    let auth = handle
        .authenticate_publickey(
            &username,
            PrivateKeyWithHashAlg::new(Arc::new(private_key), None),
        )
        .await?;

    if !auth.success() {
        return Err(SshConnectError::AuthFailed { username });
    }

    Ok(handle)
}
