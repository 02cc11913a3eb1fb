mod command;
mod connect;
mod keypair;

pub use crate::command::{SshCommandError, SshOutput};
pub use crate::connect::{SshConnectError, SshConnectOptions};
pub use crate::keypair::{SshKeypair, SshKeypairError, load_private_key};

use russh::client::Handle;
use thiserror::Error;
use tokio::net::ToSocketAddrs;

use crate::connect::{SshClient, connect_with_retry};

#[derive(Error, Debug)]
pub enum SshError {
    #[error(transparent)]
    Connect(#[from] SshConnectError),

    #[error(transparent)]
    Command(#[from] SshCommandError),

    #[error(transparent)]
    Keypair(#[from] SshKeypairError),

    #[error("failed to disconnect: {error}")]
    Disconnect {
        #[source]
        error: russh::Error,
    },
}

/// An authenticated SSH session to a guest.
pub struct Ssh {
    handle: Handle<SshClient>,
}

impl Ssh {
    /// Connect to the SSH server with retry/backoff and public key auth.
    #[tracing::instrument(skip(options))]
    pub async fn connect<Addrs>(options: SshConnectOptions<Addrs>) -> Result<Self, SshError>
    where
        Addrs: ToSocketAddrs + Clone + Send,
    {
        let handle = connect_with_retry(options).await?;
        Ok(Self { handle })
    }

    /// Run a remote command to completion, capturing its output and exit status.
    #[tracing::instrument(skip(self))]
    pub async fn exec(&mut self, command: &str) -> Result<SshOutput, SshError> {
        command::ssh_exec(&mut self.handle, command)
            .await
            .map_err(SshError::Command)
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&mut self) -> Result<(), SshError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .map_err(|error| SshError::Disconnect { error })
    }
}
