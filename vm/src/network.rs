use cradle_cmd::Command;
use cradle_fs::{self as fs, FsError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ForwardSocket, MachineConfig};
use crate::context::Context;
use crate::process::{ProcessExit, ProcessHandle};
use crate::provider::ProviderError;
use crate::scope::Scope;
use crate::wait::{RetryPolicy, WaitError, wait_for_path};

/// Attempts made while waiting for gvproxy's transport socket.
pub const TRANSPORT_WAIT_ATTEMPTS: u32 = 20;

/// gvproxy can take seconds to come up while the OS scans a freshly downloaded binary.
pub const TRANSPORT_WAIT: RetryPolicy = RetryPolicy::exponential(
    TRANSPORT_WAIT_ATTEMPTS,
    Duration::from_millis(100),
    Duration::from_secs(1),
);

pub const NETWORK_MTU: u16 = 1500;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to clear stale network files")]
    Stale(#[source] FsError),

    #[error("network backend exited before it was ready: {exit}")]
    Exited { exit: ProcessExit },

    #[error("network backend never opened its transport socket")]
    Wait(#[source] WaitError),
}

/// Command line for the gvproxy network backend.
#[derive(Debug, Clone)]
pub struct GvproxyCommand {
    executable: PathBuf,
    mtu: u16,
    ssh_port: u16,
    forwards: Vec<ForwardSocket>,
    forward_user: String,
    forward_identity: PathBuf,
    pid_file: PathBuf,
    log_file: PathBuf,
    listen: Vec<String>,
}

impl GvproxyCommand {
    pub fn for_machine(executable: &Path, config: &MachineConfig) -> Self {
        Self {
            executable: executable.to_path_buf(),
            mtu: NETWORK_MTU,
            ssh_port: config.ssh.port,
            forwards: config.network.forwards.clone(),
            forward_user: config.ssh.remote_username.clone(),
            forward_identity: config.ssh.identity_path.clone(),
            pid_file: config.network.pid_file.clone(),
            log_file: config.network.log_file.clone(),
            listen: Vec::new(),
        }
    }

    /// Serve a vfkit-style datagram transport at `socket`.
    pub fn listen_vfkit(mut self, socket: &Path) -> Self {
        self.listen.push("-listen-vfkit".to_string());
        self.listen.push(format!("unixgram://{}", socket.display()));
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("-mtu")
            .arg(self.mtu.to_string())
            .arg("-ssh-port")
            .arg(self.ssh_port.to_string());
        for forward in &self.forwards {
            command
                .arg("-forward-sock")
                .arg(&forward.host)
                .arg("-forward-dest")
                .arg(&forward.guest)
                .arg("-forward-user")
                .arg(&self.forward_user)
                .arg("-forward-identity")
                .arg(&self.forward_identity);
        }
        command
            .arg("-pid-file")
            .arg(&self.pid_file)
            .arg("-log-file")
            .arg(&self.log_file)
            .args(&self.listen)
            .quiet();
        command
    }
}

/// Sockets and pid file the network backend leaves behind.
fn network_files(config: &MachineConfig) -> Vec<PathBuf> {
    let mut files = vec![
        config.network.transport_socket.clone(),
        config.network.pid_file.clone(),
    ];
    files.extend(config.network.forwards.iter().map(|forward| forward.host.clone()));
    files
}

async fn remove_network_files(files: &[PathBuf]) -> Result<(), FsError> {
    for file in files {
        fs::remove_file_if_exists(file).await?;
    }
    Ok(())
}

/// Start gvproxy for `config` and wait until the hypervisor can attach to it.
///
/// The process is supervised by `scope`, and its sockets and pid file are removed
/// when the scope closes.
#[tracing::instrument(skip_all, fields(name = %config.name))]
pub async fn start_network(
    ctx: &Context,
    config: &MachineConfig,
    scope: &Scope,
    policy: &RetryPolicy,
) -> Result<ProcessHandle, NetworkError> {
    let files = network_files(config);
    remove_network_files(&files).await.map_err(NetworkError::Stale)?;

    let gvproxy = GvproxyCommand::for_machine(&ctx.executables().gvproxy, config);
    let handle = config.provider.start_networking(config, gvproxy)?;
    scope.supervisor().register(handle.clone());
    scope.on_close("network files", move || async move {
        if let Err(error) = remove_network_files(&files).await {
            warn!(%error, "Failed to remove network backend files");
        }
    });

    let transport = &config.network.transport_socket;
    tokio::select! {
        ready = wait_for_path(transport, policy, scope.token()) => ready.map_err(NetworkError::Wait)?,
        exit = handle.wait() => return Err(NetworkError::Exited { exit }),
    }

    info!(pid = handle.pid(), transport = %transport.display(), "Network backend ready");
    Ok(handle)
}
