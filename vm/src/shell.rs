use async_trait::async_trait;
use cradle_ssh::{Ssh, SshConnectOptions, SshError, SshKeypairError, load_private_key};
use std::borrow::Cow;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::config::MachineConfig;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Keypair(#[from] SshKeypairError),

    #[error("remote command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("remote command `{command}` exited with status {exit_status}: {output}")]
    Failed {
        command: String,
        exit_status: u32,
        output: String,
    },
}

/// Where and as whom remote commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub identity: PathBuf,
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl ShellTarget {
    pub fn for_machine(config: &MachineConfig) -> Self {
        Self {
            identity: config.ssh.identity_path.clone(),
            host: "127.0.0.1".to_string(),
            user: config.ssh.remote_username.clone(),
            port: config.ssh.port,
        }
    }

    pub fn is_root(&self) -> bool {
        self.user == "root"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub output: String,
    pub exit_status: u32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Join a command and its arguments into one shell-escaped command line.
pub fn command_line(command: &str, args: &[String]) -> String {
    let mut line = shell_escape::unix::escape(Cow::Borrowed(command)).into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape::unix::escape(Cow::Borrowed(arg.as_str())));
    }
    line
}

/// Runs commands inside the guest.
#[async_trait]
pub trait RemoteShell: Send + Sync + Debug {
    async fn run(
        &self,
        target: &ShellTarget,
        command: &str,
        args: &[String],
    ) -> Result<RemoteOutput, ShellError>;

    /// Like [`RemoteShell::run`], but a non-zero exit status is an error.
    async fn run_checked(
        &self,
        target: &ShellTarget,
        command: &str,
        args: &[String],
    ) -> Result<RemoteOutput, ShellError> {
        let output = self.run(target, command, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ShellError::Failed {
                command: command_line(command, args),
                exit_status: output.exit_status,
                output: output.output,
            })
        }
    }
}

/// Run `command` as root, through `sudo` when the target user is not root.
pub async fn run_privileged(
    shell: &dyn RemoteShell,
    target: &ShellTarget,
    command: &str,
    args: &[String],
) -> Result<RemoteOutput, ShellError> {
    if target.is_root() {
        return shell.run_checked(target, command, args).await;
    }
    let mut sudo_args = vec!["-n".to_string(), command.to_string()];
    sudo_args.extend_from_slice(args);
    shell.run_checked(target, "sudo", &sudo_args).await
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`RemoteShell`] over SSH, one connection per command.
#[derive(Debug, Clone)]
pub struct SshShell {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    config: Arc<russh::client::Config>,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            config: Arc::new(russh::client::Config::default()),
        }
    }
}

impl SshShell {
    async fn exec(&self, target: &ShellTarget, line: &str) -> Result<RemoteOutput, ShellError> {
        let private_key = load_private_key(&target.identity).await?;
        let mut ssh = Ssh::connect(SshConnectOptions {
            private_key,
            addrs: (target.host.clone(), target.port),
            username: target.user.clone(),
            config: self.config.clone(),
            timeout: self.connect_timeout,
        })
        .await?;

        let output = ssh.exec(line).await?;
        if let Err(error) = ssh.disconnect().await {
            debug!(%error, "SSH disconnect failed");
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(RemoteOutput {
            output: combined,
            exit_status: output.exit_status,
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        target: &ShellTarget,
        command: &str,
        args: &[String],
    ) -> Result<RemoteOutput, ShellError> {
        let line = command_line(command, args);
        debug!(command = %line, port = target.port, "Running remote command");
        match timeout(self.command_timeout, self.exec(target, &line)).await {
            Ok(result) => result,
            Err(_) => Err(ShellError::Timeout {
                command: line,
                timeout: self.command_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteShell for Recorder {
        async fn run(
            &self,
            _target: &ShellTarget,
            command: &str,
            args: &[String],
        ) -> Result<RemoteOutput, ShellError> {
            self.lines.lock().unwrap().push(command_line(command, args));
            Ok(RemoteOutput {
                output: String::new(),
                exit_status: if command == "false" { 1 } else { 0 },
            })
        }
    }

    fn target(user: &str) -> ShellTarget {
        ShellTarget {
            identity: PathBuf::from("/id"),
            host: "127.0.0.1".to_string(),
            user: user.to_string(),
            port: 2222,
        }
    }

    #[test]
    fn test_command_line_escapes_arguments() {
        assert_eq!(
            command_line("date", &["-u".to_string(), "-s".to_string(), "@1700000000".to_string()]),
            "date -u -s '@1700000000'"
        );
        assert_eq!(command_line("echo", &["a b".to_string()]), "echo 'a b'");
    }

    #[tokio::test]
    async fn test_run_checked_rejects_non_zero_exit() {
        let shell = Recorder::default();
        let error = shell.run_checked(&target("core"), "false", &[]).await.unwrap_err();
        assert!(matches!(error, ShellError::Failed { exit_status: 1, .. }));
    }

    #[tokio::test]
    async fn test_run_privileged_uses_sudo_for_non_root() {
        let shell = Recorder::default();
        run_privileged(&shell, &target("core"), "sync", &[]).await.unwrap();
        run_privileged(&shell, &target("root"), "sync", &[]).await.unwrap();
        assert_eq!(*shell.lines.lock().unwrap(), vec!["sudo -n sync", "sync"]);
    }
}
