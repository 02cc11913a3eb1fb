use russh::ChannelMsg;
use russh::client::Handle;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::connect::SshClient;

/// Exit status reported when the server closes the channel without one.
pub const MISSING_EXIT_STATUS: u32 = 255;

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("failed to open SSH session channel: {0}")]
    ChannelOpen(#[source] russh::Error),

    #[error("failed to execute remote command `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: russh::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: u32,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

#[instrument(skip(handle))]
pub(crate) async fn ssh_exec(
    handle: &mut Handle<SshClient>,
    command: &str,
) -> Result<SshOutput, SshCommandError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(SshCommandError::ChannelOpen)?;

    channel
        .exec(true, command)
        .await
        .map_err(|source| SshCommandError::Exec {
            command: command.to_string(),
            source,
        })?;

    let mut output = SshOutput::default();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    output.stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status: code } => {
                debug!(exit_status = code, "Remote process reported exit status");
                exit_status = Some(code);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    output.exit_status = exit_status.unwrap_or(MISSING_EXIT_STATUS);
    debug!(exit_status = output.exit_status, "Remote command completed");
    Ok(output)
}
