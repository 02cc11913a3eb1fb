use std::ffi::OsStr;
use std::fmt::Display;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command as BaseCommand};
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: tokio::io::Error,
    },

    #[error("failed to open output file '{path}' for command: {command}")]
    OutputFile {
        command: String,
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("command failed: {command}\n{stderr}")]
    Failure { command: String, stderr: String },
}

/// Where a spawned child's stdout and stderr go. Nothing reads a long-running
/// child's pipes, so unless a log file is given its output is discarded.
#[derive(Debug, Clone, Default)]
enum OutputTarget {
    #[default]
    Null,
    File(PathBuf),
}

#[derive(Debug)]
pub struct Command {
    cmd: BaseCommand,
    output: OutputTarget,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd.as_std();
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Command {
    /// Children are killed when the future or `Child` driving them is dropped.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut cmd = BaseCommand::new(program);
        cmd.kill_on_drop(true);
        Self {
            cmd,
            output: OutputTarget::default(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn env<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.env(key, value);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Command {
        self.cmd.current_dir(dir);
        self
    }

    /// Append the spawned child's stdout and stderr to `path`.
    pub fn log_to<P: Into<PathBuf>>(&mut self, path: P) -> &mut Command {
        self.output = OutputTarget::File(path.into());
        self
    }

    /// Discard the spawned child's stdout and stderr.
    pub fn quiet(&mut self) -> &mut Command {
        self.output = OutputTarget::Null;
        self
    }

    pub fn program(&self) -> String {
        self.cmd.as_std().get_program().to_string_lossy().into_owned()
    }

    /// Spawn a long-running child. Its stdin is closed and its output is
    /// discarded unless [`Command::log_to`] was called.
    pub fn spawn(&mut self) -> Result<Child, CommandError> {
        let (stdout, stderr) = match &self.output {
            OutputTarget::Null => (Stdio::null(), Stdio::null()),
            OutputTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|error| CommandError::OutputFile {
                        command: self.to_string(),
                        path: path.clone(),
                        error,
                    })?;
                let clone = file.try_clone().map_err(|error| CommandError::OutputFile {
                    command: self.to_string(),
                    path: path.clone(),
                    error,
                })?;
                (Stdio::from(file), Stdio::from(clone))
            }
        };

        debug!(command = %self, "Spawning command");
        self.cmd
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })
    }

    pub async fn output(&mut self) -> Result<Output, CommandError> {
        self.cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })
    }

    /// Run to completion with stdout written to `path`.
    pub async fn run_with_stdout_to<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CommandError> {
        let p = path.as_ref();
        let file = tokio::fs::File::create(p)
            .await
            .map_err(|error| CommandError::OutputFile {
                command: self.to_string(),
                path: p.to_path_buf(),
                error,
            })?
            .into_std()
            .await;

        let out = self
            .cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })?;

        if out.status.success() {
            Ok(())
        } else {
            Err(CommandError::Failure {
                command: self.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            })
        }
    }

    /// Run to completion, failing with the captured stderr on a non-zero exit.
    pub async fn run(&mut self) -> Result<Output, CommandError> {
        let out = self.output().await?;
        if out.status.success() {
            Ok(out)
        } else {
            Err(CommandError::Failure {
                command: self.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            })
        }
    }
}
