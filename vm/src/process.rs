use cradle_cmd::{Command, CommandError};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fmt::{self, Display, Formatter};
use std::mem;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("process '{name}' exited before its pid could be read")]
    NoPid { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    Lost(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(status) if status.success())
    }
}

impl Display for ProcessExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited(status) => write!(f, "{status}"),
            ProcessExit::Lost(reason) => write!(f, "lost track of process: {reason}"),
        }
    }
}

/// A running child process whose exit can be awaited from any number of places.
///
/// The tokio `Child` is owned by a background task that reaps it; termination goes
/// through the pid.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn spawn(name: &str, command: &mut Command) -> Result<Self, ProcessError> {
        let child = command.spawn()?;
        Self::from_child(name, child)
    }

    pub fn from_child(name: &str, mut child: Child) -> Result<Self, ProcessError> {
        let pid = child.id().ok_or_else(|| ProcessError::NoPid {
            name: name.to_string(),
        })?;
        let (tx, rx) = watch::channel(None);

        let task_name = name.to_string();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit::Exited(status),
                Err(error) => ProcessExit::Lost(error.to_string()),
            };
            debug!(process = %task_name, pid, %exit, "Process exited");
            let _ = tx.send(Some(exit));
        });

        info!(process = name, pid, "Started process");
        Ok(Self {
            name: name.to_string(),
            pid,
            exit: rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.try_exit().is_none()
    }

    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| ProcessExit::Lost("no exit status".to_string())),
            Err(_) => ProcessExit::Lost("reaper task ended".to_string()),
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.try_exit() {
            return exit;
        }

        debug!(process = %self.name, pid = self.pid, "Sending SIGTERM");
        self.signal(Signal::SIGTERM);
        if let Ok(exit) = timeout(grace, self.wait()).await {
            return exit;
        }

        warn!(process = %self.name, pid = self.pid, ?grace, "Process ignored SIGTERM, sending SIGKILL");
        self.signal(Signal::SIGKILL);
        self.wait().await
    }

    fn signal(&self, signal: Signal) {
        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!(process = %self.name, pid = self.pid, %error, "Failed to signal process"),
        }
    }
}

/// Whether a pid refers to a live process. A process we may not signal still exists.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Every child spawned for one VM, so they can all be terminated together.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    children: Arc<Mutex<Vec<ProcessHandle>>>,
}

impl ProcessSupervisor {
    pub fn register(&self, handle: ProcessHandle) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Terminate every still-running child, most recently started first.
    pub async fn terminate_all(&self, grace: Duration) {
        let children = mem::take(&mut *self.children.lock().unwrap_or_else(PoisonError::into_inner));
        let running = children.into_iter().rev().filter(ProcessHandle::is_running);
        let exits = futures_util::future::join_all(running.map(|child| async move {
            let exit = child.terminate(grace).await;
            (child, exit)
        }))
        .await;
        for (child, exit) in exits {
            debug!(process = child.name(), pid = child.pid(), %exit, "Terminated process");
        }
    }
}
