use chrono::Utc;
use cradle_fs::{self as fs, FsError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::{API_SHUTDOWN_GRACE, ApiError, serve_api};
use crate::clock::{ClockPolicy, resync_on_wake};
use crate::config::{ConfigError, ConfigStore, MachineConfig, Processes};
use crate::context::Context;
use crate::events::Stage;
use crate::http;
use crate::network::{NetworkError, TRANSPORT_WAIT, start_network};
use crate::process::{ProcessExit, ProcessHandle, is_process_alive};
use crate::provider::ProviderError;
use crate::scope::Scope;
use crate::shell::{RemoteShell, ShellTarget, run_privileged};
use crate::signals::{Signal, SignalError, wait_for_termination};
use crate::wait::{RetryPolicy, WaitError, poll_until};
use crate::watchdog::{PARENT_POLL_INTERVAL, watch_parent};

pub const SSH_READINESS: RetryPolicy = RetryPolicy::fixed(120, Duration::from_secs(1));
pub const API_READINESS: RetryPolicy = RetryPolicy::fixed(60, Duration::from_secs(1));
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StartError {
    #[error("parent process {pid} exited")]
    ParentExited { pid: u32 },

    #[error("received {0}")]
    Signal(Signal),

    #[error(transparent)]
    Signals(#[from] SignalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start networking")]
    Network(#[from] NetworkError),

    #[error("failed to start hypervisor")]
    Provider(#[from] ProviderError),

    #[error("failed to clear stale hypervisor socket")]
    StaleSocket(#[source] FsError),

    #[error("guest SSH not ready after {attempts} attempts")]
    SshNotReady { attempts: u32 },

    #[error("guest API not ready after {attempts} attempts")]
    ApiNotReady { attempts: u32 },

    #[error("control API failed")]
    Api(#[from] ApiError),

    #[error("hypervisor exited: {exit}")]
    HypervisorExited { exit: ProcessExit },

    #[error("failed to record runtime state")]
    RecordState(#[source] ConfigError),

    #[error("startup task failed")]
    Task(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Process whose death stops the VM. `None` disables the watchdog.
    pub parent_pid: Option<u32>,
    pub watchdog_interval: Duration,
    pub transport_wait: RetryPolicy,
    pub ssh_readiness: RetryPolicy,
    pub api_readiness: RetryPolicy,
    pub api_grace: Duration,
    pub termination_grace: Duration,
    pub clock: ClockPolicy,
    pub listen_for_signals: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            parent_pid: Some(std::os::unix::process::parent_id()),
            watchdog_interval: PARENT_POLL_INTERVAL,
            transport_wait: TRANSPORT_WAIT,
            ssh_readiness: SSH_READINESS,
            api_readiness: API_READINESS,
            api_grace: API_SHUTDOWN_GRACE,
            termination_grace: TERMINATION_GRACE,
            clock: ClockPolicy::default(),
            listen_for_signals: true,
        }
    }
}

/// Boot machine `name` and keep it running until the hypervisor exits, the parent
/// dies, a termination signal arrives, or a subsystem fails.
///
/// Returns the first failure. Cleanup runs whatever the outcome: guest disks are
/// flushed, hypervisor and network sockets removed, then any child still alive is
/// terminated.
#[tracing::instrument(skip(ctx, options))]
pub async fn start(ctx: &Context, name: &str, options: StartOptions) -> Result<(), StartError> {
    if let Some(pid) = options.parent_pid {
        if !is_process_alive(pid) {
            return Err(StartError::ParentExited { pid });
        }
    }

    let store = ConfigStore::open(ctx.workspace(), ctx.provider()).await?;
    let _lock = store.lock(name).await?;
    let config = store.load(name).await?;

    let scope = Scope::new();
    let mut tasks: JoinSet<Result<(), StartError>> = JoinSet::new();

    if let Some(pid) = options.parent_pid {
        let token = scope.token().clone();
        let every = options.watchdog_interval;
        tasks.spawn(async move {
            if watch_parent(pid, every, &token).await {
                Err(StartError::ParentExited { pid })
            } else {
                Ok(())
            }
        });
    }

    if options.listen_for_signals {
        let token = scope.token().clone();
        tasks.spawn(async move {
            match wait_for_termination(&token).await? {
                Some(signal) => Err(StartError::Signal(signal)),
                None => Ok(()),
            }
        });
    }

    {
        let ctx = ctx.clone();
        let config = config.clone();
        let token = scope.token().clone();
        let grace = options.api_grace;
        tasks.spawn(async move { Ok(serve_api(ctx, config, token, grace).await?) });
    }

    {
        let ctx = ctx.clone();
        let scope = scope.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let outcome = run_vm(&ctx, config, &scope, &options).await;
            match outcome {
                // failures caused by a sibling cancelling us are not ours to report
                Err(_) if scope.is_cancelled() => Ok(()),
                outcome => outcome,
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(StartError::from).and_then(|outcome| outcome);
        if let Err(error) = outcome {
            if first_error.is_none() {
                error!(%error, "Startup task failed, shutting down");
                first_error = Some(error);
            } else {
                debug!(%error, "Further startup task failure");
            }
        }
        scope.cancel();
    }

    scope.close(options.termination_grace).await;
    clear_runtime_state(&store, name).await;

    match first_error {
        Some(error) => {
            ctx.events().emit(Stage::Failed, name, error.to_string());
            Err(error)
        }
        None => {
            ctx.events().emit(Stage::Stopped, name, "");
            info!(name, "Machine stopped");
            Ok(())
        }
    }
}

/// The sequencing-critical task: network, hypervisor, readiness, then wait for exit.
async fn run_vm(
    ctx: &Context,
    mut config: MachineConfig,
    scope: &Scope,
    options: &StartOptions,
) -> Result<(), StartError> {
    let name = config.name.clone();
    let events = ctx.events();

    let network = start_network(ctx, &config, scope, &options.transport_wait).await?;
    events.emit(Stage::Network, &name, network.pid().to_string());

    prepare_rest_socket(&config, scope).await?;
    let hypervisor = config.provider.start_vm(ctx, &config)?;
    scope.supervisor().register(hypervisor.clone());
    register_disk_flush(ctx, &config, scope, hypervisor.clone());
    events.emit(Stage::Hypervisor, &name, hypervisor.pid().to_string());

    let target = ShellTarget::for_machine(&config);
    let shell: &dyn RemoteShell = ctx.shell().as_ref();
    let probe_target = &target;
    let ssh_ready = poll_until(&options.ssh_readiness, scope.token(), "guest SSH", move || async move {
        match shell.run(probe_target, "true", &[]).await {
            Ok(output) => output.success(),
            Err(error) => {
                debug!(%error, "Guest SSH not ready");
                false
            }
        }
    });
    let attempt = tokio::select! {
        ready = ssh_ready => match ready {
            Ok(attempt) => attempt,
            Err(WaitError::Cancelled { .. }) => return Ok(()),
            Err(WaitError::Exhausted { attempts, .. }) => return Err(StartError::SshNotReady { attempts }),
        },
        exit = hypervisor.wait() => return Err(StartError::HypervisorExited { exit }),
    };
    info!(attempt, "Guest SSH ready");
    events.emit(Stage::SshReady, &name, attempt.to_string());

    if let Some(socket) = config.forwarded_api_socket() {
        let api_ready = poll_until(&options.api_readiness, scope.token(), "guest API", move || async move {
            matches!(http::get(socket, "/_ping").await, Ok(response) if response.status.is_success())
        });
        let attempt = tokio::select! {
            ready = api_ready => match ready {
                Ok(attempt) => attempt,
                Err(WaitError::Cancelled { .. }) => return Ok(()),
                Err(WaitError::Exhausted { attempts, .. }) => return Err(StartError::ApiNotReady { attempts }),
            },
            exit = hypervisor.wait() => return Err(StartError::HypervisorExited { exit }),
        };
        info!(attempt, "Guest API ready");
        events.emit(Stage::ApiReady, &name, attempt.to_string());
    }

    tokio::spawn(resync_on_wake(
        Arc::clone(ctx.shell()),
        target,
        options.clock,
        scope.token().clone(),
    ));

    config.processes = Processes {
        network_pid: Some(network.pid()),
        hypervisor_pid: Some(hypervisor.pid()),
    };
    config.last_up = Some(Utc::now());
    config.write().await.map_err(StartError::RecordState)?;
    info!(name = %name, ssh_port = config.ssh.port, "Machine running");
    events.emit(Stage::Running, &name, config.ssh.port.to_string());

    tokio::select! {
        exit = hypervisor.wait() => {
            if exit.success() {
                info!(%exit, "Hypervisor exited");
                Ok(())
            } else {
                Err(StartError::HypervisorExited { exit })
            }
        }
        _ = scope.cancelled() => Ok(()),
    }
}

/// A REST socket left by a crashed hypervisor would make the new one fail to bind.
async fn prepare_rest_socket(config: &MachineConfig, scope: &Scope) -> Result<(), StartError> {
    let Some(socket) = config.hypervisor.rest_socket.clone() else {
        return Ok(());
    };
    fs::remove_file_if_exists(&socket)
        .await
        .map_err(StartError::StaleSocket)?;
    scope.on_close("hypervisor socket", move || async move {
        if let Err(error) = fs::remove_file_if_exists(&socket).await {
            warn!(%error, "Failed to remove hypervisor socket");
        }
    });
    Ok(())
}

/// Flush guest disks on shutdown, while the guest can still be reached.
fn register_disk_flush(ctx: &Context, config: &MachineConfig, scope: &Scope, hypervisor: ProcessHandle) {
    let shell = Arc::clone(ctx.shell());
    let target = ShellTarget::for_machine(config);
    scope.on_close("guest disk flush", move || async move {
        if !hypervisor.is_running() {
            return;
        }
        match run_privileged(shell.as_ref(), &target, "sync", &[]).await {
            Ok(_) => debug!("Guest disks flushed"),
            Err(error) => warn!(%error, "Failed to flush guest disks"),
        }
    });
}

async fn clear_runtime_state(store: &ConfigStore, name: &str) {
    let mut config = match store.load(name).await {
        Ok(config) => config,
        Err(error) => {
            warn!(%error, "Failed to reload machine config");
            return;
        }
    };
    if config.processes == Processes::default() {
        return;
    }
    config.processes = Processes::default();
    if let Err(error) = config.write().await {
        warn!(%error, "Failed to clear runtime state");
    }
}
