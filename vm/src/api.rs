use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use cradle_fs::{self as fs, FsError};
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MachineConfig;
use crate::context::Context;
use crate::provider::{Provider, VmState};
use crate::shell::{ShellTarget, run_privileged};

/// How long in-flight requests get to finish once the API is asked to stop.
pub const API_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to bind control API at '{path}'")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control API server failed")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub name: String,
    pub provider: Provider,
    pub ssh_port: u16,
    pub state: VmState,
}

#[derive(Debug)]
struct ApiState {
    ctx: Context,
    config: MachineConfig,
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/_ping", get(ping))
        .route("/info", get(info))
        .route("/power-off", post(power_off))
        .with_state(state)
}

async fn ping() -> &'static str {
    "OK"
}

async fn info(State(state): State<Arc<ApiState>>) -> Json<MachineInfo> {
    let config = &state.config;
    Json(MachineInfo {
        name: config.name.clone(),
        provider: config.provider,
        ssh_port: config.ssh.port,
        state: config.provider.state(config).await,
    })
}

/// Stop the guest's containers, flush its disks and power it off, in the background.
async fn power_off(State(state): State<Arc<ApiState>>) -> StatusCode {
    let shell = state.ctx.shell().clone();
    let target = ShellTarget::for_machine(&state.config);
    tokio::spawn(async move {
        let stop_all = ["stop".to_string(), "--all".to_string()];
        if let Err(error) = shell.run_checked(&target, "podman", &stop_all).await {
            warn!(%error, "Failed to stop guest containers");
        }
        for command in ["sync", "poweroff"] {
            if let Err(error) = run_privileged(shell.as_ref(), &target, command, &[]).await {
                warn!(%error, command, "Guest power-off step failed");
            }
        }
        info!("Guest power-off requested");
    });
    StatusCode::ACCEPTED
}

/// Serve the control API on the machine's unix socket until `cancel` fires.
///
/// Once cancelled the server stops accepting and in-flight requests get `grace` to
/// finish before the connections are dropped.
#[tracing::instrument(skip_all, fields(name = %config.name))]
pub async fn serve_api(
    ctx: Context,
    config: MachineConfig,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<(), ApiError> {
    let socket = config.api_socket();
    fs::remove_file_if_exists(&socket).await?;
    let listener = UnixListener::bind(&socket).map_err(|source| ApiError::Bind {
        path: socket.clone(),
        source,
    })?;
    info!(socket = %socket.display(), "Control API listening");

    let app = router(Arc::new(ApiState { ctx, config }));
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    let forced = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    let result = tokio::select! {
        result = &mut server => result.map_err(ApiError::Serve),
        _ = forced => {
            warn!(?grace, "Control API did not drain in time, closing connections");
            Ok(())
        }
    };

    if let Err(error) = fs::remove_file_if_exists(&socket).await {
        warn!(%error, "Failed to remove control API socket");
    }
    debug!("Control API stopped");
    result
}
