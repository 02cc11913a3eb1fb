use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shell::{RemoteShell, ShellError, ShellTarget, run_privileged};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPolicy {
    pub tick: Duration,
    /// How far the wall clock may run ahead of the monotonic clock before we assume the host slept.
    pub jump_threshold: Duration,
}

impl Default for ClockPolicy {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            jump_threshold: Duration::from_secs(30),
        }
    }
}

/// The monotonic clock stops while the host sleeps and the wall clock does not.
pub fn detect_jump(wall_delta: Duration, mono_delta: Duration, threshold: Duration) -> bool {
    wall_delta.saturating_sub(mono_delta) > threshold
}

/// Set the guest clock to the host's current time.
pub async fn sync_guest_clock(shell: &dyn RemoteShell, target: &ShellTarget) -> Result<(), ShellError> {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    run_privileged(
        shell,
        target,
        "date",
        &["-u".to_string(), "-s".to_string(), format!("@{epoch}")],
    )
    .await?;
    Ok(())
}

/// Resync the guest clock whenever the host wakes from sleep, until cancelled.
/// Failures are logged and never end the loop.
pub async fn resync_on_wake(
    shell: Arc<dyn RemoteShell>,
    target: ShellTarget,
    policy: ClockPolicy,
    cancel: CancellationToken,
) {
    let mut last_wall = SystemTime::now();
    let mut last_mono = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(policy.tick) => {}
        }

        let wall = SystemTime::now();
        let mono = Instant::now();
        let wall_delta = wall.duration_since(last_wall).unwrap_or_default();
        let mono_delta = mono.duration_since(last_mono);
        last_wall = wall;
        last_mono = mono;

        if !detect_jump(wall_delta, mono_delta, policy.jump_threshold) {
            continue;
        }

        info!(?wall_delta, ?mono_delta, "Host woke from sleep, syncing guest clock");
        match sync_guest_clock(shell.as_ref(), &target).await {
            Ok(()) => debug!("Guest clock synced"),
            Err(error) => warn!(%error, "Failed to sync guest clock"),
        }
    }
}
