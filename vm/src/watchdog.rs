use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::is_process_alive;

pub const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Poll `pid` until it dies or `cancel` fires. Returns `true` if the parent died.
pub async fn watch_parent(pid: u32, every: Duration, cancel: &CancellationToken) -> bool {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(pid, ?every, "Watching parent process");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }
        if !is_process_alive(pid) {
            warn!(pid, "Parent process exited");
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_dead_parent() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let cancel = CancellationToken::new();
        assert!(watch_parent(pid, Duration::from_millis(10), &cancel).await);
    }

    #[tokio::test]
    async fn test_live_parent_is_watched_until_cancelled() {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watch_parent(std::process::id(), Duration::from_millis(10), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(!watcher.await.unwrap());
    }
}
