use cradle_fs::{self as fs, FsError};
use futures_util::future::BoxFuture;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ports::{PortAllocator, PortError};

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("failed to remove directory '{path}': {source}")]
    RemoveDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), RollbackError>> + Send>;

/// One compensating step. Running it when there is nothing to undo is not an error.
pub struct RollbackAction {
    description: String,
    undo: Undo,
}

impl Debug for RollbackAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl RollbackAction {
    pub fn new<F, Fut>(description: impl Into<String>, undo: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RollbackError>> + Send + 'static,
    {
        Self {
            description: description.into(),
            undo: Box::new(move || Box::pin(undo())),
        }
    }

    pub fn remove_file(path: PathBuf) -> Self {
        Self::new(format!("remove {}", path.display()), move || async move {
            fs::remove_file_if_exists(&path).await?;
            Ok(())
        })
    }

    pub fn remove_dir(path: PathBuf) -> Self {
        Self::new(format!("remove directory {}", path.display()), move || async move {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => Ok(()),
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(RollbackError::RemoveDir { path, source }),
            }
        })
    }

    pub fn release_port(allocator: PortAllocator, port: u16) -> Self {
        Self::new(format!("release port {port}"), move || async move {
            allocator.release(port).await?;
            Ok(())
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Compensating actions gathered while a machine is being created.
///
/// Whoever claims the ledger first (a failed init, or a termination signal) runs the
/// actions; anyone after that finds it empty.
#[derive(Debug, Clone, Default)]
pub struct RollbackLedger {
    actions: Arc<Mutex<Vec<RollbackAction>>>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, action: RollbackAction) {
        debug!(action = action.description(), "Registered rollback");
        self.lock().push(action);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every action without running it, once the work they guard has succeeded.
    pub fn commit(&self) {
        let discarded = self.claim();
        debug!(count = discarded.len(), "Committed, rollback discarded");
    }

    /// Roll back if `outcome` is an error. Returns how many actions ran.
    pub async fn run_if_failed<T, E>(&self, outcome: &Result<T, E>) -> usize {
        if outcome.is_ok() {
            return 0;
        }
        self.run("failure").await
    }

    pub async fn run_on_signal(&self) -> usize {
        self.run("signal").await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RollbackAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Vec<RollbackAction> {
        mem::take(&mut *self.lock())
    }

    async fn run(&self, trigger: &str) -> usize {
        let actions = self.claim();
        if actions.is_empty() {
            return 0;
        }

        info!(trigger, count = actions.len(), "Rolling back");
        let count = actions.len();
        for RollbackAction { description, undo } in actions {
            match undo().await {
                Ok(()) => debug!(action = %description, "Rolled back"),
                Err(error) => warn!(action = %description, %error, "Rollback step failed"),
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> RollbackAction {
        let counter = counter.clone();
        RollbackAction::new("count", move || async move {
            tokio::task::yield_now().await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_failure_and_signal_together_run_each_action_once() {
        for _ in 0..50 {
            let ledger = RollbackLedger::new();
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..5 {
                ledger.add(counting(&counter));
            }

            let failed: Result<(), &str> = Err("boom");
            let on_failure = {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.run_if_failed(&failed).await })
            };
            let on_signal = {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.run_on_signal().await })
            };

            let ran = on_failure.await.unwrap() + on_signal.await.unwrap();
            assert_eq!(ran, 5);
            assert_eq!(counter.load(Ordering::SeqCst), 5);
            assert!(ledger.is_empty());
        }
    }

    #[tokio::test]
    async fn test_actions_run_in_order_and_failures_do_not_stop_the_rest() {
        let ledger = RollbackLedger::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for step in 0..3 {
            let order = order.clone();
            ledger.add(RollbackAction::new(format!("step {step}"), move || async move {
                order.lock().unwrap().push(step);
                if step == 1 {
                    Err(RollbackError::RemoveDir {
                        path: PathBuf::from("/nope"),
                        source: std::io::Error::other("refused"),
                    })
                } else {
                    Ok(())
                }
            }));
        }

        let failed: Result<(), ()> = Err(());
        assert_eq!(ledger.run_if_failed(&failed).await, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_success_runs_nothing() {
        let ledger = RollbackLedger::new();
        let counter = Arc::new(AtomicUsize::new(0));
        ledger.add(counting(&counter));

        let ok: Result<(), ()> = Ok(());
        assert_eq!(ledger.run_if_failed(&ok).await, 0);
        ledger.commit();
        assert_eq!(ledger.run_on_signal().await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_file_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.raw");
        std::fs::write(&path, b"disk").unwrap();

        let ledger = RollbackLedger::new();
        ledger.add(RollbackAction::remove_file(path.clone()));
        ledger.add(RollbackAction::remove_file(path.clone()));

        let failed: Result<(), ()> = Err(());
        assert_eq!(ledger.run_if_failed(&failed).await, 2);
        assert!(!path.exists());
    }
}
