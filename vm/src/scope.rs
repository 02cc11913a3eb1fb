use futures_util::future::BoxFuture;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::ProcessSupervisor;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Shared cancellation for every subtask of one running VM, plus the cleanup that
/// runs once they have all stopped.
#[derive(Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    hooks: Arc<Mutex<Vec<(String, Hook)>>>,
    supervisor: ProcessSupervisor,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Register cleanup to run when the scope closes. Hooks run newest first.
    pub fn on_close<F, Fut>(&self, name: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), hook));
    }

    /// Cancel, run the cleanup hooks in reverse registration order, then terminate
    /// any child process still alive. Safe to call more than once.
    pub async fn close(&self, termination_grace: Duration) {
        self.cancel();

        let hooks = mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, hook) in hooks.into_iter().rev() {
            debug!(hook = %name, "Running scope cleanup");
            hook().await;
        }

        self.supervisor.terminate_all(termination_grace).await;
    }
}
