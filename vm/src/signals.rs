use futures_util::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::fmt::{self, Display};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("failed to register signal handlers")]
    Register(#[source] std::io::Error),
}

/// A termination request from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            SIGINT => Some(Signal::Interrupt),
            SIGTERM => Some(Signal::Terminate),
            _ => None,
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM. Returns `None` if `cancel` fires first.
pub async fn wait_for_termination(cancel: &CancellationToken) -> Result<Option<Signal>, SignalError> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(SignalError::Register)?;
    let handle = signals.handle();

    let received = loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break None,
            raw = signals.next() => raw,
        };
        match raw {
            Some(raw) => {
                if let Some(signal) = Signal::from_raw(raw) {
                    break Some(signal);
                }
            }
            None => break None,
        }
    };

    handle.close();
    if let Some(signal) = received {
        info!(%signal, "Received termination signal");
    }
    Ok(received)
}
