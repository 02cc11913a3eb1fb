use serde::Serialize;
use std::fmt::{self, Display};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

/// Where in the lifecycle an event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Init,
    Network,
    Hypervisor,
    SshReady,
    ApiReady,
    Running,
    Stopped,
    Failed,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Network => "network",
            Stage::Hypervisor => "hypervisor",
            Stage::SshReady => "ssh-ready",
            Stage::ApiReady => "api-ready",
            Stage::Running => "running",
            Stage::Stopped => "stopped",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmEvent {
    pub stage: Stage,
    pub name: String,
    pub value: String,
}

/// Optional sink for lifecycle events. Emitting never blocks or fails.
#[derive(Debug, Clone, Default)]
pub struct Events(Option<UnboundedSender<VmEvent>>);

impl Events {
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn channel() -> (Self, UnboundedReceiver<VmEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, stage: Stage, name: &str, value: impl Into<String>) {
        let Some(tx) = &self.0 else {
            return;
        };
        let event = VmEvent {
            stage,
            name: name.to_string(),
            value: value.into(),
        };
        trace!(?event, "Emitting event");
        // a closed receiver just means nobody is listening anymore
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (events, mut rx) = Events::channel();
        events.emit(Stage::Network, "dev", "12345");
        events.emit(Stage::Running, "dev", "");

        assert_eq!(rx.recv().await.unwrap().stage, Stage::Network);
        let running = rx.recv().await.unwrap();
        assert_eq!(running.stage.to_string(), "running");
        assert_eq!(running.name, "dev");
    }

    #[test]
    fn test_disabled_and_dropped_receivers_are_ignored() {
        Events::disabled().emit(Stage::Init, "dev", "");
        let (events, rx) = Events::channel();
        drop(rx);
        events.emit(Stage::Init, "dev", "");
    }
}
