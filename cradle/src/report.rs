use cradle_vm::VmEvent;
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

pub const REPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Forward every event to `url` as `GET ?stage=&name=&value=`, until the sender is dropped.
///
/// Pings run concurrently and are never retried. The returned task finishes once
/// the channel is closed and every ping in flight has completed or timed out.
pub fn forward_events(url: Url, mut events: UnboundedReceiver<VmEvent>) -> JoinHandle<()> {
    let client = Client::new();
    tokio::spawn(async move {
        let mut pings = JoinSet::new();
        while let Some(event) = events.recv().await {
            pings.spawn(ping(client.clone(), url.clone(), event));
        }
        while pings.join_next().await.is_some() {}
    })
}

async fn ping(client: Client, url: Url, event: VmEvent) {
    let stage = event.stage.to_string();
    let result = client
        .get(url)
        .query(&[
            ("stage", stage.as_str()),
            ("name", event.name.as_str()),
            ("value", event.value.as_str()),
        ])
        .timeout(REPORT_TIMEOUT)
        .send()
        .await
        .and_then(|response| response.error_for_status());
    match result {
        Ok(_) => debug!(stage, name = %event.name, "Reported event"),
        Err(error) => warn!(%error, stage, "Failed to report event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_vm::{Events, Stage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_events_become_query_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/report", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let read = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..read]).into_owned()
        });

        let (events, rx) = Events::channel();
        let forwarder = forward_events(url, rx);
        events.emit(Stage::Running, "dev", "2222");
        drop(events);
        forwarder.await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /report?stage=running&name=dev&value=2222 "));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_not_fatal() {
        let url = Url::parse("http://127.0.0.1:9/report").unwrap();
        let (events, rx) = Events::channel();
        let forwarder = forward_events(url, rx);
        events.emit(Stage::Failed, "dev", "boom");
        drop(events);

        forwarder.await.unwrap();
    }
}
