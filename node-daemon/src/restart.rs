use async_trait::async_trait;
use node_core::events::{Event, EventHandler};
use std::time::Duration;
use tokio::sync::mpsc;

/// Platform side of `RestartRequested`: waits `delay` so the HTTP response
/// gets out, then tells the runner to exit.
pub struct RestartHandler {
    notify: mpsc::Sender<()>,
    delay: Duration,
}

impl RestartHandler {
    pub fn new(notify: mpsc::Sender<()>, delay: Duration) -> Self {
        Self { notify, delay }
    }
}

#[async_trait]
impl EventHandler for RestartHandler {
    async fn handle(&self, _event: &Event) {
        tracing::info!(delay = ?self.delay, "Restart requested, exiting after delay");
        let notify = self.notify.clone();
        let delay = self.delay;
        // Runs off the consumer task so other subscribers are not held up.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notify.try_send(());
        });
    }
}
