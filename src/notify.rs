//! Notification dispatch driver (§4.6, §7). The concrete SMTP/webhook/Slack
//! transports are out of scope; this module owns the retry/backoff policy around
//! whatever `NotificationSink` is wired in, grounded on the teacher's `webhooks.rs`
//! dispatch shape and the retry posture of `remediation.rs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Webhook,
    Slack,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Channel,
    pub destination: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), String>;
}

/// Outbound webhook transport using `reqwest`; the only concrete sink this crate
/// ships, since SMTP/Slack clients are named out of scope.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, notification: &Notification) -> Result<(), String> {
        if notification.channel != Channel::Webhook {
            return Ok(());
        }
        self.client
            .post(&notification.destination)
            .json(&serde_json::json!({
                "subject": notification.subject,
                "body": notification.body,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

const BACKOFFS: [u64; 3] = [1, 4, 16];

/// Retries delivery 3 times with 1/4/16 s backoff (§7); never undoes the caller's
/// FIRING transition regardless of outcome. Returns the number of attempts made and
/// whether delivery ultimately succeeded, for the caller to record on the AlertEvent.
pub async fn dispatch_with_retry(
    sink: &dyn NotificationSink,
    notification: &Notification,
) -> (bool, u32) {
    for (attempt, backoff_secs) in BACKOFFS.iter().enumerate() {
        match sink.send(notification).await {
            Ok(()) => return (true, attempt as u32 + 1),
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "notification delivery failed");
                tokio::time::sleep(Duration::from_secs(*backoff_secs)).await;
            }
        }
    }
    match sink.send(notification).await {
        Ok(()) => (true, BACKOFFS.len() as u32 + 1),
        Err(_) => (false, BACKOFFS.len() as u32 + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn send(&self, _n: &Notification) -> Result<(), String> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                Err("simulated failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let sink = FlakySink {
            fail_times: 2,
            attempts: AtomicU32::new(0),
        };
        let n = Notification {
            channel: Channel::Webhook,
            destination: "https://example.test/hook".into(),
            subject: "test".into(),
            body: "body".into(),
        };
        let (ok, attempts) = dispatch_with_retry(&sink, &n).await;
        assert!(ok);
        assert_eq!(attempts, 3);
    }
}
