//! Outbound push notifications for lifecycle and emergency events.
//!
//! Shaped like `TelegramBridge::send_message` in spirit: a `reqwest::Client`
//! posting JSON to a configured endpoint, with the call treated as
//! best-effort — a failure is logged and swallowed, never surfaced to the
//! caller that triggered the notification (§10).

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub kind: NotificationKind,
    pub group_id: String,
    pub group_journey_id: String,
    pub user_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    JourneyStarted,
    MemberStarted,
    MemberPaused,
    MemberCompleted,
    JourneyCompleted,
    Emergency,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: NotificationPayload);
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _payload: NotificationPayload) {}
}

pub struct HttpNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl HttpNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, payload: NotificationPayload) {
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "notifier webhook returned non-2xx");
            }
            Err(err) => {
                warn!(err = %err, "notifier webhook call failed");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_never_panics() {
        NoopNotifier.notify(NotificationPayload {
            kind: NotificationKind::Emergency,
            group_id: "g1".into(),
            group_journey_id: "j1".into(),
            user_id: Some("u1".into()),
            message: "help".into(),
        })
        .await;
    }
}
