//! Outbound notification delivery.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

pub use http::{HttpNotificationSender, HttpSenderConfig, HttpSenderError};

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub message: String,
    /// Stable per job, so the provider can drop a duplicate delivery.
    pub idempotency_key: String,
}

/// Why a delivery did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The provider rejected the request; retrying will not help.
    #[error("rejected with status {status}: {body}")]
    Permanent { status: u16, body: String },
    /// Timeout, connection failure or server-side error.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl SendError {
    /// Classify a non-success HTTP status. 4xx is permanent except 408.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = truncate(body);
        if (400..500).contains(&status) && status != 408 {
            SendError::Permanent { status, body }
        } else {
            SendError::Transient(format!("HTTP {status}: {body}"))
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent { .. })
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), SendError>;
}

#[async_trait]
impl<T: NotificationSender + ?Sized> NotificationSender for Arc<T> {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        (**self).send(notification).await
    }
}

/// Logs notifications instead of delivering them. Local development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        info!(
            recipient = %notification.recipient,
            idempotency_key = %notification.idempotency_key,
            message = %notification.message,
            "notification (log only)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent_except_timeout() {
        assert!(SendError::from_status(400, "bad").is_permanent());
        assert!(SendError::from_status(404, "").is_permanent());
        assert!(SendError::from_status(429, "").is_permanent());
        assert!(!SendError::from_status(408, "").is_permanent());
        assert!(!SendError::from_status(500, "").is_permanent());
        assert!(!SendError::from_status(503, "").is_permanent());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let SendError::Permanent { body, .. } = SendError::from_status(422, &body) else {
            panic!("expected permanent");
        };
        assert_eq!(body.chars().count(), MAX_ERROR_BODY + 1);
    }

    #[tokio::test]
    async fn log_sender_always_succeeds() {
        let sender: Arc<dyn NotificationSender> = Arc::new(LogNotificationSender);
        let notification = Notification {
            recipient: "ada@example.com".into(),
            message: "hi".into(),
            idempotency_key: "k".into(),
        };
        assert_eq!(sender.send(&notification).await, Ok(()));
    }
}
