//! HTTP email service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::{Notification, NotificationSender, SendError};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    pub base_url: Url,
    /// Appended to `base_url`, e.g. `/send-email`.
    pub path: String,
    /// Hard limit for one request, connect included.
    pub timeout: Duration,
}

impl HttpSenderConfig {
    /// `base_url` followed by `path`, keeping any path prefix of the base.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{}", self.path))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpSenderError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    email: &'a str,
    message: &'a str,
}

/// Posts `{"email", "message"}` to the email service.
#[derive(Debug, Clone)]
pub struct HttpNotificationSender {
    client: Client,
    endpoint: Url,
}

impl HttpNotificationSender {
    pub fn new(config: &HttpSenderConfig) -> Result<Self, HttpSenderError> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint()?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(IDEMPOTENCY_KEY, &notification.idempotency_key)
            .json(&SendEmailRequest {
                email: &notification.recipient,
                message: &notification.message,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), key = %notification.idempotency_key, "email service accepted");
            return Ok(());
        }

        // Body is diagnostics only; a read failure must not mask the status.
        let body = response.text().await.unwrap_or_default();
        Err(SendError::from_status(status.as_u16(), &body))
    }
}

fn transport_error(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() {
        SendError::Transient(format!("connection failed: {err}"))
    } else {
        SendError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn sender_for(server: &MockServer, timeout: Duration) -> HttpNotificationSender {
        HttpNotificationSender::new(&HttpSenderConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            path: "/send-email".into(),
            timeout,
        })
        .unwrap()
    }

    fn notification() -> Notification {
        Notification {
            recipient: "ada@example.com".into(),
            message: "Hey, Ada Lovelace it's your birthday".into(),
            idempotency_key: "job-1".into(),
        }
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let config = HttpSenderConfig {
            base_url: Url::parse("https://mail.example.com/v1/").unwrap(),
            path: "/send-email".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(config.endpoint().unwrap().as_str(), "https://mail.example.com/v1/send-email");
    }

    #[tokio::test]
    async fn posts_payload_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/send-email"))
            .and(matchers::header("Idempotency-Key", "job-1"))
            .and(matchers::body_json(serde_json::json!({
                "email": "ada@example.com",
                "message": "Hey, Ada Lovelace it's your birthday"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender_for(&server, Duration::from_secs(5));
        assert_eq!(sender.send(&notification()).await, Ok(()));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = sender_for(&server, Duration::from_secs(5))
            .send(&notification())
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Transient("HTTP 500: boom".into()));
    }

    #[tokio::test]
    async fn bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid email"))
            .mount(&server)
            .await;

        let err = sender_for(&server, Duration::from_secs(5))
            .send(&notification())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SendError::Permanent {
                status: 400,
                body: "invalid email".into()
            }
        );
    }

    #[tokio::test]
    async fn request_timeout_status_is_transient() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(408))
            .mount(&server)
            .await;

        let err = sender_for(&server, Duration::from_secs(5))
            .send(&notification())
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn slow_service_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = sender_for(&server, Duration::from_millis(100))
            .send(&notification())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Transient(ref msg) if msg.starts_with("request timed out")));
    }
}
