//! Run outcome notifications.
//!
//! The orchestrator calls [`Notifier::notify`] once per configured recipient
//! when a run ends. Delivery is best-effort: the orchestrator logs and drops
//! any error a notifier returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Delivers run notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        info!(recipient, subject, body, "Run notification");
        Ok(())
    }
}

#[cfg(feature = "webhook")]
pub use webhook::{WebhookConfig, WebhookNotifier};

#[cfg(feature = "webhook")]
mod webhook {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use ring::hmac;

    use super::{Notification, Notifier};
    use crate::error::{ExportError, Result};
    use crate::security::SecureString;

    /// Configuration for webhook notifications.
    #[derive(Debug, Clone)]
    pub struct WebhookConfig {
        url: String,
        headers: HashMap<String, String>,
        secret: Option<SecureString>,
        timeout: Duration,
    }

    impl WebhookConfig {
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                headers: HashMap::new(),
                secret: None,
                timeout: Duration::from_secs(10),
            }
        }

        pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.insert(key.into(), value.into());
            self
        }

        /// Sign payloads with HMAC-SHA256 under `secret`.
        pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
            self.secret = Some(SecureString::new(secret.into()));
            self
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        pub fn validate(&self) -> Result<()> {
            let url = reqwest::Url::parse(&self.url).map_err(|e| {
                ExportError::Configuration(format!("invalid webhook URL '{}': {e}", self.url))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ExportError::Configuration(format!(
                    "webhook URL must use http or https, got '{}'",
                    url.scheme()
                )));
            }
            Ok(())
        }
    }

    /// Posts notifications as JSON to a webhook endpoint.
    pub struct WebhookNotifier {
        client: reqwest::Client,
        config: WebhookConfig,
    }

    impl WebhookNotifier {
        pub fn new(config: WebhookConfig) -> Result<Self> {
            config.validate()?;
            let client = reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| {
                    ExportError::Configuration(format!("Failed to build HTTP client: {e}"))
                })?;
            Ok(Self { client, config })
        }

        /// Hex HMAC-SHA256 of `body`.
        pub fn sign_payload(body: &str, secret: &str) -> String {
            let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
            let signature = hmac::sign(&key, body.as_bytes());
            hex::encode(signature.as_ref())
        }
    }

    #[async_trait]
    impl Notifier for WebhookNotifier {
        async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
            let payload = serde_json::json!({
                "notification": Notification {
                    recipient: recipient.to_string(),
                    subject: subject.to_string(),
                    body: body.to_string(),
                },
                "sent_at": Utc::now(),
            });
            let body = serde_json::to_string(&payload)?;

            let mut request = self
                .client
                .post(&self.config.url)
                .header("Content-Type", "application/json");
            for (key, value) in &self.config.headers {
                request = request.header(key, value);
            }
            if let Some(secret) = &self.config.secret {
                let signature = Self::sign_payload(&body, secret.expose());
                request = request.header("X-Signature-256", format!("sha256={signature}"));
            }

            let response = request
                .body(body)
                .send()
                .await
                .map_err(|e| ExportError::Notification(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ExportError::Notification(format!(
                    "webhook returned {status}: {message}"
                )));
            }

            tracing::info!(recipient, "Notification delivered");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_sign_payload() {
            let a = WebhookNotifier::sign_payload("{}", "secret");
            assert_eq!(a.len(), 64);
            assert_eq!(a, WebhookNotifier::sign_payload("{}", "secret"));
            assert_ne!(a, WebhookNotifier::sign_payload("{}", "other"));
        }

        #[test]
        fn test_config_validation() {
            assert!(WebhookConfig::new("https://hooks.example.com/x").validate().is_ok());
            assert!(WebhookConfig::new("ftp://hooks.example.com").validate().is_err());
            assert!(WebhookConfig::new("not a url").validate().is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_notifier_never_fails() {
        TracingNotifier
            .notify("ops@example.com", "Export succeeded", "3 files")
            .await
            .unwrap();
    }
}
