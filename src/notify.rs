//! Out-of-band push notifications via Pushover.
//!
//! One-way messages only: 2FA prompts, success confirmations, and fatal
//! error reports. Delivery is bounded by a 10 second timeout and failures
//! are returned, never retried here.

use std::time::Duration;

use thiserror::Error;

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// What a notification is about; maps to the channel's priority scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Info,
    AuthRequired,
    AuthSuccess,
    Fatal,
}

impl NotifyKind {
    /// Pushover priority: -1 quiet, 0 normal, 1 bypasses quiet hours.
    fn priority(&self) -> i8 {
        match self {
            Self::Info => 0,
            Self::AuthRequired => 1,
            Self::AuthSuccess => -1,
            Self::Fatal => 1,
        }
    }
}

/// Pushover credentials, normally sourced from the configuration loader.
#[derive(Clone)]
pub struct PushoverConfig {
    pub api_token: String,
    pub user_key: String,
    pub device: Option<String>,
}

impl std::fmt::Debug for PushoverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushoverConfig")
            .field("api_token", &"<redacted>")
            .field("user_key", &"<redacted>")
            .field("device", &self.device)
            .finish()
    }
}

/// One-way notifier over the Pushover message API.
#[derive(Debug, Clone)]
pub struct PushoverNotifier {
    client: reqwest::Client,
    config: PushoverConfig,
}

impl PushoverNotifier {
    pub fn new(config: PushoverConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    /// Send one message. `url` becomes a tappable deep link on the device.
    pub async fn notify(
        &self,
        kind: NotifyKind,
        title: &str,
        body: &str,
        url: Option<&str>,
    ) -> Result<(), NotifyError> {
        let mut form: Vec<(&str, String)> = vec![
            ("token", self.config.api_token.clone()),
            ("user", self.config.user_key.clone()),
            ("title", title.to_string()),
            ("message", body.to_string()),
            ("priority", kind.priority().to_string()),
        ];
        if let Some(url) = url {
            form.push(("url", url.to_string()));
            form.push(("url_title", "Enter 2FA Code".to_string()));
        }
        if let Some(device) = &self.config.device {
            if !device.is_empty() {
                form.push(("device", device.clone()));
            }
        }

        let response = self
            .client
            .post(PUSHOVER_API_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if data["status"].as_i64() != Some(1) {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                message: data["errors"].to_string(),
            });
        }

        tracing::debug!("Notification sent ({:?}): {}", kind, title);
        Ok(())
    }

    /// 2FA prompt with a deep link to the local web interface.
    pub async fn notify_auth_required(&self, web_url: &str) -> Result<(), NotifyError> {
        self.notify(
            NotifyKind::AuthRequired,
            "iPhoto Downloader - 2FA Required",
            &format!(
                "2FA authentication required.\n\nOpen the link below to enter your 2FA code:\n{}",
                web_url
            ),
            Some(web_url),
        )
        .await
    }

    pub async fn notify_auth_success(&self) -> Result<(), NotifyError> {
        self.notify(
            NotifyKind::AuthSuccess,
            "iPhoto Downloader - Authentication Successful",
            "2FA authentication completed successfully. Photo sync will continue.",
            None,
        )
        .await
    }

    pub async fn notify_fatal(&self, message: &str) -> Result<(), NotifyError> {
        self.notify(
            NotifyKind::Fatal,
            "iPhoto Downloader - Critical Error",
            message,
            None,
        )
        .await
    }
}
