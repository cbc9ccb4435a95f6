//! Two-factor authentication coordinator.
//!
//! When the cloud session reports that a 6-digit code is required, the
//! coordinator starts a loopback-only web server, optionally pushes a
//! notification with the interface URL, and blocks the sync cycle until
//! the flow reaches a terminal state. The submitted code is verified
//! through capabilities supplied by the caller and never persisted.

pub mod machine;
mod pages;
mod server;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::notify::PushoverNotifier;
pub use machine::AuthState;

/// Default wait for the whole flow.
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(300);
/// Default local port range for the web interface.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8080, 8090);

/// Result of asking the cloud to resend a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Sent,
    RateLimited,
    Unavailable(String),
}

/// Result of verifying a submitted code against the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Accepted,
    Rejected,
    Unavailable(String),
}

/// Capabilities the coordinator needs from the cloud session. The sync
/// engine implements this over its `CloudSession`.
#[async_trait]
pub trait TwoFactorHooks: Send + Sync {
    /// Ask the service to push a fresh code to trusted devices.
    async fn request_code(&self) -> RequestOutcome;

    /// Verify a well-formed 6-digit code.
    async fn verify_code(&self, code: &str) -> VerifyOutcome;
}

/// Failures of the web server itself.
#[derive(Error, Debug)]
pub enum AuthWebError {
    #[error("no free port in range {start}-{end} for the 2FA web server")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("refusing to bind the 2FA server to non-loopback address {0}")]
    NonLoopbackBind(IpAddr),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why `obtain_code` did not produce a code.
#[derive(Error, Debug)]
pub enum TwoFactorError {
    #[error("timed out waiting for the 2FA code")]
    TimedOut,

    #[error("2FA flow cancelled")]
    Cancelled,

    #[error("2FA failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Web(#[from] AuthWebError),
}

/// Obtains a 6-digit code from a human via the local web interface.
pub struct TwoFactorCoordinator {
    port_range: (u16, u16),
    notifier: Option<PushoverNotifier>,
}

impl TwoFactorCoordinator {
    pub fn new(port_range: (u16, u16), notifier: Option<PushoverNotifier>) -> Self {
        Self {
            port_range,
            notifier,
        }
    }

    /// Run the full flow: start the server, notify, block until terminal.
    ///
    /// Returns the accepted code (already verified through
    /// [`TwoFactorHooks::verify_code`]) or the reason the flow ended.
    pub async fn obtain_code(
        &self,
        hooks: Arc<dyn TwoFactorHooks>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, TwoFactorError> {
        let running = server::start(self.port_range, hooks).await?;
        running.shared.set_state(
            AuthState::Listening,
            "Enter the 6-digit code from your trusted device, or request a new one.",
        );

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify_auth_required(&running.url).await {
                tracing::warn!("2FA notification failed: {}", e);
            }
        }

        let result = running.wait_for_outcome(timeout, cancel).await;

        if result.is_ok() {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.notify_auth_success().await {
                    tracing::warn!("2FA success notification failed: {}", e);
                }
            }
            // Let the page's next status poll render the terminal state
            // before the server goes away.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        running.shutdown().await;
        result
    }
}
