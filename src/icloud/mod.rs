//! Cloud session boundary: the capability surface the sync engine consumes
//! from iCloud, plus the persisted trusted-session store and a reqwest-backed
//! implementation.
//!
//! The engine only ever talks to [`CloudSession`]; tests substitute a fake.

pub mod client;
pub mod error;
pub mod session;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use client::WebCloudSession;
pub use error::{CloudError, DownloadError};
pub use session::SessionStore;

/// Album kind. Ordering puts personal albums before shared ones, which is
/// the album iteration order within a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlbumKind {
    Personal,
    Shared,
}

impl AlbumKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Shared => "shared",
        }
    }
}

/// A remote album. Rebuilt from the listing each cycle; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    /// User-visible name, unique within its kind.
    pub name: String,
    pub kind: AlbumKind,
    /// Advisory count from the listing; not relied upon.
    pub item_count: u64,
}

/// One photo from a remote album listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePhoto {
    /// Opaque identifier assigned by the service.
    pub remote_id: String,
    /// Filename as reported remotely, before local normalization.
    pub filename: String,
    /// Size in bytes; 0 when the service does not report one.
    pub size_bytes: u64,
    pub album_name: String,
    pub kind: AlbumKind,
}

/// Outcome of [`CloudSession::authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Fully authenticated; the engine may proceed.
    Ok,
    /// A 6-digit code must be obtained before the session is usable.
    TwoFactorRequired,
    /// Credentials were rejected. Fail fast, no back-off.
    InvalidCredentials,
    ServiceUnavailable,
}

/// Outcome of [`CloudSession::request_2fa`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCodeOutcome {
    Ok,
    RateLimited,
    ServiceUnavailable,
}

/// Outcome of [`CloudSession::verify_2fa`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyCodeOutcome {
    Ok,
    CodeInvalid,
    ServiceUnavailable,
}

/// Lazy, finite, non-restartable chunk stream for one download.
pub type PhotoByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// The remote service, reduced to the capabilities the engine needs.
///
/// None of these operations ever deletes anything remotely; the trait has
/// no method that could.
#[async_trait]
pub trait CloudSession: Send + Sync {
    /// Authenticate, preferring a persisted trusted session over any
    /// interactive flow.
    async fn authenticate(&self) -> AuthOutcome;

    /// Ask the service to push a fresh 2FA code to trusted devices.
    async fn request_2fa(&self) -> RequestCodeOutcome;

    /// Verify a 6-digit code previously delivered to a trusted device.
    async fn verify_2fa(&self, code: &str) -> VerifyCodeOutcome;

    /// Mark the session trusted so later runs skip 2FA. Best effort.
    async fn trust_session(&self);

    /// Enumerate albums of both kinds.
    async fn list_albums(&self) -> Result<Vec<Album>, CloudError>;

    /// Enumerate photos of one album. Restartable per call.
    async fn list_photos(&self, album: &Album) -> Result<Vec<RemotePhoto>, CloudError>;

    /// Open a byte stream for a photo. Not restartable mid-stream.
    async fn download(&self, remote_id: &str) -> Result<PhotoByteStream, DownloadError>;
}
