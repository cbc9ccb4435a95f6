//! The sync engine: one reconcile cycle end-to-end.
//!
//! A cycle takes the instance lock, backs up the tracker, authenticates
//! (driving the 2FA coordinator when needed), resolves the album filter,
//! and then walks every selected album comparing the remote listing
//! against the tracker and the filesystem. Photos deleted locally are
//! never fetched again, and nothing is ever deleted remotely.

pub mod file;
pub mod paths;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::auth2fa::{
    RequestOutcome, TwoFactorCoordinator, TwoFactorHooks, VerifyOutcome,
};
use crate::filter::{select_albums, AlbumRules, FilterError};
use crate::icloud::{
    AuthOutcome, CloudSession, RemotePhoto, RequestCodeOutcome, VerifyCodeOutcome,
};
use crate::lock::{InstanceLock, LockError};
use crate::tracker::{Tracker, TrackerError};

/// Counters for one cycle, logged as the end-of-cycle summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub total_photos: u64,
    pub new_downloads: u64,
    pub already_exists: u64,
    pub deleted_skipped: u64,
    pub errors: u64,
    pub bytes_downloaded: u64,
    /// True when the cycle stopped early on the shutdown signal.
    pub interrupted: bool,
}

/// Why a cycle aborted. The scheduler keys its policy off these kinds.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("authentication failed: invalid credentials")]
    InvalidCredentials,

    #[error("two-factor authentication incomplete: {0}")]
    TwoFactorIncomplete(String),

    #[error("cloud service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("sync cycle exceeded the watchdog deadline")]
    WatchdogExpired,
}

/// Pause signal raised by the scheduler during maintenance. The engine
/// observes it at every per-photo boundary.
pub struct PauseFlag {
    paused: AtomicBool,
    changed: Notify,
}

impl Default for PauseFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseFlag {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns promptly on resume or shutdown. The
    /// periodic wake is a backstop against a missed notification.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) {
        while self.is_paused() && !cancel.is_cancelled() {
            let notified = self.changed.notified();
            if !self.is_paused() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }
}

/// The subset of application configuration the engine consumes. Decoupled
/// from the loader so cycles are testable in isolation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sync_root: PathBuf,
    pub dry_run: bool,
    /// 0 = unlimited.
    pub max_downloads: u32,
    /// 0 = no cap; photos larger than this are skipped with a warning.
    pub max_file_size_mb: u64,
    pub rules: AlbumRules,
    pub allow_multi_instance: bool,
    pub lock_path: PathBuf,
    pub download_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub twofa_timeout: Duration,
}

impl EngineConfig {
    /// Defaults for everything but the paths and rules.
    pub fn new(sync_root: PathBuf, lock_path: PathBuf, rules: AlbumRules) -> Self {
        Self {
            sync_root,
            dry_run: false,
            max_downloads: 0,
            max_file_size_mb: 0,
            rules,
            allow_multi_instance: false,
            lock_path,
            download_timeout: Duration::from_secs(120),
            max_consecutive_failures: 5,
            twofa_timeout: crate::auth2fa::DEFAULT_CODE_TIMEOUT,
        }
    }
}

/// Adapter handing the coordinator the cloud's 2FA capabilities.
struct SessionHooks {
    session: Arc<dyn CloudSession>,
}

#[async_trait]
impl TwoFactorHooks for SessionHooks {
    async fn request_code(&self) -> RequestOutcome {
        match self.session.request_2fa().await {
            RequestCodeOutcome::Ok => RequestOutcome::Sent,
            RequestCodeOutcome::RateLimited => RequestOutcome::RateLimited,
            RequestCodeOutcome::ServiceUnavailable => {
                RequestOutcome::Unavailable("service unavailable".into())
            }
        }
    }

    async fn verify_code(&self, code: &str) -> VerifyOutcome {
        match self.session.verify_2fa(code).await {
            VerifyCodeOutcome::Ok => VerifyOutcome::Accepted,
            VerifyCodeOutcome::CodeInvalid => VerifyOutcome::Rejected,
            VerifyCodeOutcome::ServiceUnavailable => {
                VerifyOutcome::Unavailable("service unavailable".into())
            }
        }
    }
}

/// Drives one sync cycle at a time.
pub struct SyncEngine {
    config: EngineConfig,
    tracker: Arc<Tracker>,
    session: Arc<dyn CloudSession>,
    coordinator: TwoFactorCoordinator,
    shutdown: CancellationToken,
    pause: Arc<PauseFlag>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        tracker: Arc<Tracker>,
        session: Arc<dyn CloudSession>,
        coordinator: TwoFactorCoordinator,
        shutdown: CancellationToken,
        pause: Arc<PauseFlag>,
    ) -> Self {
        Self {
            config,
            tracker,
            session,
            coordinator,
            shutdown,
            pause,
        }
    }

    /// Run one full cycle. Per-photo errors stay per-photo; per-album
    /// errors abort the album; lock, tracker, authentication, and filter
    /// errors abort the cycle.
    pub async fn run_cycle(&self) -> Result<SyncStats, CycleError> {
        let _lock = if self.config.allow_multi_instance {
            None
        } else {
            Some(InstanceLock::acquire(&self.config.lock_path)?)
        };

        self.tracker.backup().await?;
        self.authenticate().await?;

        let discovered = self
            .session
            .list_albums()
            .await
            .map_err(|e| CycleError::ServiceUnavailable(e.to_string()))?;

        let mut selected = select_albums(&discovered, &self.config.rules)?;
        selected.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        tracing::info!("Syncing {} of {} albums", selected.len(), discovered.len());

        let mut stats = SyncStats::default();
        let mut downloads_this_cycle: u32 = 0;

        'albums: for album in &selected {
            if self.shutdown.is_cancelled() {
                stats.interrupted = true;
                break;
            }

            let album_dir_name = paths::sanitize_album_name(&album.name);
            let album_dir = self.config.sync_root.join(&album_dir_name);
            if let Err(e) = tokio::fs::create_dir_all(&album_dir).await {
                tracing::warn!(
                    "Cannot create album directory {}: {}; skipping album",
                    album_dir.display(),
                    e
                );
                stats.errors += 1;
                continue;
            }

            let photos = match self.session.list_photos(album).await {
                Ok(photos) => photos,
                Err(e) => {
                    tracing::warn!("Listing album '{}' failed: {}; skipping", album.name, e);
                    stats.errors += 1;
                    continue;
                }
            };

            let mut seen_filenames: HashSet<String> = HashSet::new();
            let mut consecutive_failures: u32 = 0;

            for photo in &photos {
                if self.shutdown.is_cancelled() {
                    stats.interrupted = true;
                    break 'albums;
                }
                self.pause.wait_while_paused(&self.shutdown).await;

                stats.total_photos += 1;

                let Some(filename) = paths::normalize_filename(&photo.filename) else {
                    tracing::warn!(
                        "Skipping photo {} with unusable filename {:?}",
                        photo.remote_id,
                        photo.filename
                    );
                    continue;
                };

                // Duplicates within one album: first wins.
                if !seen_filenames.insert(filename.clone()) {
                    tracing::warn!(
                        "Duplicate filename '{}' in album '{}'; keeping the first",
                        filename,
                        album.name
                    );
                    continue;
                }

                if self.config.max_file_size_mb > 0
                    && photo.size_bytes > self.config.max_file_size_mb * 1024 * 1024
                {
                    tracing::warn!(
                        "Skipping '{}' ({} bytes): over the {} MB cap",
                        filename,
                        photo.size_bytes,
                        self.config.max_file_size_mb
                    );
                    continue;
                }

                let relpath = format!("{}/{}", album_dir_name, filename);

                match self.tracker.get(&filename, &album.name).await? {
                    Some(record) if record.deleted_locally => {
                        tracing::debug!("Skipping locally deleted photo: {}", relpath);
                        stats.deleted_skipped += 1;
                        continue;
                    }
                    Some(record) => {
                        let local_path = self.config.sync_root.join(&record.local_relpath);
                        match tokio::fs::metadata(&local_path).await {
                            Ok(meta) => {
                                let size_matches =
                                    photo.size_bytes == 0 || meta.len() == photo.size_bytes;
                                if size_matches {
                                    tracing::debug!("Already downloaded: {}", relpath);
                                    stats.already_exists += 1;
                                    self.tracker.touch_seen(&filename, &album.name).await?;
                                    continue;
                                }
                                // Size changed remotely: fall through and
                                // fetch the current bytes.
                            }
                            Err(_) => {
                                // Downloaded before, gone now: the user
                                // deleted it. Honor that permanently.
                                tracing::info!("Detected local deletion: {}", relpath);
                                self.tracker.mark_deleted(&filename, &album.name).await?;
                                stats.deleted_skipped += 1;
                                continue;
                            }
                        }
                    }
                    None => {}
                }

                if self.config.dry_run {
                    tracing::info!("[DRY RUN] Would download: {}", relpath);
                    stats.new_downloads += 1;
                    stats.bytes_downloaded += photo.size_bytes;
                    downloads_this_cycle += 1;
                } else {
                    let final_path = album_dir.join(&filename);
                    match self.download_one(photo, &final_path).await {
                        Ok(bytes) => {
                            self.tracker
                                .record_download(
                                    &filename,
                                    &album.name,
                                    &photo.remote_id,
                                    bytes,
                                    &relpath,
                                )
                                .await?;
                            stats.new_downloads += 1;
                            stats.bytes_downloaded += bytes;
                            downloads_this_cycle += 1;
                            consecutive_failures = 0;
                            tracing::info!("Downloaded: {}", relpath);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to download {}: {}", relpath, e);
                            stats.errors += 1;
                            consecutive_failures += 1;
                            if consecutive_failures >= self.config.max_consecutive_failures {
                                tracing::warn!(
                                    "{} consecutive failures in album '{}'; skipping the rest",
                                    consecutive_failures,
                                    album.name
                                );
                                continue 'albums;
                            }
                        }
                    }
                }

                if self.config.max_downloads > 0
                    && downloads_this_cycle >= self.config.max_downloads
                {
                    tracing::info!("Reached download limit ({})", self.config.max_downloads);
                    break 'albums;
                }

                if stats.total_photos % 50 == 0 {
                    self.log_progress(&stats);
                }
            }
        }

        self.log_summary(&stats);
        Ok(stats)
    }

    /// Authenticate, driving the 2FA coordinator when required. On 2FA
    /// success the verify already happened through the submit hook; what
    /// remains is trusting the session for future runs.
    async fn authenticate(&self) -> Result<(), CycleError> {
        match self.session.authenticate().await {
            AuthOutcome::Ok => Ok(()),
            AuthOutcome::InvalidCredentials => Err(CycleError::InvalidCredentials),
            AuthOutcome::ServiceUnavailable => {
                Err(CycleError::ServiceUnavailable("authentication".into()))
            }
            AuthOutcome::TwoFactorRequired => {
                tracing::info!("Two-factor authentication required");
                let hooks = Arc::new(SessionHooks {
                    session: self.session.clone(),
                });
                match self
                    .coordinator
                    .obtain_code(hooks, self.config.twofa_timeout, &self.shutdown)
                    .await
                {
                    Ok(_code) => {
                        self.session.trust_session().await;
                        tracing::info!("2FA verification successful");
                        Ok(())
                    }
                    Err(e) => Err(CycleError::TwoFactorIncomplete(e.to_string())),
                }
            }
        }
    }

    async fn download_one(
        &self,
        photo: &RemotePhoto,
        final_path: &std::path::Path,
    ) -> Result<u64, crate::icloud::DownloadError> {
        let stream = self.session.download(&photo.remote_id).await?;
        file::download_to_file(
            stream,
            final_path,
            photo.size_bytes,
            self.config.download_timeout,
        )
        .await
    }

    fn log_progress(&self, stats: &SyncStats) {
        tracing::info!(
            "Progress: {} processed, {} downloaded, {} existed, {} deleted, {} errors",
            stats.total_photos,
            stats.new_downloads,
            stats.already_exists,
            stats.deleted_skipped,
            stats.errors
        );
    }

    fn log_summary(&self, stats: &SyncStats) {
        tracing::info!(
            "Sync summary: {} photos processed, {} new downloads, {} already existed, \
             {} deleted (skipped), {} errors, {:.1} MB downloaded{}",
            stats.total_photos,
            stats.new_downloads,
            stats.already_exists,
            stats.deleted_skipped,
            stats.errors,
            stats.bytes_downloaded as f64 / (1024.0 * 1024.0),
            if self.config.dry_run {
                " [DRY RUN]"
            } else {
                ""
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures_util::stream;
    use tempfile::TempDir;

    use crate::icloud::{Album, AlbumKind, CloudError, DownloadError, PhotoByteStream};

    /// In-memory stand-in for the remote service.
    struct FakeCloudSession {
        albums: Vec<Album>,
        photos: HashMap<String, Vec<RemotePhoto>>,
        content: HashMap<String, Vec<u8>>,
        /// Outcomes popped per authenticate() call; empty = Ok.
        auth_script: Mutex<Vec<AuthOutcome>>,
        accepted_code: &'static str,
        verify_calls: AtomicUsize,
        trust_calls: AtomicUsize,
    }

    impl FakeCloudSession {
        fn new() -> Self {
            Self {
                albums: Vec::new(),
                photos: HashMap::new(),
                content: HashMap::new(),
                auth_script: Mutex::new(Vec::new()),
                accepted_code: "123456",
                verify_calls: AtomicUsize::new(0),
                trust_calls: AtomicUsize::new(0),
            }
        }

        fn with_album(mut self, name: &str, kind: AlbumKind) -> Self {
            self.albums.push(Album {
                name: name.to_string(),
                kind,
                item_count: 0,
            });
            self.photos.entry(name.to_string()).or_default();
            self
        }

        fn with_photo(mut self, album: &str, remote_id: &str, filename: &str, body: &[u8]) -> Self {
            self.photos.entry(album.to_string()).or_default().push(RemotePhoto {
                remote_id: remote_id.to_string(),
                filename: filename.to_string(),
                size_bytes: body.len() as u64,
                album_name: album.to_string(),
                kind: AlbumKind::Personal,
            });
            self.content.insert(remote_id.to_string(), body.to_vec());
            self
        }

        /// A listed photo whose bytes cannot be fetched.
        fn with_broken_photo(mut self, album: &str, remote_id: &str, filename: &str) -> Self {
            self.photos.entry(album.to_string()).or_default().push(RemotePhoto {
                remote_id: remote_id.to_string(),
                filename: filename.to_string(),
                size_bytes: 10,
                album_name: album.to_string(),
                kind: AlbumKind::Personal,
            });
            self
        }

        fn with_auth_script(self, outcomes: Vec<AuthOutcome>) -> Self {
            *self.auth_script.lock().unwrap() = outcomes;
            self
        }
    }

    #[async_trait]
    impl CloudSession for FakeCloudSession {
        async fn authenticate(&self) -> AuthOutcome {
            let mut script = self.auth_script.lock().unwrap();
            if script.is_empty() {
                AuthOutcome::Ok
            } else {
                script.remove(0)
            }
        }

        async fn request_2fa(&self) -> RequestCodeOutcome {
            RequestCodeOutcome::Ok
        }

        async fn verify_2fa(&self, code: &str) -> VerifyCodeOutcome {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if code == self.accepted_code {
                VerifyCodeOutcome::Ok
            } else {
                VerifyCodeOutcome::CodeInvalid
            }
        }

        async fn trust_session(&self) {
            self.trust_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn list_albums(&self) -> Result<Vec<Album>, CloudError> {
            Ok(self.albums.clone())
        }

        async fn list_photos(&self, album: &Album) -> Result<Vec<RemotePhoto>, CloudError> {
            Ok(self.photos.get(&album.name).cloned().unwrap_or_default())
        }

        async fn download(&self, remote_id: &str) -> Result<PhotoByteStream, DownloadError> {
            let body = self
                .content
                .get(remote_id)
                .cloned()
                .ok_or_else(|| DownloadError::NotFound(remote_id.to_string()))?;
            let chunks: Vec<Result<Bytes, DownloadError>> = body
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    struct Fixture {
        tmp: TempDir,
        tracker: Arc<Tracker>,
        shutdown: CancellationToken,
        pause: Arc<PauseFlag>,
    }

    impl Fixture {
        async fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let tracker = Arc::new(
                Tracker::open(&tmp.path().join("data").join("deletion_tracker.db"))
                    .await
                    .unwrap(),
            );
            Self {
                tmp,
                tracker,
                shutdown: CancellationToken::new(),
                pause: Arc::new(PauseFlag::new()),
            }
        }

        fn sync_root(&self) -> PathBuf {
            self.tmp.path().join("photos")
        }

        fn config(&self) -> EngineConfig {
            EngineConfig::new(
                self.sync_root(),
                self.tmp.path().join("iphoto_downloader.lock"),
                AlbumRules {
                    include_personal: true,
                    include_shared: true,
                    ..Default::default()
                },
            )
        }

        fn engine(&self, config: EngineConfig, session: Arc<dyn CloudSession>) -> SyncEngine {
            self.engine_with_ports(config, session, (18200, 18239))
        }

        fn engine_with_ports(
            &self,
            config: EngineConfig,
            session: Arc<dyn CloudSession>,
            ports: (u16, u16),
        ) -> SyncEngine {
            SyncEngine::new(
                config,
                self.tracker.clone(),
                session,
                TwoFactorCoordinator::new(ports, None),
                self.shutdown.clone(),
                self.pause.clone(),
            )
        }
    }

    #[tokio::test]
    async fn fresh_sync_downloads_photo() {
        let fx = Fixture::new().await;
        let body = vec![0xAB; 1024];
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", &body),
        );
        let engine = fx.engine(fx.config(), session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert_eq!(stats.bytes_downloaded, 1024);

        let file = fx.sync_root().join("Trip").join("IMG_1.JPG");
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 1024);

        let record = fx.tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert!(!record.deleted_locally);
        assert_eq!(record.remote_id, "r1");
        assert_eq!(record.local_relpath, "Trip/IMG_1.JPG");
    }

    #[tokio::test]
    async fn local_deletion_is_respected() {
        let fx = Fixture::new().await;
        let body = vec![0xAB; 1024];
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", &body),
        );
        let engine = fx.engine(fx.config(), session);
        engine.run_cycle().await.unwrap();

        let file = fx.sync_root().join("Trip").join("IMG_1.JPG");
        std::fs::remove_file(&file).unwrap();

        // Second cycle: deletion detected and honored
        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 0);
        assert_eq!(stats.deleted_skipped, 1);
        assert!(!file.exists());
        let record = fx.tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert!(record.deleted_locally);

        // Third cycle: still skipped, still no file
        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 0);
        assert_eq!(stats.deleted_skipped, 1);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn repeated_cycles_are_idempotent() {
        let fx = Fixture::new().await;
        let body = vec![0xAB; 1024];
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", &body),
        );
        let engine = fx.engine(fx.config(), session);
        engine.run_cycle().await.unwrap();

        let file = fx.sync_root().join("Trip").join("IMG_1.JPG");
        let mtime_before = std::fs::metadata(&file).unwrap().modified().unwrap();

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 0);
        assert_eq!(stats.bytes_downloaded, 0);
        assert_eq!(stats.already_exists, 1);
        assert_eq!(
            std::fs::metadata(&file).unwrap().modified().unwrap(),
            mtime_before
        );
    }

    #[tokio::test]
    async fn allowlist_limits_albums() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Keep", AlbumKind::Personal)
                .with_album("Skip", AlbumKind::Personal)
                .with_photo("Keep", "k1", "keep.jpg", b"keep")
                .with_photo("Skip", "s1", "skip.jpg", b"skip"),
        );
        let mut config = fx.config();
        config.rules.personal_allowlist = vec!["Keep".to_string()];
        let engine = fx.engine(config, session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert!(fx.sync_root().join("Keep").join("keep.jpg").exists());
        assert!(!fx.sync_root().join("Skip").exists());
        assert!(fx.tracker.get("skip.jpg", "Skip").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_configured_album_aborts_cycle() {
        let fx = Fixture::new().await;
        let session = Arc::new(FakeCloudSession::new().with_album("Keep", AlbumKind::Personal));
        let mut config = fx.config();
        config.rules.personal_allowlist = vec!["Ghost".to_string()];
        let engine = fx.engine(config, session);

        let result = engine.run_cycle().await;
        assert!(matches!(
            result,
            Err(CycleError::Filter(FilterError::ConfiguredAlbumMissing(name))) if name == "Ghost"
        ));
    }

    #[tokio::test]
    async fn same_filename_in_two_albums_downloads_twice() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_album("Home", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", b"trip bytes")
                .with_photo("Home", "r2", "IMG_1.JPG", b"home bytes!"),
        );
        let engine = fx.engine(fx.config(), session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 2);
        assert_eq!(
            std::fs::read(fx.sync_root().join("Trip").join("IMG_1.JPG")).unwrap(),
            b"trip bytes"
        );
        assert_eq!(
            std::fs::read(fx.sync_root().join("Home").join("IMG_1.JPG")).unwrap(),
            b"home bytes!"
        );
    }

    #[tokio::test]
    async fn duplicate_filename_within_album_first_wins() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", b"first")
                .with_photo("Trip", "r2", "IMG_1.JPG", b"second!"),
        );
        let engine = fx.engine(fx.config(), session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert_eq!(
            std::fs::read(fx.sync_root().join("Trip").join("IMG_1.JPG")).unwrap(),
            b"first"
        );
        let record = fx.tracker.get("IMG_1.JPG", "Trip").await.unwrap().unwrap();
        assert_eq!(record.remote_id, "r1");
    }

    #[tokio::test]
    async fn unusable_filenames_are_skipped() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "...", b"dots")
                .with_photo("Trip", "r2", "name .  ", b"trimmed"),
        );
        let engine = fx.engine(fx.config(), session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert!(fx.sync_root().join("Trip").join("name").exists());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", &vec![0u8; 512]),
        );
        let mut config = fx.config();
        config.dry_run = true;
        let engine = fx.engine(config, session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert_eq!(stats.bytes_downloaded, 512);
        assert!(!fx.sync_root().join("Trip").join("IMG_1.JPG").exists());
        assert!(fx.tracker.get("IMG_1.JPG", "Trip").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consecutive_failures_abandon_album() {
        let fx = Fixture::new().await;
        let mut fake = FakeCloudSession::new().with_album("Trip", AlbumKind::Personal);
        for i in 0..7 {
            fake = fake.with_broken_photo("Trip", &format!("r{}", i), &format!("img_{}.jpg", i));
        }
        let session = Arc::new(fake);
        let engine = fx.engine(fx.config(), session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.errors, 5);
        assert_eq!(stats.new_downloads, 0);
    }

    #[tokio::test]
    async fn download_limit_caps_the_cycle() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "a.jpg", b"aaaa")
                .with_photo("Trip", "r2", "b.jpg", b"bbbb"),
        );
        let mut config = fx.config();
        config.max_downloads = 1;
        let engine = fx.engine(config, session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 1);
    }

    #[tokio::test]
    async fn oversized_photos_are_skipped() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "big.jpg", &vec![0u8; 2 * 1024 * 1024]),
        );
        let mut config = fx.config();
        config.max_file_size_mb = 1;
        let engine = fx.engine(config, session);

        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.new_downloads, 0);
        assert!(!fx.sync_root().join("Trip").join("big.jpg").exists());
    }

    #[tokio::test]
    async fn second_instance_is_rejected() {
        let fx = Fixture::new().await;
        let session = Arc::new(FakeCloudSession::new().with_album("Trip", AlbumKind::Personal));
        let config = fx.config();
        let _held = InstanceLock::acquire(&config.lock_path).unwrap();
        let engine = fx.engine(config, session);

        let result = engine.run_cycle().await;
        assert!(matches!(result, Err(CycleError::Lock(_))));
    }

    #[tokio::test]
    async fn invalid_credentials_abort_cycle() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_auth_script(vec![AuthOutcome::InvalidCredentials]),
        );
        let engine = fx.engine(fx.config(), session);
        let result = engine.run_cycle().await;
        assert!(matches!(result, Err(CycleError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn two_factor_flow_end_to_end() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_album("Trip", AlbumKind::Personal)
                .with_photo("Trip", "r1", "IMG_1.JPG", b"bytes")
                .with_auth_script(vec![AuthOutcome::TwoFactorRequired]),
        );
        let engine = fx.engine(fx.config(), session.clone());

        let cycle = tokio::spawn(async move { engine.run_cycle().await });

        // Find the coordinator in its port range, then act as the human.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let mut base_url = None;
        'outer: for _ in 0..100 {
            for port in 18200..18240 {
                let url = format!("http://127.0.0.1:{}", port);
                if let Ok(resp) = client.get(format!("{}/status", url)).send().await {
                    if resp.status().is_success() {
                        base_url = Some(url);
                        break 'outer;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let base_url = base_url.expect("2FA web server never came up");

        let resp = client
            .post(format!("{}/submit", base_url))
            .json(&serde_json::json!({ "code": "123456" }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let stats = cycle.await.unwrap().unwrap();
        assert_eq!(stats.new_downloads, 1);
        assert_eq!(session.verify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.trust_calls.load(Ordering::SeqCst), 1);
        assert!(fx.sync_root().join("Trip").join("IMG_1.JPG").exists());

        // Restart: trusted session, no second 2FA prompt.
        let engine = fx.engine(fx.config(), session.clone());
        let stats = engine.run_cycle().await.unwrap();
        assert_eq!(stats.already_exists, 1);
        assert_eq!(session.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_factor_timeout_aborts_cycle() {
        let fx = Fixture::new().await;
        let session = Arc::new(
            FakeCloudSession::new()
                .with_auth_script(vec![AuthOutcome::TwoFactorRequired]),
        );
        let mut config = fx.config();
        config.twofa_timeout = Duration::from_millis(100);
        // Own port range so the end-to-end 2FA test cannot talk to this
        // server by accident.
        let engine = fx.engine_with_ports(config, session, (18300, 18319));

        let result = engine.run_cycle().await;
        assert!(matches!(result, Err(CycleError::TwoFactorIncomplete(_))));
    }

    #[tokio::test]
    async fn pause_flag_blocks_and_releases() {
        let pause = PauseFlag::new();
        let cancel = CancellationToken::new();

        // Not paused: returns immediately
        pause.wait_while_paused(&cancel).await;

        pause.pause();
        assert!(pause.is_paused());
        let flag = Arc::new(pause);
        let waiter_flag = flag.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_flag.wait_while_paused(&waiter_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        flag.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }
}
