//! iphoto-downloader — sync photos from iCloud Photos to a local
//! directory tree.
//!
//! Three guarantees hold across every run: photos deleted locally are
//! never redownloaded, nothing is ever deleted from the cloud, and
//! repeated runs are idempotent. The durable state lives in an
//! album-aware SQLite tracker with integrity checks and rotating backups;
//! 2FA is completed through a loopback web interface with optional
//! Pushover notifications.

#![warn(clippy::all)]

mod auth2fa;
mod cli;
mod config;
mod filter;
mod icloud;
mod lock;
mod notify;
mod scheduler;
mod shutdown;
mod sync;
mod tracker;
mod types;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth2fa::TwoFactorCoordinator;
use config::Config;
use notify::PushoverNotifier;
use scheduler::{backoff::TwoFactorBackoff, Scheduler};
use sync::{CycleError, EngineConfig, PauseFlag, SyncEngine};
use tracker::Tracker;

/// Map a cycle failure onto the documented exit codes.
fn exit_code_for(error: &CycleError) -> i32 {
    match error {
        CycleError::Filter(_) | CycleError::WatchdogExpired => 1,
        CycleError::InvalidCredentials
        | CycleError::TwoFactorIncomplete(_)
        | CycleError::ServiceUnavailable(_) => 2,
        CycleError::Lock(_) => 3,
        CycleError::Tracker(_) => 4,
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = cli::Cli::parse();

    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenv::from_path(path) {
                eprintln!("Cannot read env file {}: {}", path.display(), e);
                return 1;
            }
        }
        None => {
            let _ = dotenv::dotenv();
        }
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return 1;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str())),
        )
        .init();
    tracing::info!("Starting iphoto-downloader");
    tracing::info!("Configuration: {:?}", config);

    let notifier = match config.pushover_config() {
        Some(pushover) => match PushoverNotifier::new(pushover) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                tracing::warn!("Pushover notifier unavailable: {}", e);
                None
            }
        },
        None => None,
    };

    if let Err(e) = std::fs::create_dir_all(&config.sync_directory) {
        eprintln!(
            "Cannot create sync directory {}: {}",
            config.sync_directory.display(),
            e
        );
        return 1;
    }

    let shutdown = match shutdown::install_signal_handler() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("Cannot install signal handlers: {}", e);
            return 1;
        }
    };

    let tracker = match Tracker::open(&config.tracker_db_path()).await {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            eprintln!("Tracker unavailable: {}", e);
            if let Some(notifier) = &notifier {
                let _ = notifier.notify_fatal(&format!("Tracker unavailable: {}", e)).await;
            }
            return 4;
        }
    };

    let session = match icloud::WebCloudSession::new(
        &icloud::session::default_session_dir(),
        &config.icloud_username,
    ) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            eprintln!("Cannot initialize cloud session: {}", e);
            return 1;
        }
    };

    let pause = Arc::new(PauseFlag::new());
    let coordinator = TwoFactorCoordinator::new(config.auth_web_port_range, notifier.clone());

    let mut engine_config = EngineConfig::new(
        config.sync_directory.clone(),
        config.lock_path(),
        config.album_rules(),
    );
    engine_config.dry_run = config.dry_run;
    engine_config.max_downloads = config.max_downloads;
    engine_config.max_file_size_mb = config.max_file_size_mb;
    engine_config.allow_multi_instance = config.allow_multi_instance;

    let engine = SyncEngine::new(
        engine_config,
        tracker.clone(),
        session,
        coordinator,
        shutdown.clone(),
        pause.clone(),
    );

    let scheduler = Scheduler::new(
        engine,
        tracker,
        notifier.clone(),
        shutdown,
        pause,
        config.execution_mode,
        config.sync_interval,
        config.maintenance_interval,
        TwoFactorBackoff::load_default(),
    );

    // The outermost guard: a panicked scheduler still produces a fatal
    // notification and a nonzero exit.
    match tokio::spawn(scheduler.run()).await {
        Ok(Ok(())) => {
            tracing::info!("Completed successfully");
            0
        }
        Ok(Err(e)) => {
            eprintln!("{}", e);
            exit_code_for(&e)
        }
        Err(join_error) => {
            tracing::error!("Unexpected failure in the sync loop: {}", join_error);
            eprintln!("Unexpected internal failure; see logs");
            if let Some(notifier) = &notifier {
                let _ = notifier
                    .notify_fatal("iphoto-downloader hit an unexpected internal failure")
                    .await;
            }
            1
        }
    }
}
