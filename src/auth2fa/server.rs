//! Loopback HTTP server for the 2FA flow.
//!
//! Handlers are thin: they take the machine mutex, transition, and hand
//! slow work (the cloud callbacks) to a spawned task so the 5 s endpoint
//! timeout can never abort a verification mid-flight.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::machine::{AuthState, Machine};
use super::pages;
use super::{AuthWebError, RequestOutcome, TwoFactorHooks, VerifyOutcome};

/// Submissions allowed per source IP per minute; excess gets 429.
const MAX_SUBMITS_PER_MINUTE: usize = 5;
/// Minimum spacing between cloud resend requests.
const REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Per-endpoint handler budget.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);

const CODE_LENGTH: usize = 6;

/// State shared between the handlers and the waiting engine.
pub(crate) struct Shared {
    machine: Mutex<Machine>,
    /// Signalled on every transition; `wait_for_outcome` sleeps on it.
    changed: Notify,
    hooks: Arc<dyn TwoFactorHooks>,
    submit_attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    last_request: Mutex<Option<Instant>>,
}

impl Shared {
    fn new(hooks: Arc<dyn TwoFactorHooks>) -> Self {
        Self {
            machine: Mutex::new(Machine::new()),
            changed: Notify::new(),
            hooks,
            submit_attempts: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
        }
    }

    pub(crate) fn set_state(&self, state: AuthState, message: impl Into<String>) {
        let mut machine = lock_recover(&self.machine);
        machine.transition(state, message);
        drop(machine);
        self.changed.notify_waiters();
    }

    fn accept_code(&self, code: &str) {
        let mut machine = lock_recover(&self.machine);
        machine.code = Some(code.to_string());
        machine.transition(AuthState::Success, "Authentication successful!");
        drop(machine);
        self.changed.notify_waiters();
    }

    /// Sliding one-minute window per source address.
    fn submit_rate_limited(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut map = lock_recover(&self.submit_attempts);
        let attempts = map.entry(ip).or_default();
        attempts.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if attempts.len() >= MAX_SUBMITS_PER_MINUTE {
            tracing::warn!("2FA submit rate limit exceeded for {}", ip);
            return true;
        }
        attempts.push(now);
        false
    }

    fn request_rate_limited(&self) -> bool {
        let now = Instant::now();
        let mut last = lock_recover(&self.last_request);
        if let Some(prev) = *last {
            if now.duration_since(prev) < REQUEST_MIN_INTERVAL {
                return true;
            }
        }
        *last = Some(now);
        false
    }
}

fn lock_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reject anything that is not a loopback address before it can be bound.
pub(crate) fn ensure_loopback(addr: IpAddr) -> Result<(), AuthWebError> {
    if addr.is_loopback() {
        Ok(())
    } else {
        Err(AuthWebError::NonLoopbackBind(addr))
    }
}

/// Bind the first free port in `range` on `addr`.
fn bind_in_range(
    addr: IpAddr,
    range: (u16, u16),
) -> Result<std::net::TcpListener, AuthWebError> {
    ensure_loopback(addr)?;
    for port in range.0..=range.1 {
        match std::net::TcpListener::bind(SocketAddr::new(addr, port)) {
            Ok(listener) => return Ok(listener),
            Err(_) => continue,
        }
    }
    Err(AuthWebError::NoPortAvailable {
        start: range.0,
        end: range.1,
    })
}

/// A live 2FA web server.
pub(crate) struct RunningServer {
    pub(crate) url: String,
    pub(crate) shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

pub(crate) async fn start(
    port_range: (u16, u16),
    hooks: Arc<dyn TwoFactorHooks>,
) -> Result<RunningServer, AuthWebError> {
    let addr: IpAddr = Ipv4Addr::LOCALHOST.into();
    let listener = bind_in_range(addr, port_range)?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let port = listener.local_addr()?.port();

    let shared = Arc::new(Shared::new(hooks));
    let app = Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/request", post(request_code))
        .route("/submit", post(submit_code))
        .layer(TimeoutLayer::new(ENDPOINT_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(shared.clone());

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(serve_cancel.cancelled_owned())
        .await
    });

    let url = format!("http://127.0.0.1:{}", port);
    tracing::info!("2FA web interface available at {}", url);
    Ok(RunningServer {
        url,
        shared,
        cancel,
        handle,
    })
}

impl RunningServer {
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        tracing::info!("2FA web server stopped");
    }

    /// Block until the machine reaches a terminal state, the timeout
    /// elapses, or the engine is cancelled from outside.
    pub(crate) async fn wait_for_outcome(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, super::TwoFactorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before inspecting state so a transition
            // between the check and the await is not lost.
            let notified = self.shared.changed.notified();

            {
                let machine = lock_recover(&self.shared.machine);
                match machine.state {
                    AuthState::Success => {
                        return Ok(machine.code.clone().unwrap_or_default());
                    }
                    AuthState::Failed => {
                        return Err(super::TwoFactorError::Failed(machine.message.clone()));
                    }
                    AuthState::Cancelled => return Err(super::TwoFactorError::Cancelled),
                    _ => {}
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.shared.set_state(
                        AuthState::Failed,
                        "Timed out waiting for the 2FA code.",
                    );
                    return Err(super::TwoFactorError::TimedOut);
                }
                _ = cancel.cancelled() => {
                    self.shared.set_state(AuthState::Cancelled, "Authentication cancelled.");
                    return Err(super::TwoFactorError::Cancelled);
                }
            }
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(pages::INDEX_HTML)
}

async fn status(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    let machine = lock_recover(&shared.machine);
    Json(json!({
        "state": machine.state.as_str(),
        "message": machine.message,
    }))
}

async fn request_code(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    if shared.request_rate_limited() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "accepted": false,
                "message": "A code was requested less than 30 seconds ago.",
            })),
        );
    }

    {
        let machine = lock_recover(&shared.machine);
        if machine.state.is_terminal() {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "accepted": false,
                    "message": "Authentication already finished.",
                })),
            );
        }
    }

    shared.set_state(AuthState::Requested, "Requesting a new code…");

    let task_shared = shared.clone();
    tokio::spawn(async move {
        match task_shared.hooks.request_code().await {
            RequestOutcome::Sent => task_shared.set_state(
                AuthState::AwaitingCode,
                "A new code was sent to your trusted devices.",
            ),
            RequestOutcome::RateLimited => task_shared.set_state(
                AuthState::Listening,
                "The service rate-limited the request. Wait a moment and try again.",
            ),
            RequestOutcome::Unavailable(reason) => task_shared.set_state(
                AuthState::Listening,
                format!("Could not request a code: {}", reason),
            ),
        }
    });

    (
        StatusCode::OK,
        Json(json!({ "accepted": true, "message": "Requesting a new code…" })),
    )
}

#[derive(Deserialize)]
struct SubmitBody {
    code: String,
}

async fn submit_code(
    State(shared): State<Arc<Shared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    if shared.submit_rate_limited(addr.ip()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "accepted": false,
                "message": "Too many attempts. Please wait before trying again.",
            })),
        );
    }

    let code = body.code.trim().to_string();
    if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
        // Format failures never touch the state machine.
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "accepted": false,
                "message": "The code must be exactly 6 digits.",
            })),
        );
    }

    {
        let machine = lock_recover(&shared.machine);
        if machine.state == AuthState::Validating {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "accepted": false,
                    "message": "A code is already being verified.",
                })),
            );
        }
        if machine.state.is_terminal() {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "accepted": false,
                    "message": "Authentication already finished.",
                })),
            );
        }
    }

    shared.set_state(AuthState::Validating, "Validating the code…");

    let task_shared = shared.clone();
    tokio::spawn(async move {
        match task_shared.hooks.verify_code(&code).await {
            VerifyOutcome::Accepted => task_shared.accept_code(&code),
            VerifyOutcome::Rejected => task_shared.set_state(
                AuthState::AwaitingCode,
                "Invalid 2FA code. Please try again.",
            ),
            VerifyOutcome::Unavailable(reason) => task_shared.set_state(
                AuthState::AwaitingCode,
                format!("Verification could not be completed: {}", reason),
            ),
        }
    });

    (
        StatusCode::OK,
        Json(json!({ "accepted": true, "message": "Validating the code…" })),
    )
}
