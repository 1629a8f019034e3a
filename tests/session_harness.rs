//! Refresh-protocol integration tests against a mock backend.
//!
//! The mock serves the auth endpoints, one business endpoint, and the
//! notification hub on a single local listener so the end-to-end scenario
//! can exercise both transports together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

use eims_session::api::ApiError;
use eims_session::config::SessionConfig;
use eims_session::credentials::{MemoryTokenStorage, TokenPair};
use eims_session::events::SessionEvent;
use eims_session::hub::client::HubState;
use eims_session::session::{LoginRequest, Session};

const INITIAL_ACCESS: &str = "access-1";
const INITIAL_REFRESH: &str = "refresh-1";
const REFRESHED_ACCESS: &str = "access-2";
const REFRESHED_REFRESH: &str = "refresh-2";
const STALE_ACCESS: &str = "access-stale";
const REFRESH_LATENCY: Duration = Duration::from_millis(100);

struct BackendState {
    /// Access token the business endpoint currently accepts.
    valid_access: Mutex<String>,
    refresh_calls: AtomicUsize,
    refresh_fails: bool,
    /// When set, the business endpoint rejects every bearer, including a
    /// freshly refreshed one.
    business_always_unauthorized: bool,
    hub_connections: AtomicUsize,
}

impl BackendState {
    fn new() -> Self {
        Self {
            valid_access: Mutex::new(INITIAL_ACCESS.to_string()),
            refresh_calls: AtomicUsize::new(0),
            refresh_fails: false,
            business_always_unauthorized: false,
            hub_connections: AtomicUsize::new(0),
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn login_handler(
    State(state): State<Arc<BackendState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if payload.get("email").and_then(Value::as_str) != Some("accountant@eims.site") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "invalid credentials"})),
        );
    }
    if let Ok(mut valid) = state.valid_access.lock() {
        *valid = INITIAL_ACCESS.to_string();
    }
    (
        StatusCode::OK,
        Json(json!({
            "userID": 17,
            "fullName": "Test Accountant",
            "email": "accountant@eims.site",
            "role": "Accountant",
            "accessToken": INITIAL_ACCESS,
            "refreshToken": INITIAL_REFRESH,
        })),
    )
}

async fn refresh_handler(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    // Widen the refresh window so concurrent 401s pile up behind one call.
    tokio::time::sleep(REFRESH_LATENCY).await;

    if state.refresh_fails || bearer(&headers).as_deref() != Some(INITIAL_REFRESH) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "refresh token rejected"})),
        );
    }

    if let Ok(mut valid) = state.valid_access.lock() {
        *valid = REFRESHED_ACCESS.to_string();
    }
    (
        StatusCode::OK,
        Json(json!({
            "accessToken": REFRESHED_ACCESS,
            "refreshToken": REFRESHED_REFRESH,
        })),
    )
}

async fn logout_handler(
    State(_state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if bearer(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    (StatusCode::OK, Json(json!({})))
}

async fn invoices_handler(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let valid = state
        .valid_access
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default();
    let authorized =
        !state.business_always_unauthorized && bearer(&headers).as_deref() == Some(valid.as_str());
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "unauthorized"})),
        );
    }
    (StatusCode::OK, Json(json!({"items": [{"invoiceId": 1}]})))
}

async fn hub_handler(
    State(state): State<Arc<BackendState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    state.hub_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|mut socket| async move {
        let hello = json!({
            "type": "HelloOk",
            "connectionId": "conn-1",
            "serverTimeMs": 1_700_000_000_000_u64,
        });
        if socket.send(Message::Text(hello.to_string())).await.is_err() {
            return;
        }
        // Hold the connection open until the client goes away.
        while let Some(Ok(frame)) = socket.recv().await {
            if let Message::Ping(payload) = frame {
                let _ = socket.send(Message::Pong(payload)).await;
            }
        }
    })
}

async fn spawn_backend(
    state: Arc<BackendState>,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/Auth/login", post(login_handler))
        .route("/Auth/refresh", post(refresh_handler))
        .route("/Auth/logout", post(logout_handler))
        .route("/Invoice", get(invoices_handler))
        .route("/hubs/notifications", get(hub_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend listener");
    let addr = listener
        .local_addr()
        .expect("read mock backend listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock backend should run");
    });
    (addr, shutdown_tx, task)
}

fn session_for(addr: SocketAddr) -> Session {
    let config = SessionConfig::new()
        .with_api_endpoint(format!("http://{addr}"))
        .with_hub_endpoint(format!("ws://{addr}/hubs/notifications"));
    Session::new(config, Box::new(MemoryTokenStorage::new())).expect("build session")
}

fn seed_stale_credentials(session: &Session) {
    session.credentials().replace(TokenPair::new(
        STALE_ACCESS,
        Some(INITIAL_REFRESH.to_string()),
    ));
}

fn drain_forced_logouts(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::ForcedLogout { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_401s_share_exactly_one_refresh() {
    let state = Arc::new(BackendState::new());
    let (addr, shutdown_tx, server_task) = spawn_backend(Arc::clone(&state)).await;

    let session = Arc::new(session_for(addr));
    seed_stale_credentials(&session);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session.api().get::<Value>("/Invoice").await
        }));
    }
    for task in tasks {
        let body = task
            .await
            .expect("join request task")
            .expect("request should succeed after refresh");
        assert_eq!(
            body.get("items").and_then(Value::as_array).map(Vec::len),
            Some(1)
        );
    }

    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock backend task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_failure_rejects_all_queued_callers_and_terminates_once() {
    let mut backend = BackendState::new();
    backend.refresh_fails = true;
    let state = Arc::new(backend);
    let (addr, shutdown_tx, server_task) = spawn_backend(Arc::clone(&state)).await;

    let session = Arc::new(session_for(addr));
    seed_stale_credentials(&session);
    let mut events = session.events().subscribe();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session.api().get::<Value>("/Invoice").await
        }));
    }
    for task in tasks {
        let result = task.await.expect("join request task");
        match result {
            Err(ApiError::SessionExpired { .. }) => {}
            other => panic!("expected SessionExpired, got {other:?}"),
        }
    }

    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(!session.is_authenticated(), "tokens must be cleared");
    assert_eq!(
        drain_forced_logouts(&mut events),
        1,
        "exactly one termination broadcast"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock backend task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_401_on_the_replayed_request_is_terminal() {
    let mut backend = BackendState::new();
    backend.business_always_unauthorized = true;
    let state = Arc::new(backend);
    let (addr, shutdown_tx, server_task) = spawn_backend(Arc::clone(&state)).await;

    let session = session_for(addr);
    seed_stale_credentials(&session);

    let result = session.api().get::<Value>("/Invoice").await;
    match result {
        Err(ApiError::HttpStatus { status, .. }) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected terminal 401, got {other:?}"),
    }
    assert_eq!(
        state.refresh_calls.load(Ordering::SeqCst),
        1,
        "the replayed 401 must not trigger a second refresh"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock backend task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_refresh_token_skips_refresh_and_terminates() {
    let state = Arc::new(BackendState::new());
    let (addr, shutdown_tx, server_task) = spawn_backend(Arc::clone(&state)).await;

    let session = session_for(addr);
    session
        .credentials()
        .replace(TokenPair::new(STALE_ACCESS, None));
    let mut events = session.events().subscribe();

    let result = session.api().get::<Value>("/Invoice").await;
    match result {
        Err(ApiError::SessionExpired { .. }) => {}
        other => panic!("expected SessionExpired, got {other:?}"),
    }
    assert_eq!(
        state.refresh_calls.load(Ordering::SeqCst),
        0,
        "no refresh attempt without a refresh token"
    );
    assert_eq!(drain_forced_logouts(&mut events), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock backend task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_to_end_login_refresh_replay_logout() {
    let state = Arc::new(BackendState::new());
    let (addr, shutdown_tx, server_task) = spawn_backend(Arc::clone(&state)).await;

    let session = session_for(addr);

    // Login stores the pair.
    let login = session
        .login(&LoginRequest {
            email: "accountant@eims.site".to_string(),
            password: "hunter2".to_string(),
        })
        .await
        .expect("login");
    assert_eq!(login.user_id, 17);
    assert!(session.is_authenticated());

    session.connect_hub().await.expect("connect hub");
    assert_eq!(session.hub_state(), HubState::Connected);
    assert_eq!(state.hub_connections.load(Ordering::SeqCst), 1);

    // Expire the access token server-side; the next call must refresh and
    // replay transparently.
    if let Ok(mut valid) = state.valid_access.lock() {
        *valid = REFRESHED_ACCESS.to_string();
    }
    let body = session
        .api()
        .get::<Value>("/Invoice")
        .await
        .expect("business call after expiry");
    assert!(body.get("items").is_some());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);

    session.logout().await.expect("logout");
    assert!(!session.is_authenticated());

    // The hub must stop without scheduling another attempt.
    let deadline = timeout(Duration::from_secs(1), async {
        while session.hub_state() != HubState::Disconnected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(deadline.is_ok(), "hub should reach Disconnected after logout");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        state.hub_connections.load(Ordering::SeqCst),
        1,
        "no reconnect attempt after a deliberate logout"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock backend task should join");
}
