//! Notification hub connection manager.
//!
//! The client spawns a background worker that owns the websocket. The worker
//! performs the handshake, forwards notification messages to the dispatch
//! registry, and re-establishes the connection after drops on a fixed
//! backoff ladder. Every attempt reads the credential store at attempt time,
//! so a token refreshed by the HTTP transport is used on the next reconnect.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::backoff::{sleep_unless_cancelled, ReconnectSchedule};
use crate::credentials::CredentialStore;
use crate::events::{SessionEvent, SessionEvents};
use crate::hub::proto::{ClientMessage, ServerMessage};
use crate::hub::registry::EventRegistry;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable connection lifecycle.
///
/// `Reconnecting` is only reachable from `Connected`; a manual disconnect
/// lands in `Disconnected` from any state and stays there.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HubState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Errors produced by hub transport and protocol handling.
#[derive(Debug, Error)]
pub enum HubError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),

    /// Hub protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Entry point for opening the hub connection.
pub struct HubClient {
    endpoint: String,
    credentials: CredentialStore,
    events: SessionEvents,
    registry: EventRegistry,
    schedule: ReconnectSchedule,
}

impl HubClient {
    pub fn new(
        endpoint: String,
        credentials: CredentialStore,
        events: SessionEvents,
        registry: EventRegistry,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            events,
            registry,
            schedule: ReconnectSchedule::default(),
        }
    }

    /// Overrides the reconnect schedule.
    pub fn with_schedule(mut self, schedule: ReconnectSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Opens the connection and spawns the background worker.
    ///
    /// Resolves once the initial handshake completes; an initial failure is
    /// returned to the caller rather than retried.
    pub async fn connect(self) -> Result<HubHandle, HubError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(HubState::Disconnected);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(hub_worker(self, state_tx, shutdown_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(HubHandle {
                shutdown: shutdown_tx,
                state: state_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HubError::Protocol(
                "hub worker stopped before initial connect".to_string(),
            )),
        }
    }
}

/// Handle to a running hub connection.
///
/// Dropping the handle also stops the worker.
pub struct HubHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<HubState>,
}

impl HubHandle {
    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == HubState::Connected
    }

    /// Watch channel for state transitions.
    pub fn state_watch(&self) -> watch::Receiver<HubState> {
        self.state.clone()
    }

    /// Stops the connection and cancels any pending reconnect timer.
    ///
    /// Safe to call from any state and at any number of times.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

enum SessionOutcome {
    Shutdown,
    Dropped,
}

async fn hub_worker(
    client: HubClient,
    state_tx: watch::Sender<HubState>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<Result<(), HubError>>,
) {
    let _ = state_tx.send(HubState::Connecting);
    let mut socket = match connect_once(&client).await {
        Ok(socket) => {
            let _ = ready_tx.send(Ok(()));
            socket
        }
        Err(err) => {
            let _ = state_tx.send(HubState::Disconnected);
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = state_tx.send(HubState::Connected);
    info!(event = "hub_connected");

    loop {
        match run_hub_session(&client, &mut socket, &mut shutdown_rx).await {
            SessionOutcome::Shutdown => {
                let _ = state_tx.send(HubState::Disconnected);
                client.events.emit(SessionEvent::HubDisconnected);
                info!(event = "hub_disconnected", reason = "manual");
                return;
            }
            SessionOutcome::Dropped => {
                warn!(event = "hub_connection_dropped");
                let _ = state_tx.send(HubState::Reconnecting);
                client.events.emit(SessionEvent::HubDisconnected);
            }
        }

        socket = match reconnect_with_backoff(&client, &mut shutdown_rx).await {
            Some(socket) => socket,
            None => {
                // Manual stop while a backoff timer was pending.
                let _ = state_tx.send(HubState::Disconnected);
                info!(event = "hub_disconnected", reason = "manual");
                return;
            }
        };
        let _ = state_tx.send(HubState::Connected);
        client.events.emit(SessionEvent::HubReconnected);
        info!(event = "hub_reconnected");
    }
}

/// Runs the backoff ladder until a connection is re-established.
///
/// Attempts are strictly sequential: the next one starts only after the
/// previous handshake resolved. Once the ladder is exhausted the worker
/// pauses for the reinitialization delay and starts a fresh cycle instead of
/// giving up, so a prolonged backend outage is survivable. Returns `None`
/// only on manual stop.
async fn reconnect_with_backoff(
    client: &HubClient,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<HubSocket> {
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        if attempt > client.schedule.max_attempts {
            warn!(
                event = "hub_retries_exhausted",
                attempts = client.schedule.max_attempts
            );
            if !sleep_unless_cancelled(client.schedule.reinit_delay, shutdown).await {
                return None;
            }
            attempt = 1;
        }

        let delay = client.schedule.delay_for_attempt(attempt);
        if !sleep_unless_cancelled(delay, shutdown).await {
            return None;
        }

        match connect_once(client).await {
            Ok(socket) => return Some(socket),
            Err(err) => {
                warn!(event = "hub_reconnect_failed", attempt, error = %err);
            }
        }
    }
}

/// One connection attempt: upgrade plus handshake.
///
/// The access token is read from the credential store here, at attempt time,
/// never cached across attempts. A missing token is not an error; the
/// attempt proceeds unauthenticated and the backend decides.
async fn connect_once(client: &HubClient) -> Result<HubSocket, HubError> {
    let mut request = client.endpoint.as_str().into_client_request()?;
    if let Some(token) = client.credentials.access_token() {
        let header = format!("Bearer {}", token.expose_secret()).parse()?;
        request.headers_mut().insert(AUTHORIZATION, header);
    }

    let (mut socket, _) = connect_async(request).await?;

    let first = recv_server_message(&mut socket).await?;
    if !matches!(first, ServerMessage::HelloOk { .. }) {
        return Err(HubError::Protocol(
            "expected first server message to be HelloOk".to_string(),
        ));
    }
    Ok(socket)
}

async fn run_hub_session(
    client: &HubClient,
    socket: &mut HubSocket,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately; consume it so the first ping goes
    // out one full interval after connect.
    keepalive.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                let stop = match changed {
                    Ok(()) => *shutdown.borrow(),
                    Err(_) => true,
                };
                if stop {
                    let _ = socket.close(None).await;
                    return SessionOutcome::Shutdown;
                }
            }
            _ = keepalive.tick() => {
                let ping = ClientMessage::Ping { client_time_ms: unix_time_ms() };
                if send_client_message(socket, &ping).await.is_err() {
                    return SessionOutcome::Dropped;
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_text(&text) {
                        Ok(message) => {
                            if let Some(event) = message.into_event() {
                                client.registry.dispatch(&event);
                            }
                        }
                        // Unknown message kinds are tolerated so the backend
                        // can add channels without breaking older clients.
                        Err(err) => {
                            warn!(event = "hub_message_decode_failed", error = %err);
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::Dropped;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return SessionOutcome::Dropped,
                    Some(Ok(_)) => return SessionOutcome::Dropped,
                    Some(Err(_)) => return SessionOutcome::Dropped,
                    None => return SessionOutcome::Dropped,
                }
            }
        }
    }
}

async fn recv_server_message(socket: &mut HubSocket) -> Result<ServerMessage, HubError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return ServerMessage::from_text(&text).map_err(HubError::Json)
            }
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(HubError::Protocol(
                    "socket closed before handshake completed".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(HubError::Protocol(
                    "received non-text frame before handshake completed".to_string(),
                ));
            }
            Some(Err(err)) => return Err(HubError::WebSocket(err)),
            None => {
                return Err(HubError::Protocol(
                    "socket ended before handshake completed".to_string(),
                ));
            }
        }
    }
}

async fn send_client_message(socket: &mut HubSocket, message: &ClientMessage) -> Result<(), HubError> {
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
