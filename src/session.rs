//! Session lifecycle: login, logout, forced termination, hub ownership.
//!
//! `Session` replaces the module-level singletons of earlier clients with a
//! constructible object so tests and tools can run any number of independent
//! sessions side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Method;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, RequestOptions};
use crate::claims::TokenClaims;
use crate::config::{endpoints, SessionConfig};
use crate::credentials::{CredentialStore, TokenPair, TokenStorage};
use crate::events::{SessionEvent, SessionEvents};
use crate::hub::client::{HubClient, HubError, HubHandle, HubState};
use crate::hub::proto::{HubChannel, HubEvent};
use crate::hub::registry::{EventRegistry, Subscription};
use crate::refresh::RefreshGate;

/// State shared between the transport, the refresh coordinator, and the hub.
pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) http: reqwest::Client,
    pub(crate) credentials: CredentialStore,
    pub(crate) events: SessionEvents,
    pub(crate) refresh_gate: RefreshGate,
    pub(crate) terminated: AtomicBool,
}

impl SessionInner {
    /// Terminates the session: one credential clear, one broadcast, no
    /// matter how many failing callers arrive here concurrently.
    pub(crate) fn force_logout(&self, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(event = "forced_logout_repeated", reason);
            return;
        }
        warn!(event = "forced_logout", reason);
        self.credentials.clear();
        self.events.emit(SessionEvent::ForcedLogout {
            reason: reason.to_string(),
        });
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(rename = "userID")]
    pub user_id: u64,
    pub full_name: String,
    pub email: String,
    pub role: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// One authenticated application session.
pub struct Session {
    inner: Arc<SessionInner>,
    registry: EventRegistry,
    hub: Mutex<Option<HubHandle>>,
}

impl Session {
    /// Builds a session over the given configuration and token storage.
    ///
    /// Credentials persisted by an earlier session are picked up here, so a
    /// restart resumes without a fresh login as long as the refresh token is
    /// still accepted by the backend.
    pub fn new(config: SessionConfig, storage: Box<dyn TokenStorage>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                http,
                credentials: CredentialStore::new(storage),
                events: SessionEvents::new(),
                refresh_gate: RefreshGate::new(),
                terminated: AtomicBool::new(false),
            }),
            registry: EventRegistry::new(),
            hub: Mutex::new(None),
        })
    }

    pub fn api(&self) -> ApiClient {
        ApiClient::new(Arc::clone(&self.inner))
    }

    pub fn events(&self) -> SessionEvents {
        self.inner.events.clone()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Subscribes a handler to one hub channel; dropping the returned
    /// subscription removes exactly that handler.
    pub fn subscribe<F>(&self, channel: HubChannel, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(channel, handler)
    }

    /// Authenticates and stores the returned token pair wholesale.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let response: LoginResponse = self.api().post(endpoints::AUTH_LOGIN, request).await?;
        self.inner.credentials.replace(TokenPair::new(
            response.access_token.clone(),
            response.refresh_token.clone(),
        ));
        // A fresh login re-arms the termination latch.
        self.inner.terminated.store(false, Ordering::SeqCst);
        Ok(response)
    }

    /// Ends the session: best-effort server-side logout, then local cleanup.
    ///
    /// Credentials are cleared and the hub is stopped even when the logout
    /// call itself fails; the error is still reported to the caller.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self
            .api()
            .execute(
                Method::POST,
                endpoints::AUTH_LOGOUT,
                Some(serde_json::json!({})),
                RequestOptions::default(),
            )
            .await;

        self.disconnect_hub();
        self.inner.credentials.clear();

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(event = "logout_request_failed", error = %err);
                Err(err)
            }
        }
    }

    /// Unilaterally terminates the session. Idempotent.
    pub fn force_logout(&self, reason: &str) {
        self.inner.force_logout(reason);
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.credentials.is_authenticated()
    }

    /// Claims decoded from the current access token, if one is stored and
    /// well-formed.
    pub fn token_claims(&self) -> Option<TokenClaims> {
        let token = self.inner.credentials.access_token()?;
        TokenClaims::decode(token.expose_secret())
    }

    /// Whether the stored access token exists and has not passed its `exp`.
    pub fn is_token_valid(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.token_claims()
            .map(|claims| claims.is_valid_at(now))
            .unwrap_or(false)
    }

    /// Starts the hub connection, replacing any previous one.
    ///
    /// The worker reads the credential store on every attempt, so tokens
    /// refreshed by the transport are picked up on the next reconnect.
    pub async fn connect_hub(&self) -> Result<(), HubError> {
        let client = HubClient::new(
            self.inner.config.hub_endpoint().to_string(),
            self.inner.credentials.clone(),
            self.inner.events.clone(),
            self.registry.clone(),
        );
        let handle = client.connect().await?;

        let mut slot = self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.disconnect();
        }
        Ok(())
    }

    /// Stops the hub connection and cancels any pending reconnect timer.
    pub fn disconnect_hub(&self) {
        let mut slot = self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.take() {
            handle.disconnect();
        }
    }

    pub fn hub_state(&self) -> HubState {
        let slot = self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref()
            .map(|handle| handle.state())
            .unwrap_or(HubState::Disconnected)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect_hub();
    }
}
