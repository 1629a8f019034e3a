//! Refresh coordinator.
//!
//! At most one refresh call is in flight at any time. The gate below is the
//! whole synchronization story: the first request through a 401 becomes the
//! leader and runs the refresh, every other request parks a oneshot in the
//! `Refreshing` arm and is settled exactly once with the leader's outcome.

use std::future::Future;
use std::sync::atomic::Ordering;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::api::{summarize_error_body, ApiError};
use crate::config::endpoints;
use crate::credentials::TokenPair;
use crate::events::SessionEvent;
use crate::session::SessionInner;

pub(crate) const SESSION_EXPIRED_REASON: &str = "session expired";

/// Shared result of one refresh cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RefreshOutcome {
    Refreshed,
    Failed,
}

enum GateState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

/// Single-flight gate over the refresh call.
pub(crate) struct RefreshGate {
    state: Mutex<GateState>,
}

impl RefreshGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
        }
    }

    /// Runs `refresh` if idle, otherwise waits for the in-flight run.
    ///
    /// Every caller observes the same outcome for a given cycle; queued
    /// waiters are drained whether the leader succeeds or fails.
    pub(crate) async fn coordinate<F, Fut>(&self, refresh: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let waiter = {
            let mut state = self.state.lock().await;
            match &mut *state {
                GateState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                GateState::Idle => {
                    *state = GateState::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            // A dropped sender means the leader's task died; nothing was
            // refreshed from this waiter's point of view.
            return rx.await.unwrap_or(RefreshOutcome::Failed);
        }

        let outcome = refresh().await;

        let waiters = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, GateState::Idle) {
                GateState::Refreshing { waiters } => waiters,
                GateState::Idle => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome);
        }

        outcome
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl SessionInner {
    /// Brings the stored credentials up to date, coordinating with any
    /// refresh that is already in flight.
    pub(crate) async fn ensure_refreshed(&self) -> Result<(), ApiError> {
        let Some(refresh_token) = self.credentials.refresh_token() else {
            // Nothing to refresh with: terminate instead of looping on 401s.
            self.force_logout(SESSION_EXPIRED_REASON);
            return Err(ApiError::SessionExpired {
                reason: "no refresh token stored".to_string(),
            });
        };

        match self
            .refresh_gate
            .coordinate(|| self.run_refresh(refresh_token))
            .await
        {
            RefreshOutcome::Refreshed => Ok(()),
            RefreshOutcome::Failed => Err(ApiError::SessionExpired {
                reason: SESSION_EXPIRED_REASON.to_string(),
            }),
        }
    }

    async fn run_refresh(&self, refresh_token: SecretString) -> RefreshOutcome {
        debug!(event = "token_refresh_started");
        match self.call_refresh_endpoint(&refresh_token).await {
            Ok(tokens) => {
                // Termination may have begun while the call was in flight;
                // its result is discarded rather than resurrecting tokens.
                if self.terminated.load(Ordering::SeqCst) {
                    warn!(event = "token_refresh_discarded");
                    return RefreshOutcome::Failed;
                }

                let refresh = tokens
                    .refresh_token
                    .map(SecretString::new)
                    .unwrap_or(refresh_token);
                self.credentials.replace(TokenPair {
                    access: SecretString::new(tokens.access_token),
                    refresh: Some(refresh),
                });
                debug!(event = "token_refresh_succeeded");
                RefreshOutcome::Refreshed
            }
            Err(err) => {
                warn!(event = "token_refresh_failed", error = %err);
                self.events.emit(SessionEvent::RefreshFailed {
                    reason: err.to_string(),
                });
                self.force_logout(SESSION_EXPIRED_REASON);
                RefreshOutcome::Failed
            }
        }
    }

    /// Calls the refresh endpoint directly, bypassing the access-token
    /// interceptor: the refresh token itself is the bearer credential and
    /// the body is empty by contract.
    async fn call_refresh_endpoint(
        &self,
        refresh_token: &SecretString,
    ) -> Result<RefreshResponse, ApiError> {
        let url = format!("{}{}", self.config.api_base_url(), endpoints::AUTH_REFRESH);
        let response = self
            .http
            .post(url)
            .timeout(self.config.request_timeout)
            .bearer_auth(refresh_token.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{RefreshGate, RefreshOutcome};

    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh_run() {
        let gate = Arc::new(RefreshGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                gate.coordinate(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    RefreshOutcome::Refreshed
                })
                .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), RefreshOutcome::Refreshed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_waiters_observe_the_leaders_failure() {
        let gate = Arc::new(RefreshGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                gate.coordinate(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    RefreshOutcome::Failed
                })
                .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), RefreshOutcome::Failed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gate_returns_to_idle_after_a_cycle() {
        let gate = RefreshGate::new();

        let first = gate.coordinate(|| async { RefreshOutcome::Failed }).await;
        assert_eq!(first, RefreshOutcome::Failed);

        // A later cycle runs its own leader rather than reusing the old one.
        let second = gate.coordinate(|| async { RefreshOutcome::Refreshed }).await;
        assert_eq!(second, RefreshOutcome::Refreshed);
    }
}
