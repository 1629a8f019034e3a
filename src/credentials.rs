//! Credential store shared by the HTTP transport and the hub client.
//!
//! The token pair is the only mutable state shared between the two
//! transports. It is always replaced wholesale; no caller ever mutates one
//! half of the pair in place.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Storage key for the persisted access token.
pub const ACCESS_TOKEN_KEY: &str = "eims_access_token";
/// Storage key for the persisted refresh token.
pub const REFRESH_TOKEN_KEY: &str = "eims_refresh_token";

/// The current access/refresh token pair.
///
/// The refresh half may be absent when the backend did not issue one; a 401
/// observed in that state skips refresh and terminates the session.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access: SecretString,
    pub refresh: Option<SecretString>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: SecretString::new(access.into()),
            refresh: refresh.map(SecretString::new),
        }
    }
}

/// Serialized form of the token pair for persistent storage.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoredTokens {
    #[serde(rename = "eims_access_token")]
    pub access_token: String,
    #[serde(rename = "eims_refresh_token", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Client-side persistent storage for the token pair.
///
/// Implementations persist and remove the pair as a whole.
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> io::Result<Option<StoredTokens>>;
    fn save(&self, tokens: &StoredTokens) -> io::Result<()>;
    fn clear(&self) -> io::Result<()>;
}

/// In-memory storage for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryTokenStorage {
    slot: Mutex<Option<StoredTokens>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn load(&self) -> io::Result<Option<StoredTokens>> {
        let slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(slot.clone())
    }

    fn save(&self, tokens: &StoredTokens) -> io::Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
        Ok(())
    }
}

/// JSON-file storage for desktop deployments.
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStorage for FileTokenStorage {
    fn load(&self) -> io::Result<Option<StoredTokens>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let tokens = serde_json::from_str(&raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(tokens))
    }

    fn save(&self, tokens: &StoredTokens) -> io::Result<()> {
        let raw = serde_json::to_string_pretty(tokens)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        std::fs::write(&self.path, raw)
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Shared handle to the current token pair.
///
/// Reads never block writers for longer than a pointer-sized clone; both
/// transports read the pair at attempt time rather than caching it.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    current: RwLock<Option<TokenPair>>,
    storage: Box<dyn TokenStorage>,
}

impl CredentialStore {
    /// Creates a store hydrated from persistent storage.
    pub fn new(storage: Box<dyn TokenStorage>) -> Self {
        let current = match storage.load() {
            Ok(stored) => stored.map(|tokens| TokenPair::new(tokens.access_token, tokens.refresh_token)),
            Err(err) => {
                warn!(event = "token_storage_load_failed", error = %err);
                None
            }
        };
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(current),
                storage,
            }),
        }
    }

    /// Replaces the whole pair and persists it.
    pub fn replace(&self, pair: TokenPair) {
        let stored = StoredTokens {
            access_token: pair.access.expose_secret().to_string(),
            refresh_token: pair
                .refresh
                .as_ref()
                .map(|token| token.expose_secret().to_string()),
        };
        if let Ok(mut guard) = self.inner.current.write() {
            *guard = Some(pair);
        }
        if let Err(err) = self.inner.storage.save(&stored) {
            warn!(event = "token_storage_save_failed", error = %err);
        }
    }

    /// Removes both tokens from memory and persistent storage.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.current.write() {
            *guard = None;
        }
        if let Err(err) = self.inner.storage.clear() {
            warn!(event = "token_storage_clear_failed", error = %err);
        }
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.inner
            .current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|pair| pair.access.clone()))
    }

    pub fn refresh_token(&self) -> Option<SecretString> {
        self.inner
            .current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|pair| pair.refresh.clone()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }
}
