//! Unverified JWT payload inspection.
//!
//! The backend signs its tokens; the client only reads claims for display
//! and expiry checks, so no signature verification happens here.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

/// Claims the backend is known to put in its access tokens.
///
/// The backend has emitted both casings for the subject and role claims over
/// time; both are accepted.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenClaims {
    #[serde(default, alias = "Sub")]
    pub sub: Option<String>,
    #[serde(default, rename = "userId", alias = "UserId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "Role")]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Expiration time in seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<u64>,
}

impl TokenClaims {
    /// Decodes the payload segment of a JWT without verifying the signature.
    ///
    /// Returns `None` for anything that is not a three-segment token with a
    /// base64url JSON payload.
    pub fn decode(token: &str) -> Option<Self> {
        let mut segments = token.split('.');
        let _header = segments.next()?;
        let payload = segments.next()?;
        let _signature = segments.next()?;
        if segments.next().is_some() {
            return None;
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Numeric user id from `sub`/`userId`, whichever is present.
    pub fn numeric_user_id(&self) -> Option<u64> {
        self.sub
            .as_deref()
            .or(self.user_id.as_deref())
            .and_then(|id| id.parse().ok())
    }

    /// Whether the token is still valid at `now` (seconds since epoch).
    ///
    /// A token without an `exp` claim is treated as invalid.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.exp.is_some_and(|exp| exp > now)
    }
}
