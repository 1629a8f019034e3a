//! Endpoint configuration shared by the HTTP transport and the hub client.

use std::time::Duration;

/// Production REST API base URL.
pub const API_BASE_URL: &str = "https://eims.site/api";
/// Local development REST API base URL.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:5214/api";
/// Production notification hub endpoint.
pub const HUB_ENDPOINT: &str = "wss://eims.site/hubs/notifications";
/// Local development notification hub endpoint.
pub const LOCAL_HUB_ENDPOINT: &str = "ws://localhost:5214/hubs/notifications";

/// Auth endpoint paths, relative to the API base URL.
pub mod endpoints {
    pub const AUTH_LOGIN: &str = "/Auth/login";
    pub const AUTH_REFRESH: &str = "/Auth/refresh";
    pub const AUTH_LOGOUT: &str = "/Auth/logout";
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Session-wide endpoint and timeout configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    local: bool,
    api_override: Option<String>,
    hub_override: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Creates a configuration for production mode.
    pub fn new() -> Self {
        Self {
            local: false,
            api_override: None,
            hub_override: None,
            request_timeout: SessionDefaults::REQUEST_TIMEOUT,
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
        }
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit API base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.api_override = Some(endpoint.trim().trim_end_matches('/').to_string());
        self
    }

    /// Sets an explicit hub endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_hub_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.hub_override = Some(endpoint.trim().to_string());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn api_base_url(&self) -> &str {
        if let Some(endpoint) = self.api_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }

    pub fn hub_endpoint(&self) -> &str {
        if let Some(endpoint) = self.hub_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_HUB_ENDPOINT
        } else {
            HUB_ENDPOINT
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
