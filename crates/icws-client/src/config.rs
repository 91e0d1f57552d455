//! Client configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::IcwsError;

/// Default application name reported at login.
pub const DEFAULT_APPLICATION_NAME: &str = "ICWS Rust Client";

/// Default ICWS port.
pub const DEFAULT_PORT: u16 = 8018;

/// Default interval between message feed polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Overall timeout applied to every request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// URI scheme used to reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = IcwsError;

    /// Accepts `http`, `https`, and the `http://` / `https://` prefixes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches("://").to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(IcwsError::Config(format!("unsupported scheme: {other}"))),
        }
    }
}

/// A custom header added to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
}

/// Connection settings for an ICWS server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name reported to the server at login.
    pub application_name: String,
    /// Server hostname or IP address.
    pub server: String,
    pub port: u16,
    pub scheme: Scheme,
    /// Headers sent with every request. Per-request headers override these.
    pub custom_headers: Vec<CustomHeader>,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Accept self-signed certificates when using https.
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            server: String::new(),
            port: DEFAULT_PORT,
            scheme: Scheme::Http,
            custom_headers: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            accept_invalid_certs: true,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given server with defaults elsewhere.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push(CustomHeader {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check that the configuration can reach a server.
    pub fn validate(&self) -> Result<(), IcwsError> {
        if self.server.trim().is_empty() {
            return Err(IcwsError::Config("missing server".to_string()));
        }
        if self.port == 0 {
            return Err(IcwsError::Config("missing port".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(IcwsError::Config("poll interval must be non-zero".to_string()));
        }
        Ok(())
    }

    /// `scheme://server:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.server, self.port)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
