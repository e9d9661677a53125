//! Connection and transport configuration.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for request and response size limits.
///
/// Applied to long-polling POST bodies and GET response bodies as a
/// defense against a misbehaving or hostile server/proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum response body size in bytes. `None` means unlimited.
    pub max_response_size: Option<usize>,
    /// Maximum request body size in bytes. `None` means unlimited.
    pub max_request_size: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_response_size: Some(10 * 1024 * 1024),
            max_request_size: Some(1024 * 1024),
        }
    }
}

impl LimitsConfig {
    /// A configuration with no limits at all.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_response_size: None,
            max_request_size: None,
        }
    }
}

/// Configuration for request and operation timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection establishment timeout.
    pub connect: Duration,
    /// Per-request timeout (applies to negotiate, POST, DELETE). Long-poll
    /// GETs use [`TimeoutConfig::poll`] instead since the server is
    /// expected to hold them open.
    pub request: Duration,
    /// Long-poll GET timeout; must exceed the server's own poll timeout.
    pub poll: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
            poll: Duration::from_secs(120),
        }
    }
}

/// TLS configuration for HTTPS/WSS connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether to validate server certificates. Disabling this is
    /// insecure and intended only for local development against a
    /// self-signed server.
    pub validate_certificates: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            validate_certificates: true,
        }
    }
}

impl TlsConfig {
    /// An insecure configuration that skips certificate validation.
    #[must_use]
    pub const fn insecure() -> Self {
        Self {
            validate_certificates: false,
        }
    }
}

/// Supplies a bearer token for negotiate and transport requests.
///
/// Invoked once before each negotiate attempt (and overridden by the
/// server when a negotiate redirection carries its own token, per
/// spec §4.5 step 4).
pub type AccessTokenProvider =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Builds the `reqwest::Client` used for negotiate and long-polling
/// requests. Supplied by the caller so that TLS/proxy/timeout policy
/// can be centrally owned by the embedding application.
pub type HttpClientFactory = Arc<dyn Fn() -> reqwest::Client + Send + Sync>;

/// User-supplied configuration for an [`crate::connection::HttpConnection`].
#[derive(Clone)]
pub struct HttpConnectionOptions {
    /// Constructs the `reqwest::Client` used for HTTP requests.
    pub http_client_factory: HttpClientFactory,
    /// Optional bearer-token source; overridden by a redirect's token
    /// while that redirect chain is in effect.
    pub access_token_provider: Option<AccessTokenProvider>,
    /// Skip `/negotiate` entirely and connect directly over WebSocket,
    /// as if negotiate had advertised `[webSockets{text,binary}]`.
    pub skip_negotiation: bool,
    /// Extra headers attached to every outbound request.
    pub headers: HashMap<String, String>,
    /// Size limits enforced on transport traffic.
    pub limits: LimitsConfig,
    /// Timeout policy for negotiate, transport I/O, and connect.
    pub timeouts: TimeoutConfig,
    /// TLS policy used when building the default HTTP client.
    pub tls: TlsConfig,
}

impl std::fmt::Debug for HttpConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnectionOptions")
            .field("skip_negotiation", &self.skip_negotiation)
            .field("headers", &self.headers)
            .field("limits", &self.limits)
            .field("timeouts", &self.timeouts)
            .field("tls", &self.tls)
            .field(
                "access_token_provider",
                &self.access_token_provider.is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        let timeouts = TimeoutConfig::default();
        let tls = TlsConfig::default();
        let tls_for_factory = tls.clone();
        let timeouts_for_factory = timeouts.clone();
        Self {
            http_client_factory: Arc::new(move || {
                build_default_http_client(&timeouts_for_factory, &tls_for_factory)
            }),
            access_token_provider: None,
            skip_negotiation: false,
            headers: HashMap::new(),
            limits: LimitsConfig::default(),
            timeouts,
            tls,
        }
    }
}

fn build_default_http_client(timeouts: &TimeoutConfig, tls: &TlsConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .danger_accept_invalid_certs(!tls.validate_certificates)
        .build()
        .expect("failed to build default HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_default_is_bounded() {
        let limits = LimitsConfig::default();
        assert!(limits.max_request_size.is_some());
        assert!(limits.max_response_size.is_some());
    }

    #[test]
    fn limits_unlimited_has_no_bounds() {
        let limits = LimitsConfig::unlimited();
        assert_eq!(limits.max_request_size, None);
        assert_eq!(limits.max_response_size, None);
    }

    #[test]
    fn tls_insecure_disables_validation() {
        assert!(!TlsConfig::insecure().validate_certificates);
    }

    #[test]
    fn default_options_skip_negotiation_is_false() {
        let opts = HttpConnectionOptions::default();
        assert!(!opts.skip_negotiation);
    }
}
