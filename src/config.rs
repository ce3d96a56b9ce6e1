//! Client configuration.
//!
//! Values are layered: built-in defaults, then an optional `linkboard.toml`
//! (or the file named by `LINKBOARD_CONFIG`), then `LINKBOARD__*` environment
//! variables, e.g. `LINKBOARD__REALTIME__MAX_RECONNECT_ATTEMPTS=8`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Root configuration for a client instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub api: ApiSettings,
    pub auth: AuthSettings,
    pub realtime: RealtimeSettings,
}

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// Base URL all resource paths are appended to, e.g. `http://localhost:8080/api`.
    pub base_url: Url,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

/// Token refresh settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Upper bound for a single refresh call. A timeout forces logout.
    pub refresh_timeout_ms: u64,
}

/// Realtime broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeSettings {
    /// WebSocket endpoint of the STOMP broker.
    pub url: Url,

    /// Delay unit for reconnects; attempt `n` waits `n` units.
    pub reconnect_base_delay_ms: u64,

    /// Automatic reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// Number of state changes kept for inspection.
    pub state_history_limit: usize,

    /// Time allowed for the STOMP CONNECT/CONNECTED exchange.
    pub handshake_timeout_ms: u64,
}

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

impl ClientConfig {
    /// Configuration pointing at the given API and broker endpoints, with
    /// every other value at its default.
    pub fn new(api_base_url: Url, realtime_url: Url) -> Self {
        Self {
            api: ApiSettings {
                base_url: api_base_url,
                request_timeout_ms: 30_000,
            },
            auth: AuthSettings {
                refresh_timeout_ms: 10_000,
            },
            realtime: RealtimeSettings {
                url: realtime_url,
                reconnect_base_delay_ms: 5_000,
                max_reconnect_attempts: 5,
                state_history_limit: 50,
                handshake_timeout_ms: 10_000,
            },
        }
    }

    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a source cannot be read or a value fails to parse.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let file = std::env::var("LINKBOARD_CONFIG").unwrap_or_else(|_| "linkboard".into());

        let config = Self::defaults()?
            .add_source(File::with_name(&file).required(false))
            .add_source(
                Environment::with_prefix("LINKBOARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_config(config)
    }

    /// Deserialize from an already-built `config::Config`.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        config.try_deserialize()
    }

    /// A builder pre-populated with every default value.
    pub fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError>
    {
        Config::builder()
            .set_default("api.base_url", DEFAULT_API_URL)?
            .set_default("api.request_timeout_ms", 30_000_i64)?
            .set_default("auth.refresh_timeout_ms", 10_000_i64)?
            .set_default("realtime.url", DEFAULT_WS_URL)?
            .set_default("realtime.reconnect_base_delay_ms", 5_000_i64)?
            .set_default("realtime.max_reconnect_attempts", 5_i64)?
            .set_default("realtime.state_history_limit", 50_i64)?
            .set_default("realtime.handshake_timeout_ms", 10_000_i64)
    }

    #[must_use]
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.auth.refresh_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.realtime.reconnect_base_delay_ms = base_delay.as_millis() as u64;
        self.realtime.max_reconnect_attempts = max_attempts;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(
            Url::parse(DEFAULT_API_URL).expect("valid default URL"),
            Url::parse(DEFAULT_WS_URL).expect("valid default URL"),
        )
    }
}

impl ApiSettings {
    /// Absolute URL for a resource path such as `/posts/42`.
    ///
    /// The path is appended to the base URL's path rather than resolved
    /// against it, so a base of `.../api` keeps its `/api` prefix.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl AuthSettings {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

impl RealtimeSettings {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
