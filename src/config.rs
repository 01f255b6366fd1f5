//! Configuration loading and constants.
//!
//! Loads the server configuration from a TOML file. `AppConfig` is the root
//! struct; `HttpConfig` is the immutable snapshot handed to the server, and carries
//! the per-stage sections (`[http.headers]`, `[http.parallel_requests]`).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "frontdoor=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Any interface, any port
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:0";

// =============================================================================
// Server Limits
// =============================================================================

/// Grace period for draining in-flight requests on stop
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;

/// Smallest read buffer hyper accepts for HTTP/1 (`max_buf_size` panics below it)
pub const MIN_HEADER_BUF_BYTES: usize = 8192;

/// Plain HTTP port for the HTTPS redirect listener
pub const DEFAULT_REDIRECT_PORT: u16 = 80;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: HttpConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
///
/// Timeouts are in seconds; zero means "not set".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address. `:8080` is accepted and means all interfaces.
    pub address: String,
    /// Middleware names, outermost first
    pub middleware: Vec<String>,
    pub max_header_bytes: usize,
    pub read_header_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// How long in-flight requests may run after a stop signal
    pub graceful_timeout_seconds: u64,

    /// Certificate file for manual TLS (PEM)
    pub cert_file: Option<String>,
    /// Private key file for manual TLS (PEM)
    pub key_file: Option<String>,
    /// ACME certificate cache directory; enables automatic TLS
    pub dir_cache: Option<String>,
    /// Host allow-list for ACME certificate issuance
    pub hosts: Vec<String>,
    /// Contact email for the ACME account
    pub acme_email: Option<String>,
    /// Use Let's Encrypt production (true) or staging (false)
    pub acme_production: bool,
    /// Run a plain HTTP listener that redirects to HTTPS when TLS is active
    pub redirect_http: bool,
    pub redirect_port: u16,

    /// `[http.headers]`: static headers and CORS. Absent disables the stage.
    pub headers: Option<HeadersConfig>,
    /// `[http.parallel_requests]`: admission limit. Absent disables the stage.
    pub parallel_requests: Option<ParallelRequestsConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            middleware: Vec::new(),
            max_header_bytes: 0,
            read_header_timeout_seconds: 0,
            read_timeout_seconds: 0,
            write_timeout_seconds: 0,
            idle_timeout_seconds: 0,
            graceful_timeout_seconds: DEFAULT_GRACEFUL_TIMEOUT_SECS,
            cert_file: None,
            key_file: None,
            dir_cache: None,
            hosts: Vec::new(),
            acme_email: None,
            acme_production: true,
            redirect_http: false,
            redirect_port: DEFAULT_REDIRECT_PORT,
            headers: None,
            parallel_requests: None,
        }
    }
}

/// TLS mode, resolved from which TLS fields are set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain HTTP
    None,
    /// User-provided certificate and key files
    Manual { cert_file: String, key_file: String },
    /// Automatic certificates via ACME, cached in `dir_cache`
    Acme { dir_cache: String, hosts: Vec<String> },
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

impl HttpConfig {
    /// Parse the listen address, filling in the unspecified host of `:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self.address.trim();
        let address = match address {
            "" => DEFAULT_ADDRESS.to_string(),
            a if a.starts_with(':') => format!("0.0.0.0{a}"),
            a => a.to_string(),
        };
        address
            .parse()
            .map_err(|e| ConfigError::Validation(format!("Invalid http.address '{address}': {e}")))
    }

    /// Resolve the TLS mode.
    ///
    /// An explicit certificate and key take priority. ACME applies only with a
    /// cache directory and a non-empty host allow-list. Otherwise plain HTTP.
    pub fn tls_mode(&self) -> TlsMode {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);

        if let (Some(cert_file), Some(key_file)) = (non_empty(&self.cert_file), non_empty(&self.key_file)) {
            return TlsMode::Manual { cert_file, key_file };
        }

        let hosts: Vec<String> = self.hosts.iter().filter(|h| !h.is_empty()).cloned().collect();
        match non_empty(&self.dir_cache) {
            Some(dir_cache) if !hosts.is_empty() => TlsMode::Acme { dir_cache, hosts },
            _ => TlsMode::None,
        }
    }

    /// Reject combinations that would silently serve something other than what
    /// was asked for.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;

        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if has(&self.cert_file) != has(&self.key_file) {
            return Err(ConfigError::Validation(
                "http.cert_file and http.key_file must be set together".to_string(),
            ));
        }

        if has(&self.dir_cache) && !has(&self.cert_file) && self.tls_mode() == TlsMode::None {
            return Err(ConfigError::Validation(
                "http.dir_cache requires a non-empty http.hosts allow-list".to_string(),
            ));
        }

        Ok(())
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_seconds)
    }

    /// Max header bytes, floored at hyper's minimum. `None` keeps hyper's default.
    pub fn header_buf_size(&self) -> Option<usize> {
        (self.max_header_bytes > 0).then(|| self.max_header_bytes.max(MIN_HEADER_BUF_BYTES))
    }

    pub fn read_header_timeout(&self) -> Option<Duration> {
        seconds(self.read_header_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        seconds(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        seconds(self.write_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        seconds(self.idle_timeout_seconds)
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Static header injection and CORS
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// CORS settings. Absent skips all CORS headers.
    pub cors: Option<CorsConfig>,
    /// Headers added to every request (accumulate with existing values)
    pub request: BTreeMap<String, String>,
    /// Headers set on every response (replace existing values)
    pub response: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Access-Control-Allow-Origin
    pub allowed_origin: String,
    /// https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Access-Control-Allow-Headers
    pub allowed_headers: String,
    /// https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Access-Control-Allow-Methods
    pub allowed_methods: String,
    /// https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Access-Control-Allow-Credentials
    pub allow_credentials: Option<bool>,
    /// https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Access-Control-Expose-Headers
    pub exposed_headers: String,
    /// Preflight cache lifetime in seconds
    pub max_age: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParallelRequestsConfig {
    /// Maximum requests in flight at once; 0 disables the limiter
    #[serde(default)]
    pub max_allowed: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.http.validate()?;
        Ok(config)
    }
}
