//! Postgres configuration.
use std::{borrow::Cow, env::var, fmt, num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    codec::Registry,
    hooks::Hooks,
    net::Target,
    postgres::PgFormat,
    statement::CacheMode,
};

const DEFAULT_STATEMENT_CACHE: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(ok) => ok,
    None => unreachable!(),
};

/// Whether to upgrade the connection with TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never send `SSLRequest`.
    Disable,
    /// Upgrade when the server agrees and a tls config is available, otherwise plain.
    #[default]
    Prefer,
    /// Fail when the connection cannot be upgraded.
    Require,
}

impl SslMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "disable" => Some(Self::Disable),
            "allow" | "prefer" => Some(Self::Prefer),
            "require" | "verify-ca" | "verify-full" => Some(Self::Require),
            _ => None,
        }
    }
}

/// Tls negotiation settings, shared with [`CancelToken`][super::CancelToken].
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub(crate) mode: SslMode,
    #[cfg(feature = "tls")]
    pub(crate) config: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions").field("mode", &self.mode).finish()
    }
}

/// Postgres connection config.
#[derive(Clone)]
pub struct Config {
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) socket: Option<PathBuf>,
    pub(crate) dbname: Option<String>,
    pub(crate) application_name: Option<String>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) tls: TlsOptions,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) statement_cache: CacheMode,
    pub(crate) result_format: PgFormat,
    pub(crate) registry: Arc<Registry>,
    pub(crate) hooks: Option<Arc<dyn Hooks>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Config with user `postgres` on `localhost:5432`.
    pub fn new() -> Config {
        Self {
            user: "postgres".into(),
            password: None,
            host: "localhost".into(),
            port: 5432,
            socket: None,
            dbname: None,
            application_name: None,
            params: Vec::new(),
            tls: TlsOptions::default(),
            connect_timeout: None,
            statement_cache: CacheMode::Lru(DEFAULT_STATEMENT_CACHE),
            result_format: PgFormat::Text,
            registry: Arc::new(Registry::new()),
            hooks: None,
        }
    }

    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `PGUSER`
    /// - `PGPASSWORD`, or `PGPASS`
    /// - `PGHOST`, a path starting with `/` selects a unix socket directory
    /// - `PGPORT`
    /// - `PGDATABASE`
    /// - `PGAPPNAME`
    /// - `PGSSLMODE`
    pub fn from_env() -> Config {
        let mut me = Config::new();

        if let Ok(user) = var("PGUSER") {
            me.user = user;
        }
        me.password = var("PGPASSWORD").or_else(|_| var("PGPASS")).ok();
        match var("PGHOST") {
            Ok(host) if host.starts_with('/') => me.socket = Some(host.into()),
            Ok(host) => me.host = host,
            Err(_) => {}
        }
        if let Some(port) = var("PGPORT").ok().and_then(|e| e.parse().ok()) {
            me.port = port;
        }
        me.dbname = var("PGDATABASE").ok();
        me.application_name = var("PGAPPNAME").ok();
        if let Some(mode) = var("PGSSLMODE").ok().and_then(|e| SslMode::parse(&e)) {
            me.tls.mode = mode;
        }

        me
    }

    /// The database user name to connect as.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Authentication password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Server host name or address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Server port, also used to derive the unix socket file name.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connect through the unix socket in `dir` instead of tcp.
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket = Some(dir.into());
        self
    }

    /// The database to connect to. Defaults to the user name.
    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Additional run-time parameter sent in the startup message.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Client config used when upgrading to tls.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls.config = Some(config);
        self
    }

    /// Limit the time spent connecting and authenticating.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Prepared statement cache policy, defaults to LRU of 256 entries.
    pub fn statement_cache(mut self, mode: CacheMode) -> Self {
        self.statement_cache = mode;
        self
    }

    /// Preferred result format, columns without a codec in this format fall back to text.
    pub fn result_format(mut self, format: PgFormat) -> Self {
        self.result_format = format;
        self
    }

    /// Codec registry shared by sessions created from this config.
    pub fn registry(mut self, registry: impl Into<Arc<Registry>>) -> Self {
        self.registry = registry.into();
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn target(&self) -> Target {
        match &self.socket {
            #[cfg(unix)]
            Some(dir) => Target::Unix(dir.join(format!(".s.PGSQL.{}", self.port))),
            _ => Target::Tcp { host: self.host.clone(), port: self.port },
        }
    }

    /// Run-time parameters for the startup message.
    pub(crate) fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        if let Some(name) = &self.application_name {
            params.push(("application_name".into(), name.clone()));
        }
        params.extend(self.params.iter().cloned());
        params
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("dbname", &self.dbname)
            .field("application_name", &self.application_name)
            .field("params", &self.params)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_cache", &self.statement_cache)
            .field("result_format", &self.result_format)
            .finish_non_exhaustive()
    }
}

/// Invalid configuration.
pub struct ConfigError {
    pub(crate) reason: Cow<'static,str>,
}

impl ConfigError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ConfigError { }

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason)
        }
        write!(f, "invalid config: {}", self.reason)
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
