use std::io;
use std::path::PathBuf;

/// Server settings, read from `STAYBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared password every client presents at startup.
    pub access_code: String,
    pub max_connections: usize,
    /// WAL appends before the background compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            access_code: "staybook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys fall back to the defaults; set
    /// but unparsable numbers are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let mut config = Self::default();
        if let Some(bind) = lookup("STAYBOOK_BIND") {
            config.bind = bind;
        }
        if let Some(port) = parse_var(&lookup, "STAYBOOK_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("STAYBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(code) = lookup("STAYBOOK_ACCESS_CODE") {
            config.access_code = code;
        }
        if let Some(max) = parse_var(&lookup, "STAYBOOK_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(threshold) = parse_var(&lookup, "STAYBOOK_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        config.tls_cert = lookup("STAYBOOK_TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("STAYBOOK_TLS_KEY").map(PathBuf::from);
        config.metrics_port = parse_var(&lookup, "STAYBOOK_METRICS_PORT")?;

        if config.max_connections == 0 {
            return Err(invalid("STAYBOOK_MAX_CONNECTIONS", "must be at least 1"));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &format!("cannot parse {raw:?}"))),
    }
}

fn invalid(key: &str, msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{key}: {msg}"))
}
