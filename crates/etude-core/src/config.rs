use crate::codec::Protocol;
use crate::error::{EtudeError, EtudeResult};
use crate::site::{StaticSite, VirtualHosts};
use crate::worker::WorkerSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// `<proto>://<ip>:<port>`, proto one of `http`, `ws`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddr {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl ListenAddr {
    pub fn parse(input: &str) -> EtudeResult<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| EtudeError::Config(format!("listen address `{input}` has no scheme")))?;
        let protocol = Protocol::from_scheme(scheme)?;
        let addr = rest
            .parse::<SocketAddr>()
            .map_err(|e| EtudeError::Config(format!("listen address `{input}`: {e}")))?;
        Ok(Self { protocol, addr })
    }
}

impl FromStr for ListenAddr {
    type Err = EtudeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.addr)
    }
}

/// Document root of one virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub root: PathBuf,
    /// Tried in order when a directory is requested.
    #[serde(default = "default_index")]
    pub index: Vec<String>,
}

impl HostConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: default_index(),
        }
    }
}

fn default_index() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

/// Server configuration, from JSON or `ETUDE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. `http://0.0.0.0:8080`.
    pub listen: String,

    /// Worker processes (default: number of CPUs)
    pub workers: usize,

    /// Detach from the terminal before forking workers.
    pub daemon: bool,

    /// Re-fork workers that exit.
    pub respawn: bool,

    /// Where a daemon's stdout/stderr go (default: /dev/null)
    pub stdout_path: Option<PathBuf>,

    /// Key of the shared counter store (default: derived from `listen`)
    pub shm_key: Option<String>,

    pub idle_timeout_secs: u64,
    pub sweep_interval_ms: u64,

    /// Bytes read per readiness event.
    pub read_chunk: usize,

    /// Largest request, frame or reassembled message a connection buffers.
    pub max_recv_buffer: usize,

    /// Connections per worker.
    pub max_connections: usize,

    /// Pin each worker to its own core.
    pub pin_workers: bool,

    /// Virtual hosts served by the static-file responder. The `default`
    /// entry catches unknown hosts.
    pub hosts: HashMap<String, HostConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "http://0.0.0.0:8080".to_string(),
            workers: num_cpus::get(),
            daemon: false,
            respawn: true,
            stdout_path: None,
            shm_key: None,
            idle_timeout_secs: 60,
            sweep_interval_ms: 1000,
            read_chunk: 65536,
            max_recv_buffer: 1 << 20,
            max_connections: 10_000,
            pin_workers: true,
            hosts: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; unset variables keep their
    /// defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> EtudeResult<Self> {
        fn parsed<T: FromStr>(name: &str, value: Option<String>) -> EtudeResult<Option<T>> {
            value
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|_| EtudeError::Config(format!("{name}: invalid value `{v}`")))
                })
                .transpose()
        }
        fn flag(value: Option<String>) -> Option<bool> {
            value.map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        }

        let mut config = Self::default();
        if let Some(listen) = var("ETUDE_LISTEN") {
            config.listen = listen;
        }
        if let Some(workers) = parsed("ETUDE_WORKERS", var("ETUDE_WORKERS"))? {
            config.workers = workers;
        }
        if let Some(daemon) = flag(var("ETUDE_DAEMON")) {
            config.daemon = daemon;
        }
        if let Some(respawn) = flag(var("ETUDE_RESPAWN")) {
            config.respawn = respawn;
        }
        config.stdout_path = var("ETUDE_STDOUT").map(PathBuf::from);
        config.shm_key = var("ETUDE_SHM_KEY");
        if let Some(v) = parsed("ETUDE_IDLE_TIMEOUT_SECS", var("ETUDE_IDLE_TIMEOUT_SECS"))? {
            config.idle_timeout_secs = v;
        }
        if let Some(v) = parsed("ETUDE_SWEEP_INTERVAL_MS", var("ETUDE_SWEEP_INTERVAL_MS"))? {
            config.sweep_interval_ms = v;
        }
        if let Some(v) = parsed("ETUDE_READ_CHUNK", var("ETUDE_READ_CHUNK"))? {
            config.read_chunk = v;
        }
        if let Some(v) = parsed("ETUDE_MAX_RECV_BUFFER", var("ETUDE_MAX_RECV_BUFFER"))? {
            config.max_recv_buffer = v;
        }
        if let Some(v) = parsed("ETUDE_MAX_CONNECTIONS", var("ETUDE_MAX_CONNECTIONS"))? {
            config.max_connections = v;
        }
        if let Some(pin) = flag(var("ETUDE_PIN_WORKERS")) {
            config.pin_workers = pin;
        }
        if let Some(root) = var("ETUDE_DOCUMENT_ROOT") {
            config
                .hosts
                .insert("default".to_string(), HostConfig::new(root));
        }
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> EtudeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EtudeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EtudeResult<()> {
        self.listen_addr()?;
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.read_chunk == 0 || self.max_recv_buffer == 0 {
            return Err(EtudeError::Config(
                "read_chunk and max_recv_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> EtudeResult<ListenAddr> {
        ListenAddr::parse(&self.listen)
    }

    /// Key shared by `start`, `stop`, `restart` and `status`.
    pub fn shm_key(&self) -> String {
        self.shm_key.clone().unwrap_or_else(|| self.listen.clone())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            read_chunk: self.read_chunk,
            max_recv_buffer: self.max_recv_buffer,
            max_connections: self.max_connections,
        }
    }

    /// Static-file site for the configured hosts, if any.
    pub fn static_site(&self) -> Option<StaticSite> {
        if self.hosts.is_empty() {
            return None;
        }
        Some(StaticSite::new(VirtualHosts::new(self.hosts.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_listen_addr() {
        let addr = ListenAddr::parse("ws://127.0.0.1:9000").unwrap();
        assert_eq!(addr.protocol, Protocol::WebSocket);
        assert_eq!(addr.addr.port(), 9000);
        assert_eq!(addr.to_string(), "ws://127.0.0.1:9000");

        let addr: ListenAddr = "http://[::1]:80".parse().unwrap();
        assert_eq!(addr.protocol, Protocol::Http);
    }

    #[test]
    fn test_parse_listen_addr_rejects_malformed() {
        for bad in ["127.0.0.1:80", "tcp://127.0.0.1:80", "http://localhost", "http://1.2.3.4:x"] {
            assert!(
                matches!(ListenAddr::parse(bad), Err(EtudeError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.workers >= 1);
        assert!(config.respawn);
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.shm_key(), "http://0.0.0.0:8080");
        assert!(config.static_site().is_none());
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("ETUDE_LISTEN", "ws://127.0.0.1:7000"),
            ("ETUDE_WORKERS", "3"),
            ("ETUDE_RESPAWN", "no"),
            ("ETUDE_DOCUMENT_ROOT", "/srv/www"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.workers, 3);
        assert!(!config.respawn);
        assert_eq!(config.listen_addr().unwrap().protocol, Protocol::WebSocket);
        assert_eq!(config.hosts["default"].root, PathBuf::from("/srv/www"));
        assert_eq!(config.hosts["default"].index, vec!["index.html", "index.htm"]);
    }

    #[test]
    fn test_from_vars_invalid_number() {
        let result = ServerConfig::from_vars(|k| (k == "ETUDE_WORKERS").then(|| "many".to_string()));
        assert!(matches!(result, Err(EtudeError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen": "http://127.0.0.1:8081", "workers": 2,
                "hosts": {{"example.com": {{"root": "/var/www/example"}}}}}}"#
        )
        .unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.sweep_interval_ms, 1000);
        assert_eq!(config.hosts["example.com"].index.len(), 2);
        assert!(config.static_site().is_some());
    }
}
