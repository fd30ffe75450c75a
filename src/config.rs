use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and HTTP settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Locations of the registry and visitor log
    #[serde(default)]
    pub storage: StorageConfig,

    /// Container start/stop tuning
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Idle sweep settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1, must be loopback)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 10099)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Bearer token required on /api/* when set
    pub api_token: Option<String>,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend to send response headers (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Refresh delay advertised by the holding page (default: 3)
    #[serde(default = "default_holding_refresh")]
    pub holding_refresh_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pid_file: None,
            api_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            holding_refresh_secs: default_holding_refresh(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Socket address to listen on
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Project registry document
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Visitor log document
    #[serde(default = "default_visitor_log_path")]
    pub visitor_log_path: PathBuf,

    /// Number of visitor entries retained (default: 10000)
    #[serde(default = "default_visitor_log_cap")]
    pub visitor_log_cap: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            visitor_log_path: default_visitor_log_path(),
            visitor_log_cap: default_visitor_log_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,

    /// Interval between running-state checks during a cold start
    #[serde(default = "default_start_poll_interval")]
    pub start_poll_interval_ms: u64,

    /// Hard ceiling on a cold start
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Delay after the container reports running, before traffic is sent
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Grace period passed to `docker stop` / `docker restart`
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            start_poll_interval_ms: default_start_poll_interval(),
            start_timeout_secs: default_start_timeout(),
            settle_delay_ms: default_settle_delay(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    /// Seconds between idle sweeps (default: 60)
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    10099
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_holding_refresh() -> u64 {
    3
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/www/projects/registry.json")
}

fn default_visitor_log_path() -> PathBuf {
    PathBuf::from("/var/www/projects/visitors.json")
}

fn default_visitor_log_cap() -> usize {
    10_000
}

fn default_start_poll_interval() -> u64 {
    500
}

fn default_start_timeout() -> u64 {
    15
}

fn default_settle_delay() -> u64 {
    1000 // give the app time to bind its port
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_watchdog_interval() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!(path = %path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.server.bind.parse::<IpAddr>() {
            Ok(ip) if !ip.is_loopback() => errors.push(format!(
                "server.bind '{}' is not a loopback address",
                self.server.bind
            )),
            Ok(_) => {}
            Err(_) => errors.push(format!(
                "server.bind '{}' is not a valid IP address",
                self.server.bind
            )),
        }

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.server.holding_refresh_secs == 0 {
            errors.push("server.holding_refresh_secs must be greater than 0".to_string());
        }
        if self.lifecycle.start_timeout_secs == 0 {
            errors.push("lifecycle.start_timeout_secs must be greater than 0".to_string());
        }
        if self.lifecycle.start_poll_interval_ms == 0 {
            errors.push("lifecycle.start_poll_interval_ms must be greater than 0".to_string());
        }
        if self.watchdog.interval_secs == 0 {
            errors.push("watchdog.interval_secs must be greater than 0".to_string());
        }
        if self.storage.visitor_log_cap == 0 {
            errors.push("storage.visitor_log_cap must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
