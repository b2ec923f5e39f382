use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend target to front
    pub target: TargetConfig,

    /// Shell commands run on lifecycle events
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Probe and state machine timing
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port to listen on (default: 25565)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.bind, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// The backend server the gateway fronts
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Hostname or IP of the backend
    pub host: String,

    /// Port of the backend (default: 25565)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

/// Commands executed when the gateway wants the backend started or stopped.
///
/// # Security Warning
///
/// These strings are executed as shell commands with the permissions of the
/// gateway process. Configuration files must be protected with appropriate
/// file permissions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CommandsConfig {
    /// Command to start the backend (e.g. starting a cloud instance)
    pub start: Option<String>,

    /// Command to stop the backend
    pub stop: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Seconds between liveness probes (default: 5)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Timeout for a single liveness probe in seconds (default: 5)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// State machine evaluation tick in milliseconds (default: 1000)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Seconds with zero players before requesting shutdown (default: 300)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a start/stop attempt may hang before remediation (default: 300)
    #[serde(default = "default_transition_timeout")]
    pub transition_timeout_secs: u64,
}

impl TimingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            tick_interval_ms: default_tick_interval(),
            idle_timeout_secs: default_idle_timeout(),
            transition_timeout_secs: default_transition_timeout(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    25565
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_transition_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config_parsing() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 25577

[target]
host = "mc.example.com"
port = 25565

[commands]
start = "aws ec2 start-instances --instance-ids i-123"
stop = "aws ec2 stop-instances --instance-ids i-123"

[timing]
probe_interval_secs = 10
idle_timeout_secs = 600
"#;
        let config: Config = toml::from_str(toml).expect("valid config");
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 25577);
        assert_eq!(config.target.host, "mc.example.com");
        assert!(config.commands.start.is_some());
        assert_eq!(config.timing.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.timing.idle_timeout(), Duration::from_secs(600));
        // untouched fields keep their defaults
        assert_eq!(config.timing.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.timing.tick_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str("[target]\nhost = \"localhost\"\n").expect("valid");
        assert_eq!(config.server.port, 25565);
        assert_eq!(config.target.port, 25565);
        assert!(config.commands.start.is_none());
        assert_eq!(config.timing.transition_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_target_rejected() {
        let result: Result<Config, _> = toml::from_str("[server]\nport = 1234\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[target]\nhost = \"localhost\"\nport = 25565").expect("write");

        let config = Config::load(file.path()).expect("loads");
        assert_eq!(config.target.host, "localhost");
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 4000,
        };
        assert_eq!(
            config.listen_addr().expect("valid addr").to_string(),
            "127.0.0.1:4000"
        );

        let bad = ServerConfig {
            bind: "not an address".to_string(),
            port: 4000,
        };
        assert!(bad.listen_addr().is_err());
    }
}
