//! Configuration management
//!
//! Tunnel definition files are YAML; a `.toml` extension selects TOML instead.

use crate::protocol::{HandshakeMode, HandshakeOptions, DEFAULT_HANDSHAKE_TIMEOUT, RETRY_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Independent tunnels served by this process
    #[serde(default)]
    pub tunnel: Vec<TunnelDefinition>,
    /// How VMs are addressed
    #[serde(default)]
    pub vm: VmConfig,
    /// Handshake tuning
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            _ => Format::Yaml,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content, Format::of(path))
    }

    fn parse(content: &str, format: Format) -> Result<Self, crate::Error> {
        match format {
            Format::Yaml => serde_yaml::from_str(content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e))),
            Format::Toml => toml::from_str(content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e))),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let path = path.as_ref();
        let content = match Format::of(path) {
            Format::Yaml => serde_yaml::to_string(self)
                .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?,
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?,
        };

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check the tunnel list for mistakes that would only show up at runtime
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tunnel.is_empty() {
            return Err(crate::Error::Config("no tunnels configured".to_string()));
        }
        if self.handshake.timeout_secs == 0 {
            return Err(crate::Error::Config(
                "handshake timeout-secs must not be 0".to_string(),
            ));
        }
        if self.handshake.retry_interval_ms == 0 {
            return Err(crate::Error::Config(
                "handshake retry-interval-ms must not be 0".to_string(),
            ));
        }

        let mut handshake_ports = HashSet::new();
        let mut host_ports = HashSet::new();
        let mut peer_addresses = HashSet::new();

        for (i, tunnel) in self.tunnel.iter().enumerate() {
            tunnel
                .validate()
                .map_err(|e| crate::Error::Config(format!("tunnel #{}: {}", i, e)))?;

            if !handshake_ports.insert(tunnel.handshake_port) {
                return Err(crate::Error::Config(format!(
                    "tunnel #{}: handshake port {} used twice",
                    i, tunnel.handshake_port
                )));
            }
            if !host_ports.insert(tunnel.vsock_host_port) {
                return Err(crate::Error::Config(format!(
                    "tunnel #{}: vsock host port {} used twice",
                    i, tunnel.vsock_host_port
                )));
            }
            if !peer_addresses.insert((tunnel.peer_address.as_str(), tunnel.peer_port)) {
                return Err(crate::Error::Config(format!(
                    "tunnel #{}: peer address {}:{} used twice",
                    i, tunnel.peer_address, tunnel.peer_port
                )));
            }
        }
        Ok(())
    }
}

/// One tunnel between a port inside the VM and an upstream on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelDefinition {
    /// Port the peer answers handshakes on
    pub handshake_port: u32,
    /// VM socket port the host listens on
    pub vsock_host_port: u32,
    /// Address the peer's TCP listener binds to
    pub peer_address: String,
    /// Port the peer's TCP listener binds to
    pub peer_port: u16,
    /// Where the host forwards connections (`host:port` or `npipe://...`)
    pub upstream_server_address: String,
}

impl TunnelDefinition {
    fn validate(&self) -> Result<(), String> {
        if self.handshake_port == 0 {
            return Err("handshake-port must not be 0".to_string());
        }
        if self.vsock_host_port == 0 {
            return Err("vsock-host-port must not be 0".to_string());
        }
        if self.handshake_port == self.vsock_host_port {
            return Err("handshake-port and vsock-host-port must differ".to_string());
        }
        if self.peer_address.is_empty() {
            return Err("peer-address must be set".to_string());
        }
        if self.peer_port == 0 {
            return Err("peer-port must not be 0".to_string());
        }
        if self.upstream_server_address.is_empty() {
            return Err("upstream-server-address must be set".to_string());
        }
        Ok(())
    }
}

/// How VM sockets are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmTransport {
    /// AF_VSOCK, ids are context ids
    #[default]
    Vsock,
    /// Plain TCP, ids are IP addresses
    Tcp,
}

/// VM addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfig {
    pub transport: VmTransport,
    /// Host side: every VM id to race during discovery
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Peer side: id of the host
    #[serde(default)]
    pub host: Option<String>,
    /// Local address TCP listeners bind to
    pub bind_address: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            transport: VmTransport::default(),
            candidates: Vec::new(),
            host: None,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// Handshake tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HandshakeConfig {
    /// Discovery timeout in seconds
    pub timeout_secs: u64,
    /// Delay between dial attempts in milliseconds
    pub retry_interval_ms: u64,
    pub mode: HandshakeMode,
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Handshake options for a responder listening on `port`
    pub fn options(&self, port: u32) -> HandshakeOptions {
        HandshakeOptions::new(port)
            .with_timeout(self.timeout())
            .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            retry_interval_ms: RETRY_INTERVAL.as_millis() as u64,
            mode: HandshakeMode::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: vec![TunnelDefinition {
            handshake_port: 9091,
            vsock_host_port: 8989,
            peer_address: "127.0.0.1".to_string(),
            peer_port: 3030,
            upstream_server_address: "127.0.0.1:8080".to_string(),
        }],
        vm: VmConfig {
            candidates: vec!["3".to_string()],
            host: Some("2".to_string()),
            ..VmConfig::default()
        },
        handshake: HandshakeConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
tunnel:
  - handshake-port: 9091
    vsock-host-port: 8989
    peer-address: 127.0.0.1
    peer-port: 3030
    upstream-server-address: 127.0.0.1:8080
  - handshake-port: 9092
    vsock-host-port: 8990
    peer-address: 0.0.0.0
    peer-port: 3031
    upstream-server-address: npipe:////./pipe/docker_engine
vm:
  transport: tcp
  candidates: ["192.168.64.2"]
  bind-address: 127.0.0.1
handshake:
  timeout-secs: 30
  retry-interval-ms: 250
  mode: one-shot
"#;

    #[test]
    fn test_parse_yaml() {
        let config = Config::parse(YAML, Format::Yaml).unwrap();
        assert_eq!(config.tunnel.len(), 2);
        assert_eq!(config.tunnel[1].vsock_host_port, 8990);
        assert_eq!(
            config.tunnel[1].upstream_server_address,
            "npipe:////./pipe/docker_engine"
        );
        assert_eq!(config.vm.transport, VmTransport::Tcp);
        assert_eq!(config.handshake.mode, HandshakeMode::OneShot);
        assert_eq!(config.handshake.timeout(), Duration::from_secs(30));
        assert_eq!(config.logging, LoggingConfig::default());
        config.validate().unwrap();

        let options = config.handshake.options(9091);
        assert_eq!(options.port, 9091);
        assert_eq!(options.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::parse(
            "tunnel:\n  - handshake-port: 1\n    vsock-host-port: 2\n    peer-address: a\n    peer-port: 3\n    upstream-server-address: b:4\n",
            Format::Yaml,
        )
        .unwrap();
        assert_eq!(config.vm, VmConfig::default());
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = generate_example_config();
        config.validate().unwrap();

        let mut dup = config.tunnel[0].clone();
        dup.peer_port = 4040;
        dup.vsock_host_port = 9999;
        config.tunnel.push(dup);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("handshake port 9091 used twice"), "{}", err);

        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_handshake_timings() {
        let mut config = generate_example_config();
        config.handshake.retry_interval_ms = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retry-interval-ms"), "{}", err);

        let mut config = generate_example_config();
        config.handshake.timeout_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("timeout-secs"), "{}", err);
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let config = generate_example_config();

        for name in ["vtunnel.yaml", "vtunnel.toml"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            assert_eq!(Config::load(&path).unwrap(), config);
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/vtunnel.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
