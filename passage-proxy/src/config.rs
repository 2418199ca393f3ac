use std::path::Path;
use std::time::Duration;

use passage_net::Limits;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub connect: ConnectConfig,
    pub relay: RelayConfig,
    pub limits: RequestLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on sessions relayed at the same time.
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectConfig {
    pub timeout_ms: u64,
    pub keepalive_secs: u64,
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub idle_threshold: u32,
    pub probe_timeout_ms: u64,
    pub first_read_timeout_ms: u64,
    pub preamble_timeout_ms: u64,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestLimits {
    pub max_header_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            connect: ConnectConfig::default(),
            relay: RelayConfig::default(),
            limits: RequestLimits::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: 5,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            keepalive_secs: 30,
            keepalive_interval_secs: 10,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            idle_threshold: 5,
            probe_timeout_ms: 5_000,
            first_read_timeout_ms: 5_000,
            preamble_timeout_ms: 1_000,
            buffer_size: 8192,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: Limits::default().max_header_bytes,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ProxyError> {
        let config: Self = toml::from_str(raw).map_err(|err| ProxyError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen.workers == 0 {
            return Err(ProxyError::Config("listen.workers must be at least 1".to_string()));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(ProxyError::Config(
                "relay.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.relay.buffer_size == 0 {
            return Err(ProxyError::Config("relay.buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }

    pub fn parser_limits(&self) -> Limits {
        Limits {
            max_header_bytes: self.limits.max_header_bytes,
        }
    }
}

impl ConnectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn first_read_timeout(&self) -> Duration {
        Duration::from_millis(self.first_read_timeout_ms)
    }

    pub fn preamble_timeout(&self) -> Duration {
        Duration::from_millis(self.preamble_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::ProxyConfig;
    use crate::error::ProxyError;

    #[test]
    fn defaults_match_reference_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen.workers, 5);
        assert_eq!(config.relay.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.relay.idle_threshold, 5);
        assert_eq!(config.relay.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ProxyConfig::from_toml_str(
            "[listen]\nport = 3128\nworkers = 16\n\n[relay]\nidle_threshold = 3\n",
        )
        .unwrap();

        assert_eq!(config.listen.port, 3128);
        assert_eq!(config.listen.workers, 16);
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.relay.idle_threshold, 3);
        assert_eq!(config.relay.buffer_size, 8192);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = ProxyConfig::from_toml_str("[listen]\nworkers = 0\n").unwrap_err();
        assert_matches!(err, ProxyError::Config(_));
    }

    #[test]
    fn rejects_invalid_toml() {
        let err = ProxyConfig::from_toml_str("listen = 3").unwrap_err();
        assert_matches!(err, ProxyError::Config(_));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passage.toml");
        let mut config = ProxyConfig::default();
        config.listen.port = 9999;
        config.connect.timeout_ms = 250;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = ProxyConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert_matches!(err, ProxyError::Config(_));
    }
}
