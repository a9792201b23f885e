use crate::error::ScanError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunnel identity and candidate sources for one scan. Loaded from a JSON
/// document, validated once, and immutable for the duration of the scan.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanConfiguration {
    pub uuid: String,
    pub server_name: String,
    pub host_header: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_vless_port")]
    pub vless_port: u16,
    #[serde(default = "default_socks_port")]
    pub local_socks_port: u16,
    #[serde(default)]
    pub test_ip: Option<IpAddr>,
    #[serde(default)]
    pub include_test_ip: bool,
    #[serde(default = "default_tunnel_binary")]
    pub tunnel_binary: PathBuf,
    /// DNS names whose A records seed the candidate set.
    #[serde(default)]
    pub providers: Vec<String>,
    /// CIDR blocks sampled for candidates.
    #[serde(default)]
    pub ranges: Vec<String>,
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_vless_port() -> u16 {
    443
}

fn default_socks_port() -> u16 {
    1080
}

fn default_tunnel_binary() -> PathBuf {
    PathBuf::from("xray")
}

impl ScanConfiguration {
    /// Load and validate a configuration file. Any problem is a
    /// `ScanError::Configuration` surfaced before network activity starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            ScanError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|err| {
            ScanError::Configuration(format!("failed to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.uuid.trim().is_empty() {
            return Err(ScanError::Configuration("missing required field: uuid".into()));
        }
        if self.uuid.len() < 30 {
            return Err(ScanError::Configuration("uuid appears invalid (too short)".into()));
        }
        if self.server_name.trim().is_empty() {
            return Err(ScanError::Configuration(
                "missing required field: server_name".into(),
            ));
        }
        if self.host_header.trim().is_empty() {
            return Err(ScanError::Configuration(
                "missing required field: host_header".into(),
            ));
        }
        if self.ws_path.is_empty() {
            return Err(ScanError::Configuration("missing required field: ws_path".into()));
        }
        if self.vless_port == 0 {
            return Err(ScanError::Configuration("vless_port must be non-zero".into()));
        }
        if self.local_socks_port < 1024 {
            return Err(ScanError::Configuration(
                "local_socks_port must be in 1024-65535".into(),
            ));
        }
        if self.include_test_ip && self.test_ip.is_none() {
            return Err(ScanError::Configuration(
                "include_test_ip is set but test_ip is missing".into(),
            ));
        }
        for range in &self.ranges {
            range.parse::<IpNet>().map_err(|err| {
                ScanError::Configuration(format!("invalid range {range}: {err}"))
            })?;
        }
        Ok(())
    }
}

/// Per-scan tunables. Validated at scan start; immutable thereafter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    /// Tunnel startup / HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Download window per candidate in seconds.
    pub speed_test_secs: u64,
    /// TCP reachability probe timeout in seconds.
    pub tcp_timeout_secs: u64,
    /// Number of reachable candidates to speed test.
    pub target_ip_count: usize,
    /// Probe worker pool size, independent of later phases.
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

fn default_probe_concurrency() -> usize {
    crate::prober::DEFAULT_PROBE_CONCURRENCY
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl ScanParameters {
    pub const STANDARD: Self = Self {
        connect_timeout_secs: 20,
        speed_test_secs: 5,
        tcp_timeout_secs: 2,
        target_ip_count: 10,
        probe_concurrency: crate::prober::DEFAULT_PROBE_CONCURRENCY,
    };

    pub const QUICK: Self = Self {
        connect_timeout_secs: 10,
        speed_test_secs: 3,
        tcp_timeout_secs: 1,
        target_ip_count: 5,
        probe_concurrency: crate::prober::DEFAULT_PROBE_CONCURRENCY,
    };

    /// Named parameter bundle; "custom" values go through `validate` instead.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "quick" => Some(Self::QUICK),
            "standard" => Some(Self::STANDARD),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.connect_timeout_secs == 0 {
            return Err(ScanError::Configuration(
                "connect timeout must be positive".into(),
            ));
        }
        if self.speed_test_secs == 0 {
            return Err(ScanError::Configuration(
                "speed test duration must be positive".into(),
            ));
        }
        if self.tcp_timeout_secs == 0 {
            return Err(ScanError::Configuration(
                "tcp probe timeout must be positive".into(),
            ));
        }
        if self.target_ip_count == 0 {
            return Err(ScanError::Configuration(
                "target IP count must be at least 1".into(),
            ));
        }
        if self.probe_concurrency == 0 {
            return Err(ScanError::Configuration(
                "probe concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn speed_test_duration(&self) -> Duration {
        Duration::from_secs(self.speed_test_secs)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ScanConfiguration {
        ScanConfiguration {
            uuid: "3fa4f25c-9b2e-4d71-8a53-0c2b6f1de982".into(),
            server_name: "cdn.example.com".into(),
            host_header: "cdn.example.com".into(),
            ws_path: "/ws".into(),
            vless_port: 443,
            local_socks_port: 1080,
            test_ip: Some("173.245.49.235".parse().unwrap()),
            include_test_ip: true,
            tunnel_binary: PathBuf::from("xray"),
            providers: vec!["edge.example.net".into()],
            ranges: vec!["104.16.0.0/24".into()],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn short_uuid_rejected() {
        let mut config = valid_config();
        config.uuid = "too-short".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[test]
    fn privileged_socks_port_rejected() {
        let mut config = valid_config();
        config.local_socks_port = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_required_when_included() {
        let mut config = valid_config();
        config.test_ip = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_range_rejected() {
        let mut config = valid_config();
        config.ranges.push("104.16.0.0/99".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_from_json() {
        let doc = r#"{
            "uuid": "3fa4f25c-9b2e-4d71-8a53-0c2b6f1de982",
            "server_name": "cdn.example.com",
            "host_header": "cdn.example.com",
            "ranges": ["104.16.0.0/24"]
        }"#;
        let config: ScanConfiguration = serde_json::from_str(doc).unwrap();
        assert_eq!(config.vless_port, 443);
        assert_eq!(config.local_socks_port, 1080);
        assert_eq!(config.ws_path, "/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = ScanConfiguration::load("/nonexistent/edge-scan.json").unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[test]
    fn zero_parameters_rejected() {
        for field in 0..5 {
            let mut params = ScanParameters::STANDARD;
            match field {
                0 => params.connect_timeout_secs = 0,
                1 => params.speed_test_secs = 0,
                2 => params.tcp_timeout_secs = 0,
                3 => params.target_ip_count = 0,
                _ => params.probe_concurrency = 0,
            }
            assert!(
                matches!(params.validate(), Err(ScanError::Configuration(_))),
                "field {field} should be rejected"
            );
        }
    }

    #[test]
    fn presets_resolve() {
        assert_eq!(ScanParameters::preset("quick"), Some(ScanParameters::QUICK));
        assert_eq!(
            ScanParameters::preset("standard"),
            Some(ScanParameters::STANDARD)
        );
        assert!(ScanParameters::preset("warp-speed").is_none());
    }
}
