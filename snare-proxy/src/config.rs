use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub tls: TlsMitmConfig,
    pub upstream: UpstreamConfig,
    pub intercept: InterceptConfig,
    pub scope: ScopeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsMitmConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub ca_common_name: String,
    pub allow_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    pub verify_tls: bool,
    pub decode_gzip: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterceptConfig {
    pub requests_enabled: bool,
    pub responses_enabled: bool,
    pub in_scope_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScopeConfig {
    pub rules: Vec<ScopeRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeRule {
    pub rule_type: ScopeRuleType,
    pub pattern_type: ScopePatternType,
    pub target: ScopeTarget,
    pub pattern: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScopeRuleType {
    Include,
    Exclude,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScopePatternType {
    Wildcard,
    Regex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScopeTarget {
    Host,
    Path,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ProxyError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|err| ProxyError::Config(format!("invalid listen host {:?}: {err}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for TlsMitmConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: PathBuf::from("certs/snare-ca.pem"),
            ca_key_path: PathBuf::from("certs/snare-ca-key.pem"),
            ca_common_name: "Snare Proxy CA".to_string(),
            allow_legacy: false,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            verify_tls: true,
            decode_gzip: true,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ScopeRule {
    pub fn include_host(pattern: impl Into<String>) -> Self {
        Self {
            rule_type: ScopeRuleType::Include,
            pattern_type: ScopePatternType::Wildcard,
            target: ScopeTarget::Host,
            pattern: pattern.into(),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listen]
            port = 9090

            [intercept]
            requests_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 9090);
        assert!(config.intercept.requests_enabled);
        assert!(!config.intercept.responses_enabled);
        assert_eq!(config.tls.ca_cert_path, PathBuf::from("certs/snare-ca.pem"));
        assert_eq!(config.upstream, UpstreamConfig::default());
    }

    #[test]
    fn scope_rules_parse() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[scope.rules]]
            rule_type = "Include"
            pattern_type = "Wildcard"
            target = "Host"
            pattern = "*.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.scope.rules, vec![ScopeRule::include_host("*.example.com")]);
    }

    #[test]
    fn ipv6_listen_address() {
        let listen = ListenConfig {
            host: "::1".to_string(),
            port: 8080,
        };
        assert_eq!(listen.socket_addr().unwrap().to_string(), "[::1]:8080");
        assert!(
            ListenConfig {
                host: "localhost".to_string(),
                port: 1,
            }
            .socket_addr()
            .is_err()
        );
    }
}
