use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::upstream::{DEFAULT_UPSTREAM_PROFILE, resolve_upstream_profile};

pub const DEFAULT_PUBLIC_KEY_PATH: &str = "/conf/jwt/jwtRS256.key.pub";
pub const DEFAULT_TOKEN_TYPE: &str = "dns_token";

/// Runtime configuration parsed from `doh-gateway.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub lists: ListsSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_doh_listen")]
    pub doh_listen: String,
    #[serde(default = "default_doh_path")]
    pub doh_path: String,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    /// Plain DNS (UDP and TCP) listener.
    #[serde(default)]
    pub dns_listen: Option<String>,
    /// Metrics and list reload endpoints.
    #[serde(default)]
    pub admin_listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_profile_option")]
    pub profile: Option<String>,
    /// Explicit JSON-API endpoints; take precedence over `profile`.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub no_ecs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_public_key_path")]
    pub public_key_path: PathBuf,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListsSection {
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub log_queries: bool,
    #[serde(default)]
    pub json_directory: Option<PathBuf>,
}

fn default_doh_listen() -> String {
    "127.0.0.1:8053".into()
}

fn default_doh_path() -> String {
    "/dns-query".into()
}

fn default_upstream_profile_option() -> Option<String> {
    Some(DEFAULT_UPSTREAM_PROFILE.into())
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_public_key_path() -> PathBuf {
    PathBuf::from(DEFAULT_PUBLIC_KEY_PATH)
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.into()
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_flush_interval_seconds() -> u64 {
    30
}

fn default_flush_threshold_bytes() -> usize {
    2048
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            doh_listen: default_doh_listen(),
            doh_path: default_doh_path(),
            tls_cert_path: None,
            tls_key_path: None,
            dns_listen: None,
            admin_listen: None,
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            profile: default_upstream_profile_option(),
            endpoints: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
            no_ecs: false,
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            public_key_path: default_public_key_path(),
            token_type: default_token_type(),
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: default_queue_capacity(),
            flush_interval_seconds: default_flush_interval_seconds(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
        }
    }
}

impl UpstreamSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl TrackerSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }
}

impl GatewayConfig {
    pub fn load_config_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read gateway config at {}", path.display()))?;
        let cfg: GatewayConfig = toml::from_str(&raw)
            .with_context(|| format!("Malformed gateway config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Load the file when present, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_config_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Human-readable list of configuration problems; empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        check_socket(&self.server.doh_listen, "DoH listener", &mut issues);
        if let Some(addr) = &self.server.dns_listen {
            check_socket(addr, "DNS listener", &mut issues);
        }
        if let Some(addr) = &self.server.admin_listen {
            check_socket(addr, "Admin listener", &mut issues);
        }
        if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
            issues.push("tls_cert_path and tls_key_path must be set together".into());
        }
        if self.upstream.endpoints.is_empty() {
            match self.upstream.profile.as_deref() {
                Some(name) if resolve_upstream_profile(name).is_none() => {
                    issues.push(format!("Unknown upstream profile '{name}'"));
                }
                None => issues.push("No upstream endpoints configured".into()),
                _ => {}
            }
        }
        if self.tracker.queue_capacity == 0 {
            issues.push("tracker queue_capacity must be positive".into());
        }
        issues
    }
}

fn check_socket(address: &str, label: &str, issues: &mut Vec<String>) {
    if address.trim().is_empty() {
        issues.push(format!("{label} address is empty"));
        return;
    }
    if address.parse::<SocketAddr>().is_err() {
        issues.push(format!("{label} address is invalid: {address}"));
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("net", "doh-gateway", "doh-gateway")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("doh-gateway.toml"))
}

pub fn normalise_path(path: &str) -> String {
    if path.is_empty() {
        "/dns-query".into()
    } else if path.starts_with('/') {
        path.into()
    } else {
        format!("/{}", path)
    }
}

/// Outcome of writing a managed configuration file to disk.
#[derive(Debug, Clone)]
pub struct ConfigWriteOutcome {
    pub path: PathBuf,
    pub action: ConfigWriteAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWriteAction {
    Created,
    Updated,
    Skipped,
}

/// Write the commented default configuration template to `path`.
pub fn write_default_config(path: &Path, overwrite: bool) -> Result<ConfigWriteOutcome> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create config directory {}", parent.display())
        })?;
    }

    let rendered = render_default_config();
    let outcome = |action| ConfigWriteOutcome {
        path: path.to_path_buf(),
        action,
    };

    if path.exists() {
        if !overwrite {
            return Ok(outcome(ConfigWriteAction::Skipped));
        }
        let current = fs::read_to_string(path).unwrap_or_default();
        if current == rendered {
            return Ok(outcome(ConfigWriteAction::Skipped));
        }
        fs::write(path, rendered)
            .with_context(|| format!("Failed to update gateway config at {}", path.display()))?;
        return Ok(outcome(ConfigWriteAction::Updated));
    }

    fs::write(path, rendered)
        .with_context(|| format!("Failed to write gateway config to {}", path.display()))?;
    Ok(outcome(ConfigWriteAction::Created))
}

fn render_default_config() -> String {
    let mut output = String::new();
    output.push_str("# doh-gateway configuration\n");
    output.push_str("# Generated by `doh-gateway write-config`.\n\n");

    output.push_str("[server]\n");
    output.push_str(&format!("doh_listen = \"{}\"\n", default_doh_listen()));
    output.push_str(&format!("doh_path = \"{}\"\n", default_doh_path()));
    output.push_str("# tls_cert_path = \"/etc/doh-gateway/fullchain.pem\"\n");
    output.push_str("# tls_key_path = \"/etc/doh-gateway/privkey.pem\"\n");
    output.push_str("# dns_listen = \"127.0.0.1:5353\"\n");
    output.push_str("# admin_listen = \"127.0.0.1:9095\"\n\n");

    output.push_str("[upstream]\n");
    output.push_str(&format!("profile = \"{}\"\n", DEFAULT_UPSTREAM_PROFILE));
    output.push_str("# endpoints = [\"https://dns.google/resolve\"]\n");
    output.push_str(&format!(
        "timeout_seconds = {}\n",
        default_timeout_seconds()
    ));
    output.push_str("no_ecs = false\n\n");

    output.push_str("[auth]\n");
    output.push_str("enabled = true\n");
    output.push_str(&format!("public_key_path = \"{}\"\n", DEFAULT_PUBLIC_KEY_PATH));
    output.push_str(&format!("token_type = \"{}\"\n\n", DEFAULT_TOKEN_TYPE));

    output.push_str("[lists]\n");
    output.push_str("# directory = \"/var/lib/doh-gateway/lists\"\n\n");

    output.push_str("[tracker]\n");
    output.push_str("# path = \"/var/log/doh-gateway/requests.log\"\n");
    output.push_str(&format!("queue_capacity = {}\n", default_queue_capacity()));
    output.push_str(&format!(
        "flush_interval_seconds = {}\n",
        default_flush_interval_seconds()
    ));
    output.push_str(&format!(
        "flush_threshold_bytes = {}\n\n",
        default_flush_threshold_bytes()
    ));

    output.push_str("[logging]\n");
    output.push_str("log_queries = false\n");
    output.push_str("# json_directory = \"/var/log/doh-gateway\"\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalise_path_adds_leading_slash() {
        assert_eq!(normalise_path("dns"), "/dns");
        assert_eq!(normalise_path("/dns"), "/dns");
        assert_eq!(normalise_path(""), "/dns-query");
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: GatewayConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(cfg.server.doh_listen, "127.0.0.1:8053");
        assert_eq!(cfg.upstream.profile.as_deref(), Some(DEFAULT_UPSTREAM_PROFILE));
        assert!(cfg.auth.enabled);
        assert_eq!(cfg.auth.token_type, "dns_token");
        assert_eq!(cfg.tracker.queue_capacity, 1000);
        assert_eq!(cfg.tracker.flush_interval(), Duration::from_secs(30));
        assert_eq!(cfg.tracker.flush_threshold_bytes, 2048);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_reports_bad_addresses_and_unknown_profile() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [server]
            doh_listen = "not-an-address"
            tls_cert_path = "/tmp/cert.pem"

            [upstream]
            profile = "nowhere"
            "#,
        )
        .expect("parse config");
        let issues = cfg.validate();
        assert_eq!(issues.len(), 3, "{issues:?}");
        assert!(issues.iter().any(|i| i.contains("DoH listener")));
        assert!(issues.iter().any(|i| i.contains("tls_key_path")));
        assert!(issues.iter().any(|i| i.contains("nowhere")));
    }

    #[test]
    fn write_default_config_respects_overwrite_flag() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doh-gateway.toml");

        let outcome = write_default_config(&path, false).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Created);

        let outcome = write_default_config(&path, false).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Skipped);

        fs::write(&path, "junk = true\n").expect("write junk");
        let outcome = write_default_config(&path, true).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Updated);

        let cfg = GatewayConfig::load_config_file(&path).expect("rendered config parses");
        assert_eq!(cfg.server.doh_path, "/dns-query");
        assert_eq!(cfg.tracker.queue_capacity, 1000);
    }
}
