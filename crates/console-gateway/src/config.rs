use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use console_proxy::{ConsoleKind, OriginConfigError, OriginPolicy};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub origins: OriginsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_authority_url")]
    pub url: String,
    #[serde(default = "default_authority_timeout")]
    pub timeout_secs: u64,
    /// Sent as `Authorization: Bearer ...` on every validation call.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: default_authority_url(),
            timeout_secs: default_authority_timeout(),
            bearer_token: None,
        }
    }
}

impl AuthorityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// A bridge ends when the backend accepts no data for this long.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// Base URL of the page that serves each console client. A kind set to
/// `null` is not served at all.
#[derive(Debug, Deserialize)]
pub struct OriginsConfig {
    #[serde(default = "default_novnc_base")]
    pub novnc_base_url: Option<String>,
    #[serde(default = "default_spice_base")]
    pub spice_html5_base_url: Option<String>,
    #[serde(default = "default_serial_base")]
    pub serial_base_url: Option<String>,
    /// Additional console kinds, keyed by the name the authority reports.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for OriginsConfig {
    fn default() -> Self {
        Self {
            novnc_base_url: default_novnc_base(),
            spice_html5_base_url: default_spice_base(),
            serial_base_url: default_serial_base(),
            extra: BTreeMap::new(),
        }
    }
}

impl OriginsConfig {
    pub fn to_policy(&self) -> Result<OriginPolicy, OriginConfigError> {
        let builtin = [
            (ConsoleKind::NoVnc, &self.novnc_base_url),
            (ConsoleKind::SpiceHtml5, &self.spice_html5_base_url),
            (ConsoleKind::Serial, &self.serial_base_url),
        ];
        let entries = builtin
            .into_iter()
            .filter_map(|(kind, url)| url.as_deref().map(|url| (kind, url)))
            .chain(
                self.extra
                    .iter()
                    .map(|(kind, url)| (ConsoleKind::from(kind.as_str()), url.as_str())),
            );
        OriginPolicy::from_base_urls(entries)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit_log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:6080".to_string()
}

fn default_authority_url() -> String {
    "http://127.0.0.1:6090/v1/console-tokens".to_string()
}

fn default_authority_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    250
}

fn default_write_timeout() -> u64 {
    30
}

fn default_novnc_base() -> Option<String> {
    Some("http://127.0.0.1:6080/vnc_auto.html".to_string())
}

fn default_spice_base() -> Option<String> {
    Some("http://127.0.0.1:6082/spice_auto.html".to_string())
}

fn default_serial_base() -> Option<String> {
    Some("ws://127.0.0.1:6083/".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
