use serde::Deserialize;
use std::path::Path;

/// Optional settings file. Command-line flags take precedence over it.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub restore: RestoreSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub token_id: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RestoreSettings {
    pub threads: usize,
    pub max_query_size: usize,
    pub poll_interval_ms: u64,
    pub credential_ttl_secs: u64,
    pub revoke_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub local_addr: String,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            max_query_size: branchdump_core::DEFAULT_MAX_QUERY_SIZE,
            poll_interval_ms: branchdump_core::DEFAULT_POLL_INTERVAL_MS,
            credential_ttl_secs: 5 * 60,
            revoke_timeout_secs: 5,
            connect_timeout_secs: 10,
            local_addr: "127.0.0.1:0".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&contents)?;
        Ok(settings)
    }
}
