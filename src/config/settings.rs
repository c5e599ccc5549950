use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub nlu: NluConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NluProvider {
    #[default]
    Anthropic,
    Bedrock,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NluConfig {
    #[serde(default)]
    pub provider: NluProvider,
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub aws_region: Option<String>,
    #[serde(default = "default_nlu_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub store_path: Option<PathBuf>,
}

/// Static bearer tokens accepted by the web server, mapped to the user id
/// recorded as `created_by` on every write.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub local_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_nlu_timeout() -> u64 {
    20
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:3141".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    15
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_min_confidence() -> f64 {
    0.6
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            provider: NluProvider::default(),
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            aws_region: None,
            timeout_secs: default_nlu_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            store_path: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_token: None,
            local_path: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cache_ttl_secs: default_cache_ttl(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl Config {
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.server.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("store.db")),
        }
    }

    pub fn local_path(&self) -> Result<PathBuf> {
        match &self.client.local_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("local.db")),
        }
    }
}

pub fn data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".sitelog"))
        .context("Could not find home directory")
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.toml"))
}

pub fn env_file() -> Result<PathBuf> {
    Ok(data_dir()?.join("env"))
}

/// Load `KEY=VALUE` lines into the environment without overriding variables
/// that are already set.
pub fn load_env_file(path: &Path) {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
            }
        }
    }
}

pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Ok(env) = env_file() {
        load_env_file(&env);
    }
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => config_path()?,
    };
    if !path.exists() {
        if explicit.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.nlu.provider, NluProvider::Anthropic);
        assert_eq!(cfg.nlu.timeout_secs, 20);
        assert_eq!(cfg.server.port, 3141);
        assert!(cfg.auth.tokens.is_empty());
        assert_eq!(cfg.sync.cache_ttl_secs, 300);
    }

    #[test]
    fn test_partial_sections() {
        let cfg = parse_config(
            r#"
            [nlu]
            provider = "bedrock"
            aws_region = "eu-central-1"
            timeout_secs = 5

            [auth.tokens]
            "secret-token" = "polier-1"

            [client]
            api_base_url = "https://baustellen.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.nlu.provider, NluProvider::Bedrock);
        assert_eq!(cfg.nlu.timeout_secs, 5);
        assert_eq!(cfg.nlu.model, default_model());
        assert_eq!(cfg.auth.tokens.get("secret-token").map(String::as_str), Some("polier-1"));
        assert_eq!(cfg.client.api_base_url, "https://baustellen.example.com");
        assert_eq!(cfg.client.request_timeout_secs, 10);
    }

    #[test]
    fn test_env_file_does_not_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env");
        std::fs::write(
            &path,
            "# comment\nSITELOG_TEST_A=\"from-file\"\nSITELOG_TEST_B=from-file\n",
        )
        .unwrap();
        std::env::set_var("SITELOG_TEST_B", "from-env");
        load_env_file(&path);
        assert_eq!(std::env::var("SITELOG_TEST_A").unwrap(), "from-file");
        assert_eq!(std::env::var("SITELOG_TEST_B").unwrap(), "from-env");
    }
}
