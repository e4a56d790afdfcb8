//! Configuration from `~/.config/atlas/config.toml` plus environment
//! overrides. Every field has a default so a missing file is fine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ApiConfig;
use crate::bipro::BiproCredentials;
use crate::classify::DEFAULT_RAW_XML_PATTERNS;
use crate::llm::LlmConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://acencia.info/api".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ApiSection {
    fn default() -> Self {
        Self { base_url: default_base_url(), timeout_secs: default_timeout_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_triage_model")]
    pub triage_model: String,
    #[serde(default = "default_detail_model")]
    pub detail_model: String,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

fn default_llm_endpoint() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_triage_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_detail_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_max_concurrent_calls() -> usize {
    crate::llm::DEFAULT_MAX_CONCURRENT_CALLS
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            triage_model: default_triage_model(),
            detail_model: default_detail_model(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_raw_xml_patterns")]
    pub raw_xml_patterns: Vec<String>,
}

fn default_max_workers() -> usize {
    crate::batch::orchestrator::DEFAULT_MAX_WORKERS
}

fn default_raw_xml_patterns() -> Vec<String> {
    DEFAULT_RAW_XML_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl Default for ProcessingSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            raw_xml_patterns: default_raw_xml_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    20
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { refresh_interval_secs: default_refresh_interval_secs() }
    }
}

/// BiPRO connection settings for the CLI commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiproSection {
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub sts_endpoint_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub vu_name: String,
    #[serde(default)]
    pub vu_number: String,
    #[serde(default)]
    pub consumer_id: String,
    #[serde(default)]
    pub pfx_path: Option<PathBuf>,
    #[serde(default)]
    pub pfx_password: String,
    #[serde(default)]
    pub jks_path: Option<PathBuf>,
    #[serde(default)]
    pub jks_password: String,
    #[serde(default)]
    pub jks_alias: String,
    #[serde(default)]
    pub jks_key_password: String,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl BiproSection {
    pub fn credentials(&self) -> BiproCredentials {
        BiproCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            endpoint_url: self.endpoint_url.clone(),
            vu_name: self.vu_name.clone(),
            vu_number: self.vu_number.clone(),
            sts_endpoint_url: self.sts_endpoint_url.clone(),
            consumer_id: self.consumer_id.clone(),
            pfx_path: self.pfx_path.clone(),
            pfx_password: self.pfx_password.clone(),
            jks_path: self.jks_path.clone(),
            jks_password: self.jks_password.clone(),
            jks_alias: self.jks_alias.clone(),
            jks_key_password: self.jks_key_password.clone(),
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtlasConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub processing: ProcessingSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub bipro: BiproSection,
}

impl AtlasConfig {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("atlas")
            .join("config.toml")
    }

    /// Load the config file, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string(Self::config_path()) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Konfiguration nicht lesbar, verwende Defaults: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("ATLAS_API_URL") {
            config.api.base_url = url;
        }
        if let Ok(endpoint) = std::env::var("ATLAS_LLM_ENDPOINT") {
            config.llm.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("ATLAS_LLM_API_KEY") {
            config.llm.api_key = key;
        }

        config
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api.base_url.clone(),
            timeout: Duration::from_secs(self.api.timeout_secs),
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            endpoint: self.llm.endpoint.clone(),
            api_key: self.llm.api_key.clone(),
            triage_model: self.llm.triage_model.clone(),
            detail_model: self.llm.detail_model.clone(),
            max_concurrent_calls: self.llm.max_concurrent_calls,
            ..LlmConfig::default()
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AtlasConfig::default();
        assert_eq!(config.api.base_url, "https://acencia.info/api");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.processing.max_workers, 8);
        assert_eq!(config.llm.max_concurrent_calls, 5);
        assert_eq!(config.cache.refresh_interval_secs, 20);
        assert!(!config.processing.raw_xml_patterns.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AtlasConfig = toml::from_str(
            r#"
            [api]
            base_url = "https://test.example/api"

            [bipro]
            endpoint_url = "https://transfer.degenia.de/430_Transfer/Service"
            username = "u"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.base_url, "https://test.example/api");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.bipro.username, "u");
        assert_eq!(config.llm.triage_model, "openai/gpt-4o-mini");
    }
}
