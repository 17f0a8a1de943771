use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// `None` follows HTTPS_PROXY/HTTP_PROXY, `Some("")` forces a direct connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Malformed or unknown tool calls tolerated before the run is abandoned.
    #[serde(default = "default_max_malformed_calls")]
    pub max_malformed_calls: u32,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_retry_delay_ms")]
    pub llm_retry_delay_ms: u64,
    /// Upper bound on reading the final page state and closing the browser.
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_malformed_calls() -> u32 {
    3
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_llm_max_retries() -> u32 {
    2
}

fn default_llm_retry_delay_ms() -> u64 {
    1000
}

fn default_teardown_timeout_ms() -> u64 {
    2_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_malformed_calls: default_max_malformed_calls(),
            run_timeout_secs: default_run_timeout_secs(),
            llm_max_retries: default_llm_max_retries(),
            llm_retry_delay_ms: default_llm_retry_delay_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<String>,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_click_timeout_ms")]
    pub click_timeout_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_headless() -> bool {
    true
}

fn default_viewport_width() -> u32 {
    1366
}

fn default_viewport_height() -> u32 {
    900
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string()
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

fn default_click_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            chrome_path: None,
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            user_agent: default_user_agent(),
            launch_timeout_secs: default_launch_timeout_secs(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            click_timeout_ms: default_click_timeout_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Longer texts are almost never navigation controls.
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    /// Elements whose tops differ by less than this share a reading row.
    #[serde(default = "default_row_threshold_px")]
    pub row_threshold_px: f64,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

fn default_max_text_len() -> usize {
    100
}

fn default_row_threshold_px() -> f64 {
    10.0
}

fn default_max_elements() -> usize {
    150
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_text_len: default_max_text_len(),
            row_threshold_px: default_row_threshold_px(),
            max_elements: default_max_elements(),
        }
    }
}

/// Click-target scoring weights.
///
/// The bonus values were tuned by hand against a handful of utility sites and
/// should be recalibrated as more providers are covered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverWeights {
    #[serde(default = "default_exact_score")]
    pub exact_score: u32,
    #[serde(default = "default_target_contains_score")]
    pub target_contains_score: u32,
    #[serde(default = "default_text_contains_score")]
    pub text_contains_score: u32,
    #[serde(default = "default_synonym_exact_score")]
    pub synonym_exact_score: u32,
    #[serde(default = "default_synonym_partial_score")]
    pub synonym_partial_score: u32,
    /// Minimum element text length for the "target contains text" rule.
    #[serde(default = "default_min_contained_len")]
    pub min_contained_len: usize,
    #[serde(default = "default_account_bonus")]
    pub account_bonus: u32,
    #[serde(default = "default_payment_bonus")]
    pub payment_bonus: u32,
    #[serde(default = "default_link_bonus")]
    pub link_bonus: u32,
    #[serde(default = "default_account_keywords")]
    pub account_keywords: Vec<String>,
    #[serde(default = "default_payment_keywords")]
    pub payment_keywords: Vec<String>,
}

fn default_exact_score() -> u32 {
    100
}

fn default_target_contains_score() -> u32 {
    85
}

fn default_text_contains_score() -> u32 {
    80
}

fn default_synonym_exact_score() -> u32 {
    90
}

fn default_synonym_partial_score() -> u32 {
    70
}

fn default_min_contained_len() -> usize {
    3
}

fn default_account_bonus() -> u32 {
    10
}

fn default_payment_bonus() -> u32 {
    5
}

fn default_link_bonus() -> u32 {
    5
}

fn default_account_keywords() -> Vec<String> {
    ["account", "login", "log in", "sign in", "signin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_payment_keywords() -> Vec<String> {
    ["pay", "bill"].iter().map(|s| s.to_string()).collect()
}

impl Default for ResolverWeights {
    fn default() -> Self {
        Self {
            exact_score: default_exact_score(),
            target_contains_score: default_target_contains_score(),
            text_contains_score: default_text_contains_score(),
            synonym_exact_score: default_synonym_exact_score(),
            synonym_partial_score: default_synonym_partial_score(),
            min_contained_len: default_min_contained_len(),
            account_bonus: default_account_bonus(),
            payment_bonus: default_payment_bonus(),
            link_bonus: default_link_bonus(),
            account_keywords: default_account_keywords(),
            payment_keywords: default_payment_keywords(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationConfig {
    #[serde(default = "default_signal_timeout_ms")]
    pub network_idle_timeout_ms: u64,
    #[serde(default = "default_signal_timeout_ms")]
    pub dom_ready_timeout_ms: u64,
    #[serde(default = "default_signal_timeout_ms")]
    pub url_change_timeout_ms: u64,
    #[serde(default = "default_signal_timeout_ms")]
    pub title_change_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Main-content growth factor that counts as an in-place SPA transition.
    #[serde(default = "default_spa_growth_ratio")]
    pub spa_growth_ratio: f64,
    #[serde(default = "default_spa_min_growth_chars")]
    pub spa_min_growth_chars: u64,
}

fn default_signal_timeout_ms() -> u64 {
    8_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_spa_growth_ratio() -> f64 {
    1.25
}

fn default_spa_min_growth_chars() -> u64 {
    200
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            network_idle_timeout_ms: default_signal_timeout_ms(),
            dom_ready_timeout_ms: default_signal_timeout_ms(),
            url_change_timeout_ms: default_signal_timeout_ms(),
            title_change_timeout_ms: default_signal_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            spa_growth_ratio: default_spa_growth_ratio(),
            spa_min_growth_chars: default_spa_min_growth_chars(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub resolver: ResolverWeights,
    #[serde(default)]
    pub navigation: NavigationConfig,
    /// Provider name -> seed URL for that provider's payment site.
    #[serde(default)]
    pub sites: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// API key from the config file, then `PAYNAV_API_KEY`, then `OPENAI_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        let key = self.provider.api_key.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
        ["PAYNAV_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }

    /// Seed URL for a provider name, matched case-insensitively.
    pub fn seed_url(&self, provider_name: &str) -> Result<&str> {
        let wanted = provider_name.trim().to_lowercase();
        self.sites
            .iter()
            .find(|(name, _)| name.trim().to_lowercase() == wanted)
            .map(|(_, url)| url.as_str())
            .ok_or_else(|| Error::Config(format!("no seed URL configured for provider '{}'", provider_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "provider": { "model": "gpt-4o" },
  "resolver": { "accountBonus": 12 },
  "sites": { "City Water": "https://water.example.com" }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.provider.model, "gpt-4o");
        assert_eq!(cfg.provider.api_base, "https://api.openai.com/v1");
        assert_eq!(cfg.resolver.account_bonus, 12);
        assert_eq!(cfg.resolver.exact_score, 100);
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.snapshot.max_text_len, 100);
        assert_eq!(cfg.navigation.poll_interval_ms, 100);
    }

    #[test]
    fn test_seed_url_is_case_insensitive() {
        let mut cfg = Config::default();
        cfg.sites.insert("City Water".to_string(), "https://water.example.com".to_string());
        assert_eq!(cfg.seed_url("city water").unwrap(), "https://water.example.com");
        assert!(matches!(cfg.seed_url("Gas Co"), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.browser.headless = false;
        cfg.sites.insert("Power".to_string(), "https://power.example.com".to_string());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.browser.headless);
        assert_eq!(loaded.sites.get("Power").map(String::as_str), Some("https://power.example.com"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.browser.viewport_width, 1366);
    }
}
