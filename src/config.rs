// ai-writer-service/src/config.rs

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub llm: LlmConfig,
    pub images: ImageConfig,
    pub budget: BudgetConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Conservative fixed estimate for the pre-flight budget gate; actual
    /// cost is unknown before the call.
    pub estimated_call_cost: u64,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    /// Bounds the whole enrichment stage, independent of the chat timeout.
    pub stage_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit: u64,
    pub bonus: u64,
    /// Hours added to UTC before taking the calendar date for the ledger key.
    pub day_boundary_offset_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            // Start with default values
            .set_default("service.name", "ai-writer-service")?
            .set_default("service.log_level", "info")?
            .set_default("llm.api_url", "https://api.openai.com/v1/chat/completions")?
            .set_default("llm.api_key", "")?
            .set_default("llm.model", "gpt-4o-mini")?
            .set_default("llm.max_tokens", "2048")?
            .set_default("llm.temperature", "0.7")?
            .set_default("llm.timeout_secs", "60")?
            .set_default("llm.estimated_call_cost", "1500")?
            .set_default("llm.retry_backoff_ms", "2000")?
            .set_default("images.api_url", "https://api.pexels.com/v1/search")?
            .set_default("images.api_key", "")?
            .set_default("images.timeout_secs", "10")?
            .set_default("images.max_concurrent", "4")?
            .set_default("images.stage_timeout_secs", "30")?
            .set_default("budget.daily_limit", "5000")?
            .set_default("budget.bonus", "500")?
            .set_default("budget.day_boundary_offset_hours", "0")?
            .set_default("storage.path", "./data")?
            // Load from config file if it exists
            .add_source(File::with_name("config").required(false))
            // Override with environment variables (e.g., AIWRITER__LLM__API_KEY)
            .add_source(Environment::with_prefix("AIWRITER").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
