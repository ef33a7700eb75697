//! Layered configuration.
//!
//! Sources, highest priority first:
//! 1. `PRO_SEARCH_*` environment variables (`__` separates sections, e.g.
//!    `PRO_SEARCH_LLM__MODEL`)
//! 2. `pro-search.toml` in the working directory
//! 3. Built-in defaults
//!
//! `OPENAI_API_KEY` and `FIRECRAWL_API_KEY` fill the provider keys when the
//! prefixed variables are absent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Plan;
use crate::tools::llm::TokenUsage;
use crate::tools::RetryPolicy;

pub const CONFIG_FILE: &str = "pro-search.toml";
const ENV_PREFIX: &str = "PRO_SEARCH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub research: ResearchConfig,
    pub models: Vec<ModelSpec>,
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            timeout_secs: 120,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    /// Results requested per query.
    pub result_limit: usize,
    /// Queries generated per topic.
    pub max_queries: usize,
    /// Scraped page content is trimmed to this many tokens.
    pub content_token_cap: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.firecrawl.dev".to_string(),
            api_key: String::new(),
            timeout_secs: 15,
            result_limit: 1,
            max_queries: 2,
            content_token_cap: 25_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_topics: usize,
    pub max_learnings: usize,
    pub learnings_token_budget: usize,
    /// Most recent chat turns forwarded to the planner and compiler.
    pub history_turns: usize,
    pub credits: ResearchCredits,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_topics: 5,
            max_learnings: 3,
            learnings_token_budget: 150_000,
            history_turns: 5,
            credits: ResearchCredits::default(),
        }
    }
}

/// Research runs allowed per billing month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchCredits {
    pub free: u32,
    pub pro: u32,
}

impl Default for ResearchCredits {
    fn default() -> Self {
        Self { free: 2, pro: 20 }
    }
}

impl ResearchCredits {
    pub fn for_plan(&self, plan: &Plan) -> u32 {
        if plan.is_free() {
            self.free
        } else {
            self.pro
        }
    }
}

/// Selectable model and its price in points per thousand tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl ModelSpec {
    pub fn unpriced(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            input_cost: 0.0,
            output_cost: 0.0,
            multiplier: 1.0,
        }
    }

    pub fn points(&self, usage: TokenUsage) -> f64 {
        let input = usage.input_tokens as f64 / 1_000.0 * self.input_cost;
        let output = usage.output_tokens as f64 / 1_000.0 * self.output_cost;
        (input + output) * self.multiplier
    }
}

/// Account provisioned at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSeed {
    pub email: String,
    pub token: String,
    pub plan: Plan,
    #[serde(default)]
    pub points_used: f64,
    #[serde(default)]
    pub points_reset_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan_end_date: Option<DateTime<Utc>>,
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Config = Self::figment().extract().map_err(Box::new)?;
        config.apply_well_known_keys();
        Ok(config)
    }

    /// Loads `.env` first, then the layered sources.
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::load()
    }

    fn apply_well_known_keys(&mut self) {
        if self.llm.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.llm.api_key = key;
            }
        }
        if self.search.api_key.is_empty() {
            if let Ok(key) = std::env::var("FIRECRAWL_API_KEY") {
                self.search.api_key = key;
            }
        }
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Catalogue entry for the configured default model, unpriced if it is not in the catalogue.
    pub fn default_model(&self) -> ModelSpec {
        self.model(&self.llm.model)
            .cloned()
            .unwrap_or_else(|| ModelSpec::unpriced(&self.llm.model))
    }
}
