use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    DryRun,
    Testnet,
    Mainnet,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::DryRun
    }
}

impl Environment {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Environment::DryRun)
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::DryRun => "https://api.hyperliquid-testnet.xyz",
            Environment::Testnet => "https://api.hyperliquid-testnet.xyz",
            Environment::Mainnet => "https://api.hyperliquid.xyz",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interval_seconds: u64,
    pub deadline_factor: f64,
    pub misfire_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 180,
            deadline_factor: 0.9,
            misfire_grace_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub coins: Vec<String>,
    pub timeframes: Vec<String>,
    pub kline_limits: HashMap<String, usize>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let mut kline_limits = HashMap::new();
        kline_limits.insert("15m".to_string(), 100);
        kline_limits.insert("1h".to_string(), 100);
        Self {
            coins: vec!["BTC".to_string(), "ETH".to_string()],
            timeframes: vec!["15m".to_string(), "1h".to_string()],
            kline_limits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_leverage: u32,
    pub max_position_size_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub total_exposure_cap_pct: f64,
    pub liquidation_warning_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: 10,
            max_position_size_pct: 20.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 5.0,
            total_exposure_cap_pct: 80.0,
            liquidation_warning_pct: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Official,
    OpenRouter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider_kind: ProviderKind,
    pub endpoint_base_url: String,
    /// Name of the environment variable holding the API key, never the key itself.
    pub api_key_ref: String,
    pub provider_model_name: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub models: HashMap<String, ModelConfig>,
    pub default_max_tokens: u32,
    pub default_temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            default_max_tokens: 1024,
            default_temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub grace_shutdown_seconds: u64,
    pub consecutive_fatal_cycles_threshold: u32,
    pub data_dir: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            grace_shutdown_seconds: 180,
            consecutive_fatal_cycles_threshold: 5,
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub service: ServiceSettings,
}

impl Config {
    /// Layered load: compiled defaults -> optional `config.toml` -> environment
    /// variables (via a `.env` file if present, then the process environment).
    pub fn load() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Ok(raw) = std::fs::read_to_string("config.toml") {
            config = toml::from_str(&raw)
                .map_err(|e| EngineError::Configuration(format!("config.toml: {e}")))?;
        }

        if let Ok(env) = std::env::var("ENGINE_ENVIRONMENT") {
            config.environment = match env.as_str() {
                "dry-run" => Environment::DryRun,
                "testnet" => Environment::Testnet,
                "mainnet" => Environment::Mainnet,
                other => {
                    return Err(EngineError::Configuration(format!(
                        "unknown ENGINE_ENVIRONMENT: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("ENGINE_SCHEDULER_INTERVAL_SECONDS") {
            config.scheduler.interval_seconds = v.parse().map_err(|_| {
                EngineError::Configuration("ENGINE_SCHEDULER_INTERVAL_SECONDS must be an integer".into())
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.trading.coins.is_empty() {
            return Err(EngineError::Configuration("trading.coins must not be empty".into()));
        }
        if self.scheduler.deadline_factor <= 0.0 || self.scheduler.deadline_factor > 1.0 {
            return Err(EngineError::Configuration(
                "scheduler.deadline_factor must be in (0, 1]".into(),
            ));
        }
        if self.risk.max_leverage == 0 || self.risk.max_leverage > 50 {
            return Err(EngineError::Configuration(
                "risk.max_leverage must be in [1, 50]".into(),
            ));
        }
        Ok(())
    }
}

/// The single explicit, startup-constructed value threaded by reference into
/// every component. No component reads `std::env` or a global static directly;
/// everything reachable goes through here (per the anti-singleton guidance).
pub struct ServiceContext {
    pub config: Config,
    pub http_client: reqwest::Client,
}

impl ServiceContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            http_client: reqwest::Client::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_coin_whitelist() {
        let mut config = Config::default();
        config.trading.coins.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_deadline_factor() {
        let mut config = Config::default();
        config.scheduler.deadline_factor = 1.5;
        assert!(config.validate().is_err());
    }
}
