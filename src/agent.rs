use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::error::EngineError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Paused,
    Stopped,
}

/// One autonomous trading identity: an LLM endpoint, an on-chain account,
/// and a risk envelope. Agents are independent — each owns its own
/// `ExchangeExecutor` and is never shared across accounts (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub llm_model_id: String,
    pub exchange_account: String,
    pub initial_balance: Decimal,
    pub max_position_size_pct: Decimal,
    pub max_leverage: u32,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub strategy_description: String,
    pub status: AgentStatus,
    pub tpsl_grouping: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Per-model throughput/error tallies, surfaced so an operator can see which
/// LLM endpoint is degrading without digging through logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub failures: u64,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
}

/// Process-wide statistics sink every LLM call reports into, keyed by
/// `llm_model_id`. Lives for the whole service run, not one cycle.
#[derive(Default)]
pub struct ProviderStatsSink {
    stats: std::collections::HashMap<String, ProviderStats>,
}

impl ProviderStatsSink {
    pub fn record_success(&mut self, model_id: &str, tokens: u64, duration: std::time::Duration) {
        let entry = self.stats.entry(model_id.to_string()).or_default();
        entry.requests += 1;
        entry.total_tokens += tokens;
        entry.total_duration_ms += duration.as_millis() as u64;
    }

    pub fn record_failure(&mut self, model_id: &str) {
        let entry = self.stats.entry(model_id.to_string()).or_default();
        entry.requests += 1;
        entry.failures += 1;
    }

    pub fn stats_for(&self, model_id: &str) -> ProviderStats {
        self.stats.get(model_id).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> std::collections::HashMap<String, ProviderStats> {
        self.stats.clone()
    }
}

/// Loads the active-agent roster from the store at cycle start. Agents are
/// never cached across cycles — a paused/stopped edit takes effect on the
/// next cycle boundary (§4.9).
pub struct AgentManager<'a> {
    store: &'a dyn Store,
}

impl<'a> AgentManager<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Loads active agents and drops any whose `llm_model_id` does not
    /// resolve in the configured model pool, logging a warning for each.
    /// The unresolved agent is skipped in-process only — its store record
    /// is left untouched, so fixing the config brings it back next cycle.
    pub async fn active_agents(&self, llm: &LlmConfig) -> Result<Vec<Agent>, EngineError> {
        let all = self.store.list_agents().await?;
        Ok(all
            .into_iter()
            .filter(|a| a.is_active())
            .filter(|a| {
                let resolves = llm.models.contains_key(&a.llm_model_id);
                if !resolves {
                    log::warn!("agent {} ({}) references unknown llm_model_id {}, skipping this cycle", a.id, a.name, a.llm_model_id);
                }
                resolves
            })
            .collect())
    }

    pub fn providers_for(agents: &[Agent]) -> Vec<String> {
        let mut ids: Vec<String> = agents.iter().map(|a| a.llm_model_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
