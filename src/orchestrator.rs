use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::agent::{Agent, ProviderStatsSink};
use crate::config::LlmConfig;
use crate::decision::{Decision, DecisionParser};
use crate::error::EngineError;
use crate::llm::{build_provider, generate_with_retry};
use crate::market_data::MarketSnapshot;
use crate::position::{AccountSnapshot, Position, PositionManager};
use crate::prompt::PromptBuilder;
use crate::store::{DecisionRecord, DecisionStatus, Store};

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub minutes_since_start: i64,
    pub invocation_count: u64,
}

pub struct AgentCycleResult {
    pub agent: Agent,
    pub context: AgentContext,
    pub decision: Result<Decision, EngineError>,
    /// id of the DecisionRecord persisted for this cycle, whether the
    /// decision succeeded or failed. Threaded into TradingOrchestrator::apply
    /// so every resulting Trade carries the originating decision's id.
    pub decision_record_id: Uuid,
}

/// Fans out one prompt/generate/parse/persist pipeline per active agent,
/// bounded by the cycle deadline. One agent's failure never cancels peers
/// (§4.9) — each task is isolated behind its own `tokio::time::timeout`.
pub struct MultiAgentOrchestrator {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    llm: LlmConfig,
    provider_stats: Arc<tokio::sync::Mutex<ProviderStatsSink>>,
}

impl MultiAgentOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        http: reqwest::Client,
        llm: LlmConfig,
        provider_stats: Arc<tokio::sync::Mutex<ProviderStatsSink>>,
    ) -> Self {
        Self { store, http, llm, provider_stats }
    }

    pub async fn run(
        &self,
        agents: Vec<Agent>,
        snapshot: Arc<MarketSnapshot>,
        service_start_time: chrono::DateTime<Utc>,
        deadline: Duration,
        allowed_coins: Vec<String>,
    ) -> Vec<AgentCycleResult> {
        let mut set = tokio::task::JoinSet::new();

        for agent in agents {
            let store = self.store.clone();
            let http = self.http.clone();
            let llm = self.llm.clone();
            let snapshot = snapshot.clone();
            let allowed_coins = allowed_coins.clone();
            let provider_stats = self.provider_stats.clone();

            set.spawn(async move {
                Self::run_one(store, http, llm, agent, snapshot, service_start_time, deadline, allowed_coins, provider_stats).await
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => out.push(result),
                Err(e) => warn!("agent cycle task panicked: {e}"),
            }
        }
        out
    }

    async fn run_one(
        store: Arc<dyn Store>,
        http: reqwest::Client,
        llm: LlmConfig,
        agent: Agent,
        snapshot: Arc<MarketSnapshot>,
        service_start_time: chrono::DateTime<Utc>,
        deadline: Duration,
        allowed_coins: Vec<String>,
        provider_stats: Arc<tokio::sync::Mutex<ProviderStatsSink>>,
    ) -> AgentCycleResult {
        let started = std::time::Instant::now();
        let minutes_since_start = (Utc::now() - service_start_time).num_minutes();
        let decisions_so_far = store.decisions_for_agent(agent.id, usize::MAX).await.unwrap_or_default().len() as u64;
        let invocation_count = decisions_so_far + 1;

        let outcome = tokio::time::timeout(
            deadline,
            Self::generate_decision(
                &store,
                &http,
                &llm,
                &agent,
                &snapshot,
                &allowed_coins,
                minutes_since_start,
                invocation_count,
                &provider_stats,
            ),
        )
        .await;

        let live_prices = snapshot
            .coins
            .values()
            .map(|c| (c.coin.clone(), c.current_price))
            .collect();

        let position_manager = PositionManager::new(store.as_ref());
        let positions = position_manager.positions_for_agent(agent.id, &live_prices).await.unwrap_or_default();
        let account = position_manager
            .account_snapshot(agent.id, agent.initial_balance, &live_prices)
            .await
            .unwrap_or_else(|_| AccountSnapshot {
                total_value: agent.initial_balance,
                cash_balance: agent.initial_balance,
                position_value: rust_decimal::Decimal::ZERO,
                unrealized_pnl: rust_decimal::Decimal::ZERO,
                realized_pnl_to_date: rust_decimal::Decimal::ZERO,
            });

        let context = AgentContext { account, positions, minutes_since_start, invocation_count };

        let (decision, status, llm_response, error_message) = match outcome {
            Ok(Ok((decision, raw_text))) => (Ok(decision), DecisionStatus::Success, Some(raw_text), None),
            Ok(Err(e)) => {
                let status = if matches!(e, EngineError::Parse(_)) { DecisionStatus::ParsingError } else { DecisionStatus::Failed };
                (Err(e.clone()), status, None, Some(e.to_string()))
            }
            Err(_) => (Err(EngineError::Deadline), DecisionStatus::Failed, None, Some("deadline".to_string())),
        };

        let decision_record_id = Uuid::new_v4();
        let record = DecisionRecord {
            id: decision_record_id,
            agent_id: agent.id,
            timestamp: Utc::now(),
            status,
            decision: decision.as_ref().ok().cloned(),
            llm_prompt: None,
            llm_response,
            execution_time_ms: started.elapsed().as_millis() as u64,
            error_message,
        };
        if let Err(e) = store.record_decision(record).await {
            warn!("failed to persist decision record for agent {}: {e}", agent.id);
        }

        AgentCycleResult { agent, context, decision, decision_record_id }
    }

    async fn generate_decision(
        store: &Arc<dyn Store>,
        http: &reqwest::Client,
        llm: &LlmConfig,
        agent: &Agent,
        snapshot: &MarketSnapshot,
        allowed_coins: &[String],
        minutes_since_start: i64,
        invocation_count: u64,
        provider_stats: &Arc<tokio::sync::Mutex<ProviderStatsSink>>,
    ) -> Result<(Decision, String), EngineError> {
        let model_config = llm
            .models
            .get(&agent.llm_model_id)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("unknown llm_model_id: {}", agent.llm_model_id)))?;

        let live_prices = snapshot.coins.values().map(|c| (c.coin.clone(), c.current_price)).collect();
        let position_manager = PositionManager::new(store.as_ref());
        let positions = position_manager.positions_for_agent(agent.id, &live_prices).await?;
        let account = position_manager.account_snapshot(agent.id, agent.initial_balance, &live_prices).await?;

        let prompt = PromptBuilder::build(agent, snapshot, &account, &positions, minutes_since_start, invocation_count);

        let provider = build_provider(http.clone(), model_config.clone())?;
        let result = generate_with_retry(provider.as_ref(), &prompt, llm.default_max_tokens, llm.default_temperature).await;

        let result = match result {
            Ok(r) => {
                provider_stats.lock().await.record_success(&agent.llm_model_id, r.total_tokens, r.duration);
                r
            }
            Err(e) => {
                provider_stats.lock().await.record_failure(&agent.llm_model_id);
                return Err(e);
            }
        };

        let decision = DecisionParser::parse(&result.text, allowed_coins)?;

        let reference_price = decision
            .coin()
            .and_then(|coin| snapshot.coins.get(coin))
            .map(|c| rust_decimal::Decimal::try_from(c.current_price).unwrap_or_default())
            .unwrap_or_default();

        DecisionParser::validate_against_context(&decision, &positions, reference_price)?;

        Ok((decision, result.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::config::LlmConfig;
    use crate::store::JsonFileStore;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn test_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            llm_model_id: "does-not-exist".to_string(),
            exchange_account: "acct".to_string(),
            initial_balance: dec!(10000),
            max_position_size_pct: dec!(20),
            max_leverage: 10,
            stop_loss_pct: dec!(2),
            take_profit_pct: dec!(5),
            strategy_description: String::new(),
            status: AgentStatus::Active,
            tpsl_grouping: "positionTpsl".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unresolved_model_reference_yields_failed_decision_record() {
        let path = std::env::temp_dir().join(format!("hl-agent-engine-orch-test-{}.json", Uuid::new_v4()));
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(&path));
        let orchestrator = MultiAgentOrchestrator::new(
            store.clone(),
            reqwest::Client::new(),
            LlmConfig::default(),
            Arc::new(tokio::sync::Mutex::new(ProviderStatsSink::default())),
        );

        let snapshot = Arc::new(MarketSnapshot { produced_at: Utc::now(), coins: HashMap::new() });
        let results = orchestrator
            .run(vec![test_agent()], snapshot, Utc::now(), Duration::from_secs(5), vec!["BTC".to_string()])
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].decision.is_err());

        let records = store.decisions_for_agent(results[0].agent.id, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DecisionStatus::Failed);

        let _ = std::fs::remove_file(&path);
    }
}
