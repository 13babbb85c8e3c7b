use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use rust_decimal::prelude::*;

use crate::agent::{AgentManager, ProviderStats, ProviderStatsSink};
use crate::config::Config;
use crate::error::EngineError;
use crate::exchange::{ExchangeClient, ExchangeExecutor};
use crate::market_data::MarketDataCollector;
use crate::orchestrator::MultiAgentOrchestrator;
use crate::risk::{RiskConfig as DomainRiskConfig, RiskManager};
use crate::store::{BotState, Store};
use crate::trading::TradingOrchestrator;

/// Converts the config-file risk block (plain f64, user-editable) into the
/// decimal-based risk domain type `RiskManager` actually consumes.
fn domain_risk_config(config: &crate::config::RiskConfig) -> DomainRiskConfig {
    DomainRiskConfig {
        total_exposure_cap_pct: Decimal::from_f64(config.total_exposure_cap_pct).unwrap_or(Decimal::from(80)),
        liquidation_warning_pct: Decimal::from_f64(config.liquidation_warning_pct).unwrap_or(Decimal::from(20)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub duration: Duration,
    pub agents_processed: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
}

/// `execute_cycle()`'s state machine (§4.15): collect market data, fan out
/// decisions, apply the successful ones, persist BotState at the boundary.
pub struct CycleExecutor {
    config: Config,
    store: Arc<dyn Store>,
    market_client: Arc<dyn ExchangeClient>,
    executors_by_account: std::collections::HashMap<String, ExchangeExecutor>,
    http: reqwest::Client,
    provider_stats: Arc<tokio::sync::Mutex<ProviderStatsSink>>,
}

impl CycleExecutor {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        market_client: Arc<dyn ExchangeClient>,
        executors_by_account: std::collections::HashMap<String, ExchangeExecutor>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            store,
            market_client,
            executors_by_account,
            http,
            provider_stats: Arc::new(tokio::sync::Mutex::new(ProviderStatsSink::default())),
        }
    }

    /// Aggregate per-model token/error counters accumulated since the
    /// service started, not reset between cycles.
    pub async fn provider_stats_snapshot(&self) -> std::collections::HashMap<String, ProviderStats> {
        self.provider_stats.lock().await.all()
    }

    pub async fn execute_cycle(&self, service_start_time: chrono::DateTime<Utc>) -> Result<CycleSummary, EngineError> {
        let started = Instant::now();

        let collector = MarketDataCollector::new(self.market_client.clone(), self.config.trading.clone());
        let snapshot = match collector.collect().await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("cycle aborted: market data collection failed: {e}");
                self.persist_cycle_boundary(service_start_time, Some(e.to_string())).await;
                return Err(e);
            }
        };

        let agent_manager = AgentManager::new(self.store.as_ref());
        let agents = agent_manager.active_agents(&self.config.llm).await?;

        let deadline = Duration::from_secs_f64(self.config.scheduler.interval_seconds as f64 * self.config.scheduler.deadline_factor);
        let orchestrator = MultiAgentOrchestrator::new(
            self.store.clone(),
            self.http.clone(),
            self.config.llm.clone(),
            self.provider_stats.clone(),
        );
        let results = orchestrator
            .run(agents, snapshot.clone(), service_start_time, deadline, self.config.trading.coins.clone())
            .await;

        let risk_config = domain_risk_config(&self.config.risk);
        let risk = RiskManager::new(risk_config);

        let mut successful = 0usize;
        let mut failed = 0usize;
        let agents_processed = results.len();

        for result in results {
            let Some(executor) = self.executors_by_account.get(&result.agent.exchange_account) else {
                warn!("no ExchangeExecutor bound for account {}", result.agent.exchange_account);
                failed += 1;
                continue;
            };

            for warning in risk.liquidation_warnings(&result.context.positions) {
                warn!("agent {}: {warning}", result.agent.id);
            }

            match result.decision {
                Ok(decision) => {
                    let current_price = decision
                        .coin()
                        .and_then(|coin| snapshot.coins.get(coin))
                        .map(|c| Decimal::from_f64(c.current_price).unwrap_or_default())
                        .unwrap_or_default();

                    let trading = TradingOrchestrator::new(executor, self.store.as_ref(), &risk);
                    match trading
                        .apply(
                            &result.agent,
                            Some(result.decision_record_id),
                            &decision,
                            &result.context.account,
                            &result.context.positions,
                            current_price,
                        )
                        .await
                    {
                        Ok(()) => successful += 1,
                        Err(e) => {
                            warn!("applying decision for agent {} failed: {e}", result.agent.id);
                            failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("agent {} produced no actionable decision: {e}", result.agent.id);
                    failed += 1;
                }
            }
        }

        let duration = started.elapsed();
        info!(
            "cycle complete: duration={duration:?} agents_processed={agents_processed} successful={successful} failed={failed}"
        );

        self.persist_cycle_boundary(service_start_time, None).await;

        Ok(CycleSummary { duration, agents_processed, successful_executions: successful, failed_executions: failed })
    }

    async fn persist_cycle_boundary(&self, service_start_time: chrono::DateTime<Utc>, last_error: Option<String>) {
        let previous = self.store.load_bot_state().await.unwrap_or_default();
        let state = BotState {
            service_start_time: Some(service_start_time),
            cycle_count: previous.cycle_count + 1,
            last_cycle_time: Some(Utc::now()),
            last_error,
        };
        if let Err(e) = self.store.save_bot_state(state).await {
            error!("failed to persist bot_state at cycle boundary: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_risk_config_converts_from_config_block() {
        let config_risk = crate::config::RiskConfig::default();
        let domain = domain_risk_config(&config_risk);
        assert_eq!(domain.total_exposure_cap_pct, Decimal::from(80));
        assert_eq!(domain.liquidation_warning_pct, Decimal::from(20));
    }
}
