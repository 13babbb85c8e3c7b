use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};

use crate::config::{Config, ServiceContext};
use crate::cycle::CycleExecutor;
use crate::exchange::{AssetInfo, ExchangeClient, ExchangeExecutor, LiveExchangeClient};
use crate::scheduler::Scheduler;
use crate::store::{JsonFileStore, Store};

/// Top-level process lifecycle (§4.16). `start()` restores BotState, wires
/// every component through one `ServiceContext`, and drives the Scheduler
/// until a shutdown signal or a consecutive-fatal-cycle streak stops it.
pub struct Service {
    ctx: Arc<ServiceContext>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self { ctx: ServiceContext::new(config) }
    }

    pub async fn start(self) -> Result<(), crate::error::EngineError> {
        let config = &self.ctx.config;
        let http = self.ctx.http_client.clone();
        info!("hl-agent-engine starting, environment={:?}", config.environment);

        let store: Arc<dyn Store> = Arc::new(JsonFileStore::load(format!("{}/state.json", config.service.data_dir)).await);

        let bot_state = store.load_bot_state().await?;
        let service_start_time = bot_state.service_start_time.unwrap_or_else(Utc::now);
        info!(
            "resumed bot_state: cycle_count={} service_start_time={service_start_time}",
            bot_state.cycle_count
        );

        let market_client: Arc<dyn ExchangeClient> =
            Arc::new(LiveExchangeClient::new(config.environment.base_url(), http.clone()));

        let executors_by_account = self.build_executors(store.as_ref(), market_client.clone(), http.clone()).await?;

        let cycle_executor = Arc::new(CycleExecutor::new(
            config.clone(),
            store.clone(),
            market_client,
            executors_by_account,
            http,
        ));

        let scheduler = Scheduler::new(
            Duration::from_secs(config.scheduler.interval_seconds),
            Duration::from_secs(config.scheduler.misfire_grace_seconds),
        );

        let consecutive_fatal = Arc::new(AtomicU32::new(0));
        let fatal_threshold = config.service.consecutive_fatal_cycles_threshold;

        let scheduler_for_run = scheduler.clone();
        let run_handle = tokio::spawn({
            let scheduler = scheduler_for_run.clone();
            let cycle_executor = cycle_executor.clone();
            let consecutive_fatal = consecutive_fatal.clone();
            async move {
                scheduler
                    .run(|| {
                        let cycle_executor = cycle_executor.clone();
                        let consecutive_fatal = consecutive_fatal.clone();
                        let scheduler = scheduler.clone();
                        async move {
                            match cycle_executor.execute_cycle(service_start_time).await {
                                Ok(summary) => {
                                    consecutive_fatal.store(0, Ordering::SeqCst);
                                    info!(
                                        "cycle_summary duration_ms={} agents_processed={} successful={} failed={}",
                                        summary.duration.as_millis(),
                                        summary.agents_processed,
                                        summary.successful_executions,
                                        summary.failed_executions
                                    );
                                    for (model_id, stats) in cycle_executor.provider_stats_snapshot().await {
                                        info!(
                                            "provider_stats model={model_id} requests={} failures={} total_tokens={} total_duration_ms={}",
                                            stats.requests, stats.failures, stats.total_tokens, stats.total_duration_ms
                                        );
                                    }
                                }
                                Err(e) if e.is_fatal() => {
                                    let count = consecutive_fatal.fetch_add(1, Ordering::SeqCst) + 1;
                                    error!("fatal cycle error ({count}/{fatal_threshold}): {e}");
                                    if count >= fatal_threshold {
                                        error!("consecutive fatal cycle threshold reached, stopping scheduler");
                                        scheduler.stop();
                                    }
                                }
                                Err(e) => {
                                    warn!("cycle failed (non-fatal): {e}");
                                }
                            }
                        }
                    })
                    .await;
            }
        });

        Self::wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping scheduler gracefully");
        scheduler.stop();

        let grace = Duration::from_secs(config.service.grace_shutdown_seconds);
        if tokio::time::timeout(grace, run_handle).await.is_err() {
            warn!("graceful shutdown grace period elapsed, forcing exit");
        }

        info!("hl-agent-engine stopped");
        Ok(())
    }

    /// Builds one `ExchangeExecutor` per distinct `exchange_account` named by
    /// an active agent. `exchange_account` holds the *name* of the
    /// environment variable carrying the private key, never the key itself.
    async fn build_executors(
        &self,
        store: &dyn Store,
        market_client: Arc<dyn ExchangeClient>,
        http: reqwest::Client,
    ) -> Result<HashMap<String, ExchangeExecutor>, crate::error::EngineError> {
        let asset_ctxs = market_client.meta_and_asset_ctxs().await?;
        let asset_info: HashMap<String, AssetInfo> = asset_ctxs
            .into_iter()
            .map(|ctx| (ctx.coin, AssetInfo { asset_index: ctx.asset_index, sz_decimals: ctx.sz_decimals, max_leverage: ctx.max_leverage }))
            .collect();

        let agents = crate::agent::AgentManager::new(store).active_agents(&self.ctx.config.llm).await?;
        let mut accounts: Vec<String> = agents.into_iter().map(|a| a.exchange_account).collect();
        accounts.sort();
        accounts.dedup();

        let mut executors = HashMap::new();
        for account_env_var in accounts {
            let private_key = std::env::var(&account_env_var).map_err(|_| {
                crate::error::EngineError::Configuration(format!("environment variable {account_env_var} is not set"))
            })?;
            let executor = ExchangeExecutor::new(
                private_key,
                self.ctx.config.environment.base_url().to_string(),
                http.clone(),
                self.ctx.config.environment.is_dry_run(),
                asset_info.clone(),
            );
            executors.insert(account_env_var, executor);
        }
        Ok(executors)
    }

    async fn wait_for_shutdown_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_constructs_from_default_config() {
        let service = Service::new(Config::default());
        assert!(service.ctx.config.environment.is_dry_run());
    }
}
