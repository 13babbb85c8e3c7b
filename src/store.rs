use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::Agent;
use crate::decision::Decision;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Success,
    Failed,
    ParsingError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: DecisionStatus,
    pub decision: Option<Decision>,
    pub llm_prompt: Option<String>,
    pub llm_response: Option<String>,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
    Liquidated,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub decision_id: Option<Uuid>,
    pub coin: String,
    pub side: String,
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub status: TradeStatus,
    pub exchange_order_id: String,
    pub leverage: u32,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    pub service_start_time: Option<DateTime<Utc>>,
    pub cycle_count: u64,
    pub last_cycle_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Persistence boundary: exclusively owns Agent/Decision/Trade/BotState
/// records (§3's ownership note). A SQL-backed implementation is a drop-in
/// replacement behind this trait; nothing upstream depends on JSON files.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<Agent>, EngineError>;
    async fn upsert_agent(&self, agent: Agent) -> Result<(), EngineError>;

    async fn record_decision(&self, record: DecisionRecord) -> Result<(), EngineError>;
    async fn decisions_for_agent(&self, agent_id: Uuid, limit: usize) -> Result<Vec<DecisionRecord>, EngineError>;

    async fn insert_trade(&self, trade: Trade) -> Result<(), EngineError>;
    async fn update_trade(&self, trade: Trade) -> Result<(), EngineError>;
    async fn open_trades_for_agent(&self, agent_id: Uuid) -> Result<Vec<Trade>, EngineError>;
    async fn open_trade_for_coin(&self, agent_id: Uuid, coin: &str) -> Result<Option<Trade>, EngineError>;
    async fn realized_pnl_for_agent(&self, agent_id: Uuid) -> Result<Decimal, EngineError>;

    async fn load_bot_state(&self) -> Result<BotState, EngineError>;
    async fn save_bot_state(&self, state: BotState) -> Result<(), EngineError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonFile {
    agents: HashMap<Uuid, Agent>,
    decisions: Vec<DecisionRecord>,
    trades: HashMap<Uuid, Trade>,
    bot_state: BotState,
}

/// Embedded JSON-file Store, the generalized multi-table form of the
/// teacher's single-struct `EngineState` file (`persistence.rs`). Guarded by
/// a mutex: at most one cycle writes at a time, matching the scheduler's
/// max_instances=1 rule.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<JsonFile>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), data: Mutex::new(JsonFile::default()) }
    }

    /// Loads from disk if present; otherwise starts from an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = if path.exists() {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<JsonFile>(&content) {
                    Ok(parsed) => {
                        info!("loaded store from {path:?}: {} agents, {} trades", parsed.agents.len(), parsed.trades.len());
                        parsed
                    }
                    Err(e) => {
                        error!("failed to parse store file {path:?}: {e}");
                        JsonFile::default()
                    }
                },
                Err(e) => {
                    error!("failed to read store file {path:?}: {e}");
                    JsonFile::default()
                }
            }
        } else {
            info!("store file {path:?} not found, starting fresh");
            JsonFile::default()
        };

        Self { path, data: Mutex::new(data) }
    }

    async fn flush(&self, data: &JsonFile) -> Result<(), EngineError> {
        if let Some(parent) = Path::new(&self.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::StateIo(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(data).map_err(|e| EngineError::StateIo(e.to_string()))?;
        tokio::fs::write(&self.path, content).await.map_err(|e| EngineError::StateIo(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn list_agents(&self) -> Result<Vec<Agent>, EngineError> {
        let data = self.data.lock().await;
        Ok(data.agents.values().cloned().collect())
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), EngineError> {
        let mut data = self.data.lock().await;
        data.agents.insert(agent.id, agent);
        self.flush(&data).await
    }

    async fn record_decision(&self, record: DecisionRecord) -> Result<(), EngineError> {
        let mut data = self.data.lock().await;
        data.decisions.push(record);
        self.flush(&data).await
    }

    async fn decisions_for_agent(&self, agent_id: Uuid, limit: usize) -> Result<Vec<DecisionRecord>, EngineError> {
        let data = self.data.lock().await;
        let mut matching: Vec<DecisionRecord> =
            data.decisions.iter().filter(|d| d.agent_id == agent_id).cloned().collect();
        matching.sort_by_key(|d| d.timestamp);
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }

    async fn insert_trade(&self, trade: Trade) -> Result<(), EngineError> {
        let mut data = self.data.lock().await;
        data.trades.insert(trade.id, trade);
        self.flush(&data).await
    }

    async fn update_trade(&self, trade: Trade) -> Result<(), EngineError> {
        let mut data = self.data.lock().await;
        data.trades.insert(trade.id, trade);
        self.flush(&data).await
    }

    async fn open_trades_for_agent(&self, agent_id: Uuid) -> Result<Vec<Trade>, EngineError> {
        let data = self.data.lock().await;
        Ok(data
            .trades
            .values()
            .filter(|t| t.agent_id == agent_id && t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    async fn open_trade_for_coin(&self, agent_id: Uuid, coin: &str) -> Result<Option<Trade>, EngineError> {
        let data = self.data.lock().await;
        Ok(data
            .trades
            .values()
            .find(|t| t.agent_id == agent_id && t.coin == coin && t.status == TradeStatus::Open)
            .cloned())
    }

    async fn realized_pnl_for_agent(&self, agent_id: Uuid) -> Result<Decimal, EngineError> {
        let data = self.data.lock().await;
        Ok(data
            .trades
            .values()
            .filter(|t| t.agent_id == agent_id)
            .map(|t| t.realized_pnl - t.fees)
            .sum())
    }

    async fn load_bot_state(&self) -> Result<BotState, EngineError> {
        let data = self.data.lock().await;
        Ok(data.bot_state.clone())
    }

    async fn save_bot_state(&self, state: BotState) -> Result<(), EngineError> {
        let mut data = self.data.lock().await;
        data.bot_state = state;
        self.flush(&data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use rust_decimal_macros::dec;

    fn test_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "a".to_string(),
            llm_model_id: "m".to_string(),
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

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hl-agent-engine-test-{name}-{}.json", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn round_trips_agent_through_disk() {
        let path = scratch_path("agent");
        let store = JsonFileStore::new(&path);
        let agent = test_agent();
        store.upsert_agent(agent.clone()).await.unwrap();

        let reloaded = JsonFileStore::load(&path).await;
        let agents = reloaded.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, agent.id);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn bot_state_round_trips_cycle_count() {
        let path = scratch_path("botstate");
        let store = JsonFileStore::new(&path);
        store
            .save_bot_state(BotState {
                service_start_time: Some(Utc::now()),
                cycle_count: 5,
                last_cycle_time: Some(Utc::now()),
                last_error: None,
            })
            .await
            .unwrap();

        let reloaded = JsonFileStore::load(&path).await;
        let state = reloaded.load_bot_state().await.unwrap();
        assert_eq!(state.cycle_count, 5);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn open_trades_filters_by_status_and_agent() {
        let path = scratch_path("trades");
        let store = JsonFileStore::new(&path);
        let agent_id = Uuid::new_v4();

        let open_trade = Trade {
            id: Uuid::new_v4(),
            agent_id,
            decision_id: None,
            coin: "BTC".to_string(),
            side: "long".to_string(),
            size: dec!(0.1),
            entry_price: Some(dec!(50000)),
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: TradeStatus::Open,
            exchange_order_id: "1".to_string(),
            leverage: 5,
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: Some(dec!(52500)),
            liquidation_price: None,
            notes: None,
        };
        let mut closed_trade = open_trade.clone();
        closed_trade.id = Uuid::new_v4();
        closed_trade.status = TradeStatus::Closed;

        store.insert_trade(open_trade.clone()).await.unwrap();
        store.insert_trade(closed_trade).await.unwrap();

        let open = store.open_trades_for_agent(agent_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, open_trade.id);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
