use log::warn;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::agent::Agent;
use crate::decision::Decision;
use crate::error::EngineError;
use crate::exchange::ExchangeExecutor;
use crate::order::OrderManager;
use crate::position::{AccountSnapshot, Position, PositionManager};
use crate::risk::{RiskManager, Side};
use crate::store::Store;

/// Applies one validated Decision for one agent (§4.13). Failures are
/// isolated per agent/decision — they never roll back an already-opened
/// position, matching the "no rollback" note on SL/TP placement.
pub struct TradingOrchestrator<'a> {
    executor: &'a ExchangeExecutor,
    store: &'a dyn Store,
    risk: &'a RiskManager,
}

impl<'a> TradingOrchestrator<'a> {
    pub fn new(executor: &'a ExchangeExecutor, store: &'a dyn Store, risk: &'a RiskManager) -> Self {
        Self { executor, store, risk }
    }

    pub async fn apply(
        &self,
        agent: &Agent,
        decision_id: Option<Uuid>,
        decision: &Decision,
        account: &AccountSnapshot,
        positions: &[Position],
        current_price: Decimal,
    ) -> Result<(), EngineError> {
        match decision {
            Decision::Hold { .. } => Ok(()),
            Decision::ClosePosition { coin, .. } => self.close_position(agent, coin, positions).await,
            Decision::OpenLong { coin, size_usd, leverage, stop_loss_price, take_profit_price, .. } => {
                self.open_position(
                    agent,
                    decision_id,
                    Side::Long,
                    coin,
                    *size_usd,
                    *leverage,
                    *stop_loss_price,
                    *take_profit_price,
                    account,
                    current_price,
                )
                .await
            }
            Decision::OpenShort { coin, size_usd, leverage, stop_loss_price, take_profit_price, .. } => {
                self.open_position(
                    agent,
                    decision_id,
                    Side::Short,
                    coin,
                    *size_usd,
                    *leverage,
                    *stop_loss_price,
                    *take_profit_price,
                    account,
                    current_price,
                )
                .await
            }
        }
    }

    async fn close_position(&self, agent: &Agent, coin: &str, positions: &[Position]) -> Result<(), EngineError> {
        let position = positions
            .iter()
            .find(|p| p.coin == coin)
            .ok_or_else(|| EngineError::Validation(format!("no open position in {coin} to close")))?;

        let is_buy = matches!(position.side, crate::position::PositionSide::Short);
        let size_f64 = position.size.to_f64().unwrap_or(0.0);
        let price_f64 = position.current_price.to_f64().unwrap_or(0.0);

        let trade = self.store.open_trade_for_coin(agent.id, coin).await?;
        let order_manager = OrderManager::new(self.executor, self.store);
        let client_order_id = trade.as_ref().map(|t| t.id.to_string());
        let ack = self
            .executor
            .place_order(coin, is_buy, size_f64, price_f64, crate::exchange::OrderKind::Market, true, client_order_id)
            .await?;

        if let Some(trade) = trade {
            let realized_pnl = position.unrealized_pnl;
            order_manager
                .update_trade_status(trade, Some(position.current_price), Some(realized_pnl), None)
                .await?;
        } else {
            warn!("closed {coin} position for agent {} but found no matching open Trade row (ack={})", agent.id, ack.exchange_order_id);
        }
        Ok(())
    }

    async fn open_position(
        &self,
        agent: &Agent,
        decision_id: Option<Uuid>,
        side: Side,
        coin: &str,
        size_usd: Decimal,
        leverage: u32,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        account: &AccountSnapshot,
        current_price: Decimal,
    ) -> Result<(), EngineError> {
        self.risk.validate(agent, size_usd, leverage, account)?;

        self.executor.update_leverage(coin, leverage, true).await?;

        let size_base = PositionManager::position_size_from_usd(size_usd, current_price);
        let size_f64 = size_base.to_f64().unwrap_or(0.0);
        let price_f64 = current_price.to_f64().unwrap_or(0.0);
        let is_buy = matches!(side, Side::Long);

        let order_manager = OrderManager::new(self.executor, self.store);
        order_manager
            .execute_trade(
                agent.id,
                decision_id,
                coin,
                is_buy,
                size_f64,
                price_f64,
                leverage,
                Some(stop_loss_price),
                Some(take_profit_price),
            )
            .await?;

        let sl_f64 = stop_loss_price.to_f64().unwrap_or(0.0);
        let tp_f64 = take_profit_price.to_f64().unwrap_or(0.0);
        let grouping = agent.tpsl_grouping.as_str();

        let (sl_result, tp_result) = tokio::join!(
            self.executor.place_trigger_order(coin, !is_buy, size_f64, sl_f64, "sl", grouping),
            self.executor.place_trigger_order(coin, !is_buy, size_f64, tp_f64, "tp", grouping),
        );

        if let Err(e) = sl_result {
            warn!("stop-loss order failed for {coin} (agent {}): {e}; position remains open", agent.id);
        }
        if let Err(e) = tp_result {
            warn!("take-profit order failed for {coin} (agent {}): {e}; position remains open", agent.id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::risk::RiskConfig;
    use crate::store::JsonFileStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "test".to_string(),
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

    fn account(total_value: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            total_value,
            cash_balance: total_value,
            position_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl_to_date: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn hold_decision_is_a_no_op() {
        let path = std::env::temp_dir().join(format!("hl-agent-engine-trading-test-{}.json", Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        let executor = ExchangeExecutor::new(
            "0x0123456789012345678901234567890123456789012345678901234567890a".to_string(),
            "https://example.invalid".to_string(),
            reqwest::Client::new(),
            true,
            HashMap::new(),
        );
        let risk = RiskManager::new(RiskConfig::default());
        let trading = TradingOrchestrator::new(&executor, &store, &risk);

        let decision = Decision::Hold { reasoning: "chop".to_string(), confidence: dec!(0.5) };
        let result = trading.apply(&agent(), None, &decision, &account(dec!(10000)), &[], dec!(50000)).await;
        assert!(result.is_ok());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn close_position_without_open_position_is_rejected() {
        let path = std::env::temp_dir().join(format!("hl-agent-engine-trading-test-{}.json", Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        let executor = ExchangeExecutor::new(
            "0x0123456789012345678901234567890123456789012345678901234567890a".to_string(),
            "https://example.invalid".to_string(),
            reqwest::Client::new(),
            true,
            HashMap::new(),
        );
        let risk = RiskManager::new(RiskConfig::default());
        let trading = TradingOrchestrator::new(&executor, &store, &risk);

        let decision = Decision::ClosePosition { coin: "BTC".to_string(), confidence: dec!(0.5), reasoning: "x".to_string() };
        let result = trading.apply(&agent(), None, &decision, &account(dec!(10000)), &[], dec!(50000)).await;
        assert!(result.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
