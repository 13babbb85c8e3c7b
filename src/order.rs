use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::EngineError;
use crate::exchange::{ExchangeExecutor, OrderKind};
use crate::store::{Store, Trade, TradeStatus};

/// Bridges a validated Decision to an exchange order and the persisted Trade
/// row (§4.12). Never writes a Trade row on a failed placement.
pub struct OrderManager<'a> {
    executor: &'a ExchangeExecutor,
    store: &'a dyn Store,
}

impl<'a> OrderManager<'a> {
    pub fn new(executor: &'a ExchangeExecutor, store: &'a dyn Store) -> Self {
        Self { executor, store }
    }

    pub async fn execute_trade(
        &self,
        agent_id: Uuid,
        decision_id: Option<Uuid>,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        leverage: u32,
        stop_loss_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
    ) -> Result<Trade, EngineError> {
        let trade_id = Uuid::new_v4();
        let ack = self
            .executor
            .place_order(coin, is_buy, size, price, OrderKind::Market, false, Some(trade_id.to_string()))
            .await?;

        let trade = Trade {
            id: trade_id,
            agent_id,
            decision_id,
            coin: coin.to_string(),
            side: if is_buy { "long".to_string() } else { "short".to_string() },
            size: Decimal::try_from(size).unwrap_or_default(),
            entry_price: Decimal::try_from(price).ok(),
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: TradeStatus::Open,
            exchange_order_id: ack.exchange_order_id,
            leverage,
            stop_loss_price,
            take_profit_price,
            liquidation_price: None,
            notes: None,
        };

        self.store.insert_trade(trade.clone()).await?;
        Ok(trade)
    }

    pub async fn cancel_trade(&self, mut trade: Trade) -> Result<(), EngineError> {
        if trade.status != TradeStatus::Open {
            return Err(EngineError::Validation(format!("cannot cancel trade {} in status {:?}", trade.id, trade.status)));
        }
        self.executor.cancel_order(&trade.coin, &trade.exchange_order_id).await?;
        trade.status = TradeStatus::Cancelled;
        self.store.update_trade(trade).await
    }

    /// Idempotent on repeated equal updates: re-applying the same
    /// exit_price/realized_pnl/fees is a no-op beyond the store write.
    pub async fn update_trade_status(
        &self,
        mut trade: Trade,
        exit_price: Option<Decimal>,
        realized_pnl: Option<Decimal>,
        fees: Option<Decimal>,
    ) -> Result<Trade, EngineError> {
        if let Some(p) = exit_price {
            trade.exit_price = Some(p);
            if trade.exit_time.is_none() {
                trade.exit_time = Some(Utc::now());
            }
            trade.status = TradeStatus::Closed;
        }
        if let Some(pnl) = realized_pnl {
            trade.realized_pnl = pnl;
        }
        if let Some(f) = fees {
            trade.fees = f;
        }
        self.store.update_trade(trade.clone()).await?;
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_trade() -> Trade {
        Trade {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
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
        }
    }

    #[test]
    fn closed_trade_carries_exit_fields() {
        let mut trade = open_trade();
        trade.exit_price = Some(dec!(51000));
        trade.status = TradeStatus::Closed;
        assert_eq!(trade.exit_price, Some(dec!(51000)));
    }

    #[tokio::test]
    async fn update_trade_status_is_idempotent_on_repeated_equal_updates() {
        use crate::store::JsonFileStore;
        use std::collections::HashMap;

        let path = std::env::temp_dir().join(format!("hl-agent-engine-order-test-{}.json", Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        let executor = ExchangeExecutor::new(
            "0x0123456789012345678901234567890123456789012345678901234567890a".to_string(),
            "https://example.invalid".to_string(),
            reqwest::Client::new(),
            true,
            HashMap::new(),
        );
        let manager = OrderManager::new(&executor, &store);

        let trade = open_trade();
        let first = manager
            .update_trade_status(trade, Some(dec!(51000)), Some(dec!(100)), Some(dec!(5)))
            .await
            .unwrap();
        let second = manager
            .update_trade_status(first.clone(), Some(dec!(51000)), Some(dec!(100)), Some(dec!(5)))
            .await
            .unwrap();

        assert_eq!(first.exit_time, second.exit_time);
        assert_eq!(first.exit_price, second.exit_price);
        assert_eq!(first.status, second.status);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn cancel_trade_rejects_already_closed_trade() {
        use crate::store::JsonFileStore;
        use std::collections::HashMap;

        let path = std::env::temp_dir().join(format!("hl-agent-engine-order-test-{}.json", Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        let executor = ExchangeExecutor::new(
            "0x0123456789012345678901234567890123456789012345678901234567890a".to_string(),
            "https://example.invalid".to_string(),
            reqwest::Client::new(),
            true,
            HashMap::new(),
        );
        let manager = OrderManager::new(&executor, &store);

        let mut trade = open_trade();
        trade.status = TradeStatus::Closed;
        let err = manager.cancel_trade(trade).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
