use std::collections::HashMap;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPlan {
    pub profit_target: Decimal,
    pub stop_loss: Decimal,
    pub invalidation_condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Option<Decimal>,
    pub exit_plan: Option<ExitPlan>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_value: Decimal,
    pub cash_balance: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl_to_date: Decimal,
}

/// Reconstructs positions from open Trade rows and live prices (§4.11).
/// Never a source of truth for fills — the exchange is authoritative;
/// reconciliation here is read-time only, per §9's anti-transactionality note.
pub struct PositionManager<'a> {
    store: &'a dyn Store,
}

impl<'a> PositionManager<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub async fn positions_for_agent(
        &self,
        agent_id: Uuid,
        live_prices: &HashMap<String, f64>,
    ) -> Result<Vec<Position>, EngineError> {
        let trades = self.store.open_trades_for_agent(agent_id).await?;
        let mut positions = Vec::with_capacity(trades.len());

        for t in trades {
            let current_price = live_prices
                .get(&t.coin)
                .and_then(|p| Decimal::from_f64(*p))
                .unwrap_or(t.entry_price.unwrap_or_default());

            let entry_price = t.entry_price.unwrap_or_default();
            let side = match t.side.as_str() {
                "short" => PositionSide::Short,
                _ => PositionSide::Long,
            };
            let unrealized_pnl = match side {
                PositionSide::Long => (current_price - entry_price) * t.size,
                PositionSide::Short => (entry_price - current_price) * t.size,
            };

            positions.push(Position {
                coin: t.coin,
                side,
                size: t.size,
                entry_price,
                current_price,
                unrealized_pnl,
                leverage: t.leverage,
                liquidation_price: t.liquidation_price,
                exit_plan: t.stop_loss_price.zip(t.take_profit_price).map(|(sl, tp)| ExitPlan {
                    profit_target: tp,
                    stop_loss: sl,
                    invalidation_condition: "risk gate stop/target".to_string(),
                }),
            });
        }

        Ok(positions)
    }

    pub async fn account_snapshot(
        &self,
        agent_id: Uuid,
        initial_balance: Decimal,
        live_prices: &HashMap<String, f64>,
    ) -> Result<AccountSnapshot, EngineError> {
        let positions = self.positions_for_agent(agent_id, live_prices).await?;
        let realized = self.store.realized_pnl_for_agent(agent_id).await?;

        let position_value: Decimal = positions.iter().map(|p| p.size * p.current_price).sum();
        let unrealized_pnl: Decimal = positions.iter().map(|p| p.unrealized_pnl).sum();
        let cash_balance = initial_balance + realized;
        let total_value = cash_balance + unrealized_pnl;

        Ok(AccountSnapshot {
            total_value,
            cash_balance,
            position_value,
            unrealized_pnl,
            realized_pnl_to_date: realized,
        })
    }

    pub fn position_size_from_usd(target_usd: Decimal, current_price: Decimal) -> Decimal {
        if current_price.is_zero() {
            return Decimal::ZERO;
        }
        target_usd / current_price
    }

    /// Read-time reconciliation: warns (does not mutate) when a local open
    /// Trade's exchange order id is absent from the exchange's live order
    /// book on restart. Out-of-scope partial-fill handling per §9.
    pub fn reconcile_warning(trade_exchange_order_id: &str, live_order_ids: &[String]) -> Option<String> {
        if live_order_ids.iter().any(|id| id == trade_exchange_order_id) {
            None
        } else {
            Some(format!(
                "trade references exchange_order_id={trade_exchange_order_id} which is no longer live; recording discrepancy only"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_size_from_usd_divides_by_price() {
        let size = PositionManager::position_size_from_usd(dec!(1500), dec!(50000));
        assert_eq!(size, dec!(0.03));
    }

    #[test]
    fn position_size_from_usd_guards_zero_price() {
        let size = PositionManager::position_size_from_usd(dec!(1500), Decimal::ZERO);
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn reconcile_warning_flags_missing_order() {
        let warning = PositionManager::reconcile_warning("123", &["456".to_string()]);
        assert!(warning.is_some());
        let none = PositionManager::reconcile_warning("123", &["123".to_string()]);
        assert!(none.is_none());
    }
}
