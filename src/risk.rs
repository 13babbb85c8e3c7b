use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::EngineError;
use crate::position::AccountSnapshot;

/// Side of a Decision's open action; used to pick the SL/TP arithmetic branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub total_exposure_cap_pct: Decimal,
    pub liquidation_warning_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            total_exposure_cap_pct: dec!(80),
            liquidation_warning_pct: dec!(20),
        }
    }
}

/// Pre-trade validation gate (§4.10). Stateless aside from its config; every
/// check takes the agent and account snapshot as of decision time.
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// `validate(agent, coin, size_usd, leverage) -> (ok, reason?)`, four
    /// checks applied in the order the spec lists them so the first failing
    /// check produces the most specific rejection reason.
    pub fn validate(
        &self,
        agent: &Agent,
        size_usd: Decimal,
        leverage: u32,
        account: &AccountSnapshot,
    ) -> Result<(), EngineError> {
        if leverage > agent.max_leverage {
            return Err(EngineError::RiskRejected(format!(
                "leverage {leverage}x exceeds agent max {}x",
                agent.max_leverage
            )));
        }

        let max_position = account.total_value * agent.max_position_size_pct / dec!(100);
        if size_usd > max_position {
            return Err(EngineError::RiskRejected(format!(
                "position ${size_usd} exceeds max ${max_position}"
            )));
        }

        let required_margin = size_usd / Decimal::from(leverage);
        let available_margin = account.cash_balance;
        if required_margin > available_margin {
            return Err(EngineError::RiskRejected(format!(
                "required margin ${required_margin} exceeds available ${available_margin}"
            )));
        }

        let exposure_cap = account.total_value * self.config.total_exposure_cap_pct / dec!(100);
        if account.position_value + size_usd > exposure_cap {
            return Err(EngineError::RiskRejected(format!(
                "total exposure ${} would exceed cap ${exposure_cap}",
                account.position_value + size_usd
            )));
        }

        Ok(())
    }

    /// `long:  sl = entry * (1 - sl_pct/100), tp = entry * (1 + tp_pct/100)`
    /// `short: sl = entry * (1 + sl_pct/100), tp = entry * (1 - tp_pct/100)`
    pub fn stop_loss_take_profit(
        side: Side,
        entry_price: Decimal,
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
    ) -> (Decimal, Decimal) {
        match side {
            Side::Long => (
                entry_price * (dec!(1) - stop_loss_pct / dec!(100)),
                entry_price * (dec!(1) + take_profit_pct / dec!(100)),
            ),
            Side::Short => (
                entry_price * (dec!(1) + stop_loss_pct / dec!(100)),
                entry_price * (dec!(1) - take_profit_pct / dec!(100)),
            ),
        }
    }

    /// Informational monitor: flags positions whose current price sits
    /// within `liquidation_warning_pct` of the liquidation price.
    pub fn liquidation_warnings(&self, positions: &[crate::position::Position]) -> Vec<String> {
        positions
            .iter()
            .filter_map(|p| {
                let liq = p.liquidation_price?;
                if liq == Decimal::ZERO {
                    return None;
                }
                let distance_pct = ((p.current_price - liq) / p.current_price).abs() * dec!(100);
                if distance_pct < self.config.liquidation_warning_pct {
                    Some(format!(
                        "{}: {distance_pct:.1}% from liquidation (AtLiquidationRisk)",
                        p.coin
                    ))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentStatus};

    fn test_agent() -> Agent {
        Agent {
            id: uuid::Uuid::new_v4(),
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
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn account(total_value: Decimal, cash: Decimal, position_value: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            total_value,
            cash_balance: cash,
            position_value,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl_to_date: Decimal::ZERO,
        }
    }

    #[test]
    fn scenario_b_open_long_passes_risk() {
        let risk = RiskManager::new(RiskConfig::default());
        let agent = test_agent();
        let acct = account(dec!(10000), dec!(10000), Decimal::ZERO);
        assert!(risk.validate(&agent, dec!(1500), 5, &acct).is_ok());
    }

    #[test]
    fn scenario_c_rejects_oversized_position() {
        let risk = RiskManager::new(RiskConfig::default());
        let agent = test_agent();
        let acct = account(dec!(10000), dec!(10000), Decimal::ZERO);
        let err = risk.validate(&agent, dec!(3000), 5, &acct).unwrap_err();
        match err {
            EngineError::RiskRejected(msg) => assert!(msg.contains("2000")),
            _ => panic!("expected RiskRejected"),
        }
    }

    #[test]
    fn rejects_leverage_above_agent_max() {
        let risk = RiskManager::new(RiskConfig::default());
        let agent = test_agent();
        let acct = account(dec!(10000), dec!(10000), Decimal::ZERO);
        assert!(risk.validate(&agent, dec!(500), 20, &acct).is_err());
    }

    #[test]
    fn rejects_when_exposure_cap_exceeded() {
        let risk = RiskManager::new(RiskConfig::default());
        let agent = test_agent();
        let acct = account(dec!(10000), dec!(10000), dec!(7000));
        let err = risk.validate(&agent, dec!(1500), 5, &acct).unwrap_err();
        assert!(matches!(err, EngineError::RiskRejected(_)));
    }

    #[test]
    fn long_sl_below_entry_tp_above() {
        let (sl, tp) = RiskManager::stop_loss_take_profit(Side::Long, dec!(50000), dec!(2), dec!(5));
        assert!(sl < dec!(50000));
        assert!(tp > dec!(50000));
        assert!(sl < tp);
    }

    #[test]
    fn short_tp_below_entry_sl_above() {
        let (sl, tp) = RiskManager::stop_loss_take_profit(Side::Short, dec!(50000), dec!(2), dec!(5));
        assert!(sl > dec!(50000));
        assert!(tp < dec!(50000));
        assert!(tp < sl);
    }
}
