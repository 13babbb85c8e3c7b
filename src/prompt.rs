use rust_decimal::Decimal;

use crate::agent::Agent;
use crate::market_data::{CoinSnapshot, MarketSnapshot};
use crate::position::{AccountSnapshot, Position};

/// Deterministically assembles the per-agent prompt text (§4.5). No risk
/// limits are injected here — those are enforced by RiskManager, never by
/// asking the model to police itself.
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(
        agent: &Agent,
        snapshot: &MarketSnapshot,
        account: &AccountSnapshot,
        positions: &[Position],
        minutes_since_start: i64,
        invocation_count: u64,
    ) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "# Market Cycle — {}\nMinutes since first invocation: {minutes_since_start}\nInvocation count: {invocation_count}\nAll time series below are ordered oldest -> newest.\n\n",
            snapshot.produced_at.to_rfc3339()
        ));

        let mut coins: Vec<&CoinSnapshot> = snapshot.coins.values().collect();
        coins.sort_by(|a, b| a.coin.cmp(&b.coin));
        for coin in coins {
            out.push_str(&Self::coin_section(coin));
        }

        out.push_str(&Self::account_section(agent, account, positions));

        if !agent.strategy_description.is_empty() {
            out.push_str("\n## Your Trading Strategy\n");
            out.push_str(&agent.strategy_description);
            out.push('\n');
        }

        out.push_str(&Self::task_section());
        out
    }

    fn coin_section(coin: &CoinSnapshot) -> String {
        let mut section = format!(
            "## {}\nCurrent price: {}\nOpen interest: latest={} average={}\nFunding rate: {}\n",
            coin.coin, coin.current_price, coin.open_interest_latest, coin.open_interest_average, coin.funding_rate
        );

        let mut timeframes: Vec<&String> = coin.timeframes.keys().collect();
        timeframes.sort();
        for tf in timeframes {
            let ind = &coin.timeframes[tf];
            section.push_str(&format!(
                "### {tf}\nclose={:?}\nema20={:?}\nema50={:?}\nmacd={:?}\nrsi7={:?}\nrsi14={:?}\natr3={:?}\natr14={:?}\nvolume: current={} average={}\n",
                ind.closes, ind.ema20, ind.ema50, ind.macd, ind.rsi7, ind.rsi14, ind.atr3, ind.atr14, ind.current_volume, ind.average_volume
            ));
        }
        section.push('\n');
        section
    }

    fn account_section(agent: &Agent, account: &AccountSnapshot, positions: &[Position]) -> String {
        let total_return_pct = if agent.initial_balance != Decimal::ZERO {
            (account.total_value - agent.initial_balance) / agent.initial_balance * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        let mut section = format!(
            "## Account\nTotal return: {total_return_pct}%\nAvailable cash: {}\nTotal value: {}\n",
            account.cash_balance, account.total_value
        );

        if positions.is_empty() {
            section.push_str("Open positions: none\n");
        } else {
            section.push_str("Open positions:\n");
            for p in positions {
                section.push_str(&format!(
                    "  - symbol={} side={:?} qty={} entry={} current={} liquidation={:?} unrealized_pnl={} leverage={}x\n",
                    p.coin, p.side, p.size, p.entry_price, p.current_price, p.liquidation_price, p.unrealized_pnl, p.leverage
                ));
                match &p.exit_plan {
                    Some(plan) => section.push_str(&format!(
                        "    exit_plan: profit_target={} stop_loss={} invalidation_condition={}\n",
                        plan.profit_target, plan.stop_loss, plan.invalidation_condition
                    )),
                    None => section.push_str("    exit_plan: none\n"),
                }
            }
        }
        section.push('\n');
        section
    }

    fn task_section() -> String {
        "## Task\nWrite a short natural-language rationale, then emit exactly one JSON object with fields {action, coin, size_usd, leverage, stop_loss_price, take_profit_price, confidence, reasoning}. action must be one of HOLD, OPEN_LONG, OPEN_SHORT, CLOSE_POSITION.\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            llm_model_id: "m".to_string(),
            exchange_account: "a".to_string(),
            initial_balance: dec!(10000),
            max_position_size_pct: dec!(20),
            max_leverage: 10,
            stop_loss_pct: dec!(2),
            take_profit_pct: dec!(5),
            strategy_description: "Buy breakouts on volume confirmation.".to_string(),
            status: AgentStatus::Active,
            tpsl_grouping: "positionTpsl".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            total_value: dec!(10500),
            cash_balance: dec!(10000),
            position_value: dec!(500),
            unrealized_pnl: dec!(500),
            realized_pnl_to_date: Decimal::ZERO,
        }
    }

    #[test]
    fn includes_strategy_block_when_present() {
        let snapshot = MarketSnapshot { produced_at: Utc::now(), coins: HashMap::new() };
        let prompt = PromptBuilder::build(&agent(), &snapshot, &account(), &[], 10, 3);
        assert!(prompt.contains("Your Trading Strategy"));
        assert!(prompt.contains("breakouts"));
    }

    #[test]
    fn omits_strategy_block_when_empty() {
        let mut a = agent();
        a.strategy_description.clear();
        let snapshot = MarketSnapshot { produced_at: Utc::now(), coins: HashMap::new() };
        let prompt = PromptBuilder::build(&a, &snapshot, &account(), &[], 10, 3);
        assert!(!prompt.contains("Your Trading Strategy"));
    }

    #[test]
    fn open_position_line_includes_exit_plan() {
        use crate::position::{ExitPlan, Position, PositionSide};

        let position = Position {
            coin: "BTC".to_string(),
            side: PositionSide::Long,
            size: dec!(0.1),
            entry_price: dec!(50000),
            current_price: dec!(50500),
            unrealized_pnl: dec!(50),
            leverage: 5,
            liquidation_price: None,
            exit_plan: Some(ExitPlan {
                profit_target: dec!(52500),
                stop_loss: dec!(49000),
                invalidation_condition: "risk gate stop/target".to_string(),
            }),
        };

        let snapshot = MarketSnapshot { produced_at: Utc::now(), coins: HashMap::new() };
        let prompt = PromptBuilder::build(&agent(), &snapshot, &account(), &[position], 10, 3);
        assert!(prompt.contains("exit_plan:"));
        assert!(prompt.contains("52500"));
        assert!(prompt.contains("49000"));
    }

    #[test]
    fn task_section_names_all_four_actions() {
        let snapshot = MarketSnapshot { produced_at: Utc::now(), coins: HashMap::new() };
        let prompt = PromptBuilder::build(&agent(), &snapshot, &account(), &[], 0, 1);
        for action in ["HOLD", "OPEN_LONG", "OPEN_SHORT", "CLOSE_POSITION"] {
            assert!(prompt.contains(action));
        }
    }
}
