use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    OpenLong,
    OpenShort,
    ClosePosition,
    Hold,
}

/// A validated trading decision. `Decision` is intentionally a tagged union
/// rather than one struct with nullable fields — a HOLD carries no coin or
/// size, matching the re-architecture guidance on the decision contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Decision {
    Hold {
        reasoning: String,
        confidence: Decimal,
    },
    OpenLong {
        coin: String,
        size_usd: Decimal,
        leverage: u32,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        confidence: Decimal,
        reasoning: String,
    },
    OpenShort {
        coin: String,
        size_usd: Decimal,
        leverage: u32,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        confidence: Decimal,
        reasoning: String,
    },
    ClosePosition {
        coin: String,
        confidence: Decimal,
        reasoning: String,
    },
}

impl Decision {
    pub fn coin(&self) -> Option<&str> {
        match self {
            Decision::Hold { .. } => None,
            Decision::OpenLong { coin, .. }
            | Decision::OpenShort { coin, .. }
            | Decision::ClosePosition { coin, .. } => Some(coin),
        }
    }
}

/// Raw decoded shape of the model's flat JSON object, before it is lifted
/// into the tagged `Decision` enum and business-rule validated.
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    coin: Option<String>,
    size_usd: Option<Decimal>,
    leverage: Option<u32>,
    stop_loss_price: Option<Decimal>,
    take_profit_price: Option<Decimal>,
    confidence: Decimal,
    reasoning: String,
}

/// Fields the model must emit as JSON numbers, never as quoted strings
/// (§4.7 step 2). `rust_decimal`'s deserializer otherwise happily accepts
/// `"1500"` for a `Decimal` field, silently tolerating an LLM that hedges
/// its numeric formatting.
const NUMERIC_FIELDS: [&str; 5] = ["size_usd", "leverage", "stop_loss_price", "take_profit_price", "confidence"];

pub struct DecisionParser;

impl DecisionParser {
    fn reject_stringly_typed_numbers(value: &serde_json::Value) -> Result<(), EngineError> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::Parse("decision JSON must be an object".to_string()))?;
        for field in NUMERIC_FIELDS {
            if obj.get(field).is_some_and(|v| v.is_string()) {
                return Err(EngineError::Parse(format!("{field} must be a JSON number, not a string")));
            }
        }
        Ok(())
    }

    /// Extracts the first syntactically valid JSON object from a ```json
    /// fenced block, a generic fenced block, or the raw text (§4.7 step 1).
    fn extract_single_json(text: &str) -> Option<&str> {
        if let Some(start) = text.find("```json") {
            let rest = &text[start + 7..];
            if let Some(end) = rest.find("```") {
                return Some(rest[..end].trim());
            }
        }
        if let Some(start) = text.find("```") {
            let rest = &text[start + 3..];
            if let Some(end) = rest.find("```") {
                let candidate = rest[..end].trim();
                if candidate.starts_with('{') {
                    return Some(candidate);
                }
            }
        }
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end > start {
            Some(text[start..=end].trim())
        } else {
            None
        }
    }

    /// Extracts the JSON object following a `TRADING_DECISIONS` marker, for
    /// the richer `CHAIN_OF_THOUGHT` + `TRADING_DECISIONS` dual-format output.
    fn extract_dual_format_json(text: &str) -> Option<&str> {
        let marker_pos = text.find("TRADING_DECISIONS")?;
        Self::extract_single_json(&text[marker_pos..])
    }

    /// Picks the extraction strategy based on which section markers are
    /// present, and rejects output carrying only one half of the dual-format
    /// marker pair as ambiguous (§9 open question: prompt format variant).
    fn extract_json(text: &str) -> Result<&str, EngineError> {
        let has_cot = text.contains("CHAIN_OF_THOUGHT");
        let has_td = text.contains("TRADING_DECISIONS");

        match (has_cot, has_td) {
            (true, true) => Self::extract_dual_format_json(text)
                .ok_or_else(|| EngineError::Parse("no JSON object found after TRADING_DECISIONS marker".to_string())),
            (true, false) | (false, true) => Err(EngineError::Parse(
                "dual-format output missing its matching CHAIN_OF_THOUGHT/TRADING_DECISIONS marker".to_string(),
            )),
            (false, false) => Self::extract_single_json(text)
                .ok_or_else(|| EngineError::Parse("no JSON object found in LLM output".to_string())),
        }
    }

    /// Parses and schema-validates. Business-logic validation (open-position
    /// checks, risk bounds, SL/TP side) is layered on in `validate_against_context`.
    pub fn parse(text: &str, allowed_coins: &[String]) -> Result<Decision, EngineError> {
        let json_str = Self::extract_json(text)?;

        let value: serde_json::Value =
            serde_json::from_str(json_str).map_err(|e| EngineError::Parse(format!("invalid decision JSON: {e}")))?;
        Self::reject_stringly_typed_numbers(&value)?;

        let raw: RawDecision =
            serde_json::from_value(value).map_err(|e| EngineError::Parse(format!("invalid decision JSON: {e}")))?;

        if !(Decimal::ZERO..=Decimal::ONE).contains(&raw.confidence) {
            return Err(EngineError::Parse(format!("confidence {} out of [0,1]", raw.confidence)));
        }

        match raw.action.as_str() {
            "HOLD" => Ok(Decision::Hold { reasoning: raw.reasoning, confidence: raw.confidence }),
            "CLOSE_POSITION" => {
                let coin = raw.coin.ok_or_else(|| EngineError::Parse("CLOSE_POSITION missing coin".to_string()))?;
                Self::require_whitelisted(&coin, allowed_coins)?;
                Ok(Decision::ClosePosition { coin, confidence: raw.confidence, reasoning: raw.reasoning })
            }
            action @ ("OPEN_LONG" | "OPEN_SHORT") => {
                let coin = raw.coin.ok_or_else(|| EngineError::Parse(format!("{action} missing coin")))?;
                Self::require_whitelisted(&coin, allowed_coins)?;
                let size_usd = raw.size_usd.ok_or_else(|| EngineError::Parse(format!("{action} missing size_usd")))?;
                let leverage = raw.leverage.ok_or_else(|| EngineError::Parse(format!("{action} missing leverage")))?;
                let sl = raw
                    .stop_loss_price
                    .ok_or_else(|| EngineError::Parse(format!("{action} missing stop_loss_price")))?;
                let tp = raw
                    .take_profit_price
                    .ok_or_else(|| EngineError::Parse(format!("{action} missing take_profit_price")))?;

                if size_usd < Decimal::ZERO {
                    return Err(EngineError::Parse("size_usd must be non-negative".to_string()));
                }
                if !(1..=50).contains(&leverage) {
                    return Err(EngineError::Parse(format!("leverage {leverage} out of [1,50]")));
                }

                if action == "OPEN_LONG" {
                    Ok(Decision::OpenLong {
                        coin,
                        size_usd,
                        leverage,
                        stop_loss_price: sl,
                        take_profit_price: tp,
                        confidence: raw.confidence,
                        reasoning: raw.reasoning,
                    })
                } else {
                    Ok(Decision::OpenShort {
                        coin,
                        size_usd,
                        leverage,
                        stop_loss_price: sl,
                        take_profit_price: tp,
                        confidence: raw.confidence,
                        reasoning: raw.reasoning,
                    })
                }
            }
            other => Err(EngineError::Parse(format!("unknown action: {other}"))),
        }
    }

    fn require_whitelisted(coin: &str, allowed_coins: &[String]) -> Result<(), EngineError> {
        if allowed_coins.iter().any(|c| c == coin) {
            Ok(())
        } else {
            Err(EngineError::Parse(format!("coin {coin} not in whitelist")))
        }
    }

    /// Business-logic validation given the agent's live position set and the
    /// current reference price for the decision's coin (§4.7 step 3).
    pub fn validate_against_context(
        decision: &Decision,
        open_positions: &[Position],
        current_price: Decimal,
    ) -> Result<(), EngineError> {
        match decision {
            Decision::Hold { .. } => Ok(()),
            Decision::ClosePosition { coin, .. } => {
                if open_positions.iter().any(|p| &p.coin == coin) {
                    Ok(())
                } else {
                    Err(EngineError::Validation(format!("CLOSE_POSITION requested for {coin} with no open position")))
                }
            }
            Decision::OpenLong { coin, stop_loss_price, take_profit_price, .. } => {
                if open_positions.iter().any(|p| &p.coin == coin) {
                    return Err(EngineError::Validation(format!("OPEN_LONG requested for {coin} with an existing position")));
                }
                if !(*stop_loss_price < current_price && current_price < *take_profit_price) {
                    return Err(EngineError::Validation(
                        "OPEN_LONG requires stop_loss_price < current_price < take_profit_price".to_string(),
                    ));
                }
                Ok(())
            }
            Decision::OpenShort { coin, stop_loss_price, take_profit_price, .. } => {
                if open_positions.iter().any(|p| &p.coin == coin) {
                    return Err(EngineError::Validation(format!("OPEN_SHORT requested for {coin} with an existing position")));
                }
                if !(*take_profit_price < current_price && current_price < *stop_loss_price) {
                    return Err(EngineError::Validation(
                        "OPEN_SHORT requires take_profit_price < current_price < stop_loss_price".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coins() -> Vec<String> {
        vec!["BTC".to_string(), "ETH".to_string()]
    }

    #[test]
    fn parses_hold_from_fenced_json() {
        let text = "Market is choppy, I'll wait.\n```json\n{\"action\":\"HOLD\",\"confidence\":0.6,\"reasoning\":\"chop\"}\n```";
        let decision = DecisionParser::parse(text, &coins()).unwrap();
        assert!(matches!(decision, Decision::Hold { .. }));
    }

    #[test]
    fn parses_open_long_from_raw_text() {
        let text = r#"{"action":"OPEN_LONG","coin":"BTC","size_usd":1500,"leverage":5,"stop_loss_price":49000,"take_profit_price":52000,"confidence":0.8,"reasoning":"breakout"}"#;
        let decision = DecisionParser::parse(text, &coins()).unwrap();
        match decision {
            Decision::OpenLong { coin, size_usd, leverage, .. } => {
                assert_eq!(coin, "BTC");
                assert_eq!(size_usd, dec!(1500));
                assert_eq!(leverage, 5);
            }
            _ => panic!("expected OpenLong"),
        }
    }

    #[test]
    fn rejects_coin_outside_whitelist() {
        let text = r#"{"action":"OPEN_LONG","coin":"DOGE","size_usd":100,"leverage":2,"stop_loss_price":1,"take_profit_price":2,"confidence":0.5,"reasoning":"x"}"#;
        assert!(DecisionParser::parse(text, &coins()).is_err());
    }

    #[test]
    fn rejects_leverage_out_of_bounds() {
        let text = r#"{"action":"OPEN_LONG","coin":"BTC","size_usd":100,"leverage":80,"stop_loss_price":1,"take_profit_price":2,"confidence":0.5,"reasoning":"x"}"#;
        assert!(DecisionParser::parse(text, &coins()).is_err());
    }

    #[test]
    fn rejects_size_usd_given_as_a_json_string() {
        let text = r#"{"action":"OPEN_LONG","coin":"BTC","size_usd":"1500","leverage":5,"stop_loss_price":49000,"take_profit_price":52000,"confidence":0.8,"reasoning":"breakout"}"#;
        let err = DecisionParser::parse(text, &coins()).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn rejects_confidence_given_as_a_json_string() {
        let text = r#"{"action":"HOLD","confidence":"0.6","reasoning":"chop"}"#;
        let err = DecisionParser::parse(text, &coins()).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn rejects_no_json_present() {
        assert!(DecisionParser::parse("I don't know what to do", &coins()).is_err());
    }

    #[test]
    fn parses_dual_format_from_trading_decisions_block() {
        let text = concat!(
            "CHAIN_OF_THOUGHT: funding is rich, momentum is fading, I'll sit this one out.\n",
            "TRADING_DECISIONS:\n",
            r#"{"action":"HOLD","confidence":0.4,"reasoning":"fading momentum"}"#,
        );
        let decision = DecisionParser::parse(text, &coins()).unwrap();
        assert!(matches!(decision, Decision::Hold { .. }));
    }

    #[test]
    fn rejects_dual_format_output_missing_matching_marker() {
        let text = concat!(
            "CHAIN_OF_THOUGHT: thinking out loud with no decisions block.\n",
            r#"{"action":"HOLD","confidence":0.4,"reasoning":"x"}"#,
        );
        assert!(DecisionParser::parse(text, &coins()).is_err());
    }

    #[test]
    fn validate_rejects_open_long_with_existing_position() {
        let decision = Decision::OpenLong {
            coin: "BTC".to_string(),
            size_usd: dec!(100),
            leverage: 2,
            stop_loss_price: dec!(49000),
            take_profit_price: dec!(52000),
            confidence: dec!(0.5),
            reasoning: "x".to_string(),
        };
        let positions = vec![Position {
            coin: "BTC".to_string(),
            side: crate::position::PositionSide::Long,
            size: dec!(0.1),
            entry_price: dec!(50000),
            current_price: dec!(50500),
            unrealized_pnl: dec!(50),
            leverage: 5,
            liquidation_price: None,
            exit_plan: None,
        }];
        let err = DecisionParser::validate_against_context(&decision, &positions, dec!(50500)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn validate_rejects_close_position_without_open_position() {
        let decision = Decision::ClosePosition { coin: "ETH".to_string(), confidence: dec!(0.5), reasoning: "x".to_string() };
        let err = DecisionParser::validate_against_context(&decision, &[], dec!(3000)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
