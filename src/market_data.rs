use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;

use crate::config::TradingConfig;
use crate::error::EngineError;
use crate::exchange::ExchangeClient;
use crate::indicators::IndicatorEngine;

const TAIL_LEN: usize = 15;

fn tail(series: &[f64]) -> Vec<f64> {
    if series.len() <= TAIL_LEN {
        series.to_vec()
    } else {
        series[series.len() - TAIL_LEN..].to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct TimeframeIndicators {
    pub closes: Vec<f64>,
    pub ema20: Vec<f64>,
    pub ema50: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
    pub atr3: Vec<f64>,
    pub atr14: Vec<f64>,
    pub current_volume: f64,
    pub average_volume: f64,
}

#[derive(Debug, Clone)]
pub struct CoinSnapshot {
    pub coin: String,
    pub current_price: f64,
    pub open_interest_latest: f64,
    pub open_interest_average: f64,
    pub funding_rate: f64,
    pub timeframes: HashMap<String, TimeframeIndicators>,
}

#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub produced_at: DateTime<Utc>,
    pub coins: HashMap<String, CoinSnapshot>,
}

/// Fetches klines and metadata for the configured universe in parallel,
/// computes indicators, and assembles one MarketSnapshot (§4.4). A coin
/// missing an indispensable field is dropped with a warning rather than
/// failing the whole collection.
pub struct MarketDataCollector {
    client: Arc<dyn ExchangeClient>,
    trading: TradingConfig,
}

impl MarketDataCollector {
    pub fn new(client: Arc<dyn ExchangeClient>, trading: TradingConfig) -> Self {
        Self { client, trading }
    }

    pub async fn collect(&self) -> Result<MarketSnapshot, EngineError> {
        let mids = self.client.all_mids().await?;
        let asset_ctxs = self.client.meta_and_asset_ctxs().await?;

        let mut set = tokio::task::JoinSet::new();
        for coin in self.trading.coins.clone() {
            let client = self.client.clone();
            let trading = self.trading.clone();
            let mids = mids.clone();
            let asset_ctxs = asset_ctxs.clone();
            set.spawn(async move { (coin.clone(), Self::collect_coin(client, trading, coin, &mids, &asset_ctxs).await) });
        }

        let mut coins = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (coin, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    warn!("market data task panicked: {e}");
                    continue;
                }
            };
            match result {
                Ok(Some(snapshot)) => {
                    coins.insert(coin, snapshot);
                }
                Ok(None) => warn!("dropping {coin} from market snapshot: indispensable field missing"),
                Err(e) => warn!("dropping {coin} from market snapshot: {e}"),
            }
        }

        if coins.is_empty() {
            return Err(EngineError::DataUnavailable("no coin in the configured universe produced usable data".to_string()));
        }

        Ok(MarketSnapshot { produced_at: Utc::now(), coins })
    }

    async fn collect_coin(
        client: Arc<dyn ExchangeClient>,
        trading: TradingConfig,
        coin: String,
        mids: &HashMap<String, f64>,
        asset_ctxs: &[crate::exchange::client::AssetContext],
    ) -> Result<Option<CoinSnapshot>, EngineError> {
        let current_price = match mids.get(&coin) {
            Some(p) => *p,
            None => return Ok(None),
        };

        let ctx = asset_ctxs.iter().find(|c| &c.coin == &coin);
        let (open_interest_latest, funding_rate) = match ctx {
            Some(c) => (c.open_interest, c.funding_rate),
            None => (0.0, 0.0),
        };

        // No real open-interest history endpoint is exposed by the exchange
        // surface; the latest snapshot value stands in for the average
        // rather than averaging an unrelated series (funding rate).
        let open_interest_average = open_interest_latest;

        let mut timeframes = HashMap::new();
        let mut saw_primary = false;
        for (i, timeframe) in trading.timeframes.iter().enumerate() {
            let limit = *trading.kline_limits.get(timeframe).unwrap_or(&100);
            let klines = match client.candle_snapshot(&coin, timeframe, limit).await {
                Ok(k) if !k.is_empty() => k,
                _ => continue,
            };

            let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
            let highs: Vec<f64> = klines.iter().map(|k| k.high).collect();
            let lows: Vec<f64> = klines.iter().map(|k| k.low).collect();
            let volumes: Vec<f64> = klines.iter().map(|k| k.volume).collect();

            let ema20 = IndicatorEngine::ema(&closes, 20).unwrap_or_default();
            let ema50 = IndicatorEngine::ema(&closes, 50).unwrap_or_default();
            let (macd, _signal) = IndicatorEngine::macd(&closes).unwrap_or_default();
            let rsi7 = IndicatorEngine::rsi(&closes, 7).unwrap_or_default();
            let rsi14 = IndicatorEngine::rsi(&closes, 14).unwrap_or_default();
            let atr3 = IndicatorEngine::atr(&highs, &lows, &closes, 3).unwrap_or_default();
            let atr14 = IndicatorEngine::atr(&highs, &lows, &closes, 14).unwrap_or_default();

            if i == 0 {
                saw_primary = true;
            }

            timeframes.insert(
                timeframe.clone(),
                TimeframeIndicators {
                    current_volume: volumes.last().copied().unwrap_or(0.0),
                    average_volume: IndicatorEngine::volume_average(&volumes),
                    closes: tail(&closes),
                    ema20: tail(&ema20),
                    ema50: tail(&ema50),
                    macd: tail(&macd),
                    rsi7: tail(&rsi7),
                    rsi14: tail(&rsi14),
                    atr3: tail(&atr3),
                    atr14: tail(&atr14),
                },
            );
        }

        if !saw_primary {
            return Ok(None);
        }

        Ok(Some(CoinSnapshot {
            coin,
            current_price,
            open_interest_latest,
            open_interest_average,
            funding_rate,
            timeframes,
        }))
    }
}
