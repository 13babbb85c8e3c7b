use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EngineError;

/// Per-cycle read surface into the exchange: mids, order books, klines,
/// universe/asset metadata, funding, and account state (§4.4, §6).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn all_mids(&self) -> Result<HashMap<String, f64>, EngineError>;
    async fn candle_snapshot(&self, coin: &str, interval: &str, limit: usize) -> Result<Vec<Kline>, EngineError>;
    async fn meta_and_asset_ctxs(&self) -> Result<Vec<AssetContext>, EngineError>;
    async fn funding_history(&self, coin: &str, limit: usize) -> Result<Vec<f64>, EngineError>;
    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState, EngineError>;
    async fn user_fills(&self, user: &str) -> Result<Vec<serde_json::Value>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct Kline {
    pub open_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct AssetContext {
    pub coin: String,
    pub asset_index: u32,
    pub sz_decimals: u32,
    pub max_leverage: u32,
    pub open_interest: f64,
    pub funding_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ClearinghouseState {
    pub account_value: f64,
    pub withdrawable: f64,
    pub positions: Vec<RawPosition>,
}

#[derive(Debug, Clone)]
pub struct RawPosition {
    pub coin: String,
    pub signed_size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AssetInfo {
    pub asset_index: u32,
    pub sz_decimals: u32,
    pub max_leverage: u32,
}

/// HyperLiquid's `/info` + `/exchange` HTTP surface. A short TTL cache
/// protects against the exchange's per-IP rate limit when several agents
/// query the same coin set within one cycle.
pub struct LiveExchangeClient {
    base_url: String,
    http: reqwest::Client,
    cache: tokio::sync::Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    mids: Option<(HashMap<String, f64>, Instant)>,
    asset_ctxs: Option<(Vec<AssetContext>, Instant)>,
}

const CACHE_TTL: Duration = Duration::from_secs(2);

impl LiveExchangeClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            cache: tokio::sync::Mutex::new(Cache::default()),
        }
    }

    pub async fn post_info(&self, payload: serde_json::Value) -> Result<serde_json::Value, EngineError> {
        let resp = self
            .http
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(EngineError::RateLimited);
        }
        if resp.status().is_server_error() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transient5xx { status, body });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| EngineError::Network(e.to_string()))?;
        if let Some(err) = data["error"].as_str() {
            if err.contains("rate limited") {
                return Err(EngineError::RateLimited);
            }
        }
        Ok(data)
    }

    pub fn asset_index_for(&self, asset_ctxs: &[AssetContext], coin: &str) -> Option<u32> {
        asset_ctxs.iter().find(|c| c.coin == coin).map(|c| c.asset_index)
    }
}

#[async_trait]
impl ExchangeClient for LiveExchangeClient {
    async fn all_mids(&self) -> Result<HashMap<String, f64>, EngineError> {
        {
            let cache = self.cache.lock().await;
            if let Some((mids, ts)) = &cache.mids {
                if ts.elapsed() < CACHE_TTL {
                    return Ok(mids.clone());
                }
            }
        }

        let data = self.post_info(serde_json::json!({ "type": "allMids" })).await?;
        let mut mids = HashMap::new();
        if let Some(obj) = data.as_object() {
            for (coin, px_val) in obj {
                if let Some(px) = px_val.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    mids.insert(coin.clone(), px);
                }
            }
        }
        self.cache.lock().await.mids = Some((mids.clone(), Instant::now()));
        Ok(mids)
    }

    async fn candle_snapshot(&self, coin: &str, interval: &str, limit: usize) -> Result<Vec<Kline>, EngineError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let data = self
            .post_info(serde_json::json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": coin,
                    "interval": interval,
                    "startTime": 0,
                    "endTime": now_ms,
                }
            }))
            .await?;

        let arr = data.as_array().ok_or_else(|| {
            EngineError::DataUnavailable(format!("no candle data for {coin}/{interval}"))
        })?;

        #[derive(Deserialize)]
        struct RawCandle {
            t: u64,
            o: String,
            h: String,
            l: String,
            c: String,
            v: String,
        }

        let mut klines: Vec<Kline> = arr
            .iter()
            .filter_map(|v| serde_json::from_value::<RawCandle>(v.clone()).ok())
            .map(|c| Kline {
                open_time: c.t,
                open: c.o.parse().unwrap_or(0.0),
                high: c.h.parse().unwrap_or(0.0),
                low: c.l.parse().unwrap_or(0.0),
                close: c.c.parse().unwrap_or(0.0),
                volume: c.v.parse().unwrap_or(0.0),
            })
            .collect();

        klines.sort_by_key(|k| k.open_time);
        if klines.len() > limit {
            let start = klines.len() - limit;
            klines = klines.split_off(start);
        }
        Ok(klines)
    }

    async fn meta_and_asset_ctxs(&self) -> Result<Vec<AssetContext>, EngineError> {
        {
            let cache = self.cache.lock().await;
            if let Some((ctxs, ts)) = &cache.asset_ctxs {
                if ts.elapsed() < CACHE_TTL {
                    return Ok(ctxs.clone());
                }
            }
        }

        let data = self.post_info(serde_json::json!({ "type": "metaAndAssetCtxs" })).await?;
        let universe = data[0]["universe"].as_array().cloned().unwrap_or_default();
        let ctxs = data[1].as_array().cloned().unwrap_or_default();

        let mut out = Vec::with_capacity(universe.len());
        for (i, asset) in universe.iter().enumerate() {
            let coin = asset["name"].as_str().unwrap_or_default().to_string();
            if coin.is_empty() {
                continue;
            }
            let sz_decimals = asset["szDecimals"].as_u64().unwrap_or(4) as u32;
            let max_leverage = asset["maxLeverage"].as_u64().unwrap_or(20) as u32;
            let ctx = ctxs.get(i);
            let open_interest = ctx
                .and_then(|c| c["openInterest"].as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            let funding_rate = ctx
                .and_then(|c| c["funding"].as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);

            out.push(AssetContext {
                coin,
                asset_index: i as u32,
                sz_decimals,
                max_leverage,
                open_interest,
                funding_rate,
            });
        }
        self.cache.lock().await.asset_ctxs = Some((out.clone(), Instant::now()));
        Ok(out)
    }

    async fn funding_history(&self, coin: &str, limit: usize) -> Result<Vec<f64>, EngineError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let start_ms = now_ms - (limit as i64) * 3_600_000;
        let data = self
            .post_info(serde_json::json!({
                "type": "fundingHistory",
                "coin": coin,
                "startTime": start_ms,
                "endTime": now_ms,
            }))
            .await?;

        let rates = data
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v["fundingRate"].as_str().and_then(|s| s.parse::<f64>().ok()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rates)
    }

    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState, EngineError> {
        let data = self
            .post_info(serde_json::json!({ "type": "clearinghouseState", "user": user }))
            .await?;

        let withdrawable = data["withdrawable"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| data["withdrawable"].as_f64())
            .unwrap_or(0.0);
        let account_value = data["marginSummary"]["accountValue"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| data["marginSummary"]["accountValue"].as_f64())
            .unwrap_or(withdrawable);

        let mut positions = Vec::new();
        if let Some(list) = data["assetPositions"].as_array() {
            for p in list {
                let pos = &p["position"];
                let coin = pos["coin"].as_str().unwrap_or_default().to_string();
                let signed_size = pos["szi"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
                if signed_size.abs() < 1e-9 {
                    continue;
                }
                positions.push(RawPosition {
                    coin,
                    signed_size,
                    entry_price: pos["entryPx"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
                    unrealized_pnl: pos["unrealizedPnl"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
                    leverage: pos["leverage"]["value"].as_f64().unwrap_or(0.0),
                    liquidation_price: pos["liquidationPx"].as_str().and_then(|s| s.parse::<f64>().ok()),
                });
            }
        }

        Ok(ClearinghouseState { account_value, withdrawable, positions })
    }

    async fn user_fills(&self, user: &str) -> Result<Vec<serde_json::Value>, EngineError> {
        let data = self.post_info(serde_json::json!({ "type": "userFills", "user": user })).await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }
}
