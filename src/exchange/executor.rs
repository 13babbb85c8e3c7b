use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::signing::{
    self, ActionWire, LimitOrderWire, OrderRequest, OrderTypeWire, TriggerOrderWire,
};

use super::client::AssetInfo;
use super::{float_to_wire, round_to_5_sig_figs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
}

/// Owns the signer and private key material for exactly one exchange
/// account. Never shared across agents with different accounts (§3's
/// ownership rule). A per-instance mutex serializes `update_leverage` +
/// `place_order` within one agent, per §5's intra-agent serialization rule.
pub struct ExchangeExecutor {
    private_key: String,
    base_url: String,
    http: reqwest::Client,
    dry_run: bool,
    asset_info: HashMap<String, AssetInfo>,
    dry_run_order_seq: AtomicU64,
    serialize: Mutex<()>,
}

impl ExchangeExecutor {
    pub fn new(
        private_key: String,
        base_url: String,
        http: reqwest::Client,
        dry_run: bool,
        asset_info: HashMap<String, AssetInfo>,
    ) -> Self {
        Self {
            private_key,
            base_url,
            http,
            dry_run,
            asset_info,
            dry_run_order_seq: AtomicU64::new(1),
            serialize: Mutex::new(()),
        }
    }

    fn asset(&self, coin: &str) -> Result<AssetInfo, EngineError> {
        self.asset_info
            .get(coin)
            .copied()
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown coin: {coin}")))
    }

    fn nonce() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    async fn post_exchange(&self, action: serde_json::Value, nonce: u64, signature: signing::Signature) -> Result<serde_json::Value, EngineError> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });

        let resp = self
            .http
            .post(format!("{}/exchange", self.base_url))
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

        let text = resp.text().await.map_err(|e| EngineError::Network(e.to_string()))?;
        let data: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| EngineError::Network(e.to_string()))?;

        if data["status"].as_str() == Some("err") {
            let reason = data["response"].as_str().unwrap_or("unknown exchange error").to_string();
            if reason.contains("rate limited") || reason.contains("cumulative requests") {
                return Err(EngineError::RateLimited);
            }
            return Err(EngineError::ExchangeRejected(reason));
        }
        if let Some(statuses) = data["response"]["data"]["statuses"].as_array() {
            if let Some(err) = statuses.get(0).and_then(|s| s["error"].as_str()) {
                return Err(EngineError::ExchangeRejected(err.to_string()));
            }
        }

        Ok(data)
    }

    /// Up to 3 attempts with exponential backoff, only for classified
    /// retryable failures (§4.2).
    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < 2 => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    log::warn!("exchange call failed ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Places an order. Market orders are expressed as IOC limit at a price
    /// far through the book. Dry-run short-circuits before any network or
    /// signing call but still performs tick/lot rounding.
    pub async fn place_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        kind: OrderKind,
        reduce_only: bool,
        client_order_id: Option<String>,
    ) -> Result<OrderAck, EngineError> {
        let info = self.asset(coin)?;

        let effective_price = match kind {
            OrderKind::Limit => price,
            OrderKind::Market if is_buy => price * 1.05,
            OrderKind::Market => price * 0.95,
        };
        let price_rounded = round_to_5_sig_figs(effective_price);
        let size_rounded = super::round_f64(size.abs(), info.sz_decimals as usize);

        if size_rounded <= 0.0 {
            return Err(EngineError::InvalidOrder("order size rounds to zero".into()));
        }

        if self.dry_run {
            let exchange_order_id = match &client_order_id {
                Some(coid) => format!("dryrun-{coid}"),
                None => format!("dryrun-{}", self.dry_run_order_seq.fetch_add(1, Ordering::SeqCst)),
            };
            log::info!(
                "[DRY-RUN] place_order {} {} size={} price={}",
                coin,
                if is_buy { "buy" } else { "sell" },
                size_rounded,
                price_rounded
            );
            return Ok(OrderAck { exchange_order_id });
        }

        let _guard = self.serialize.lock().await;

        self.with_retry(|| async {
            let nonce = Self::nonce();
            let tif = match kind {
                OrderKind::Limit => "Gtc",
                OrderKind::Market => "Ioc",
            };
            let order = OrderRequest {
                asset: info.asset_index,
                is_buy,
                limit_px: float_to_wire(price_rounded),
                sz: float_to_wire(size_rounded),
                reduce_only,
                order_type: OrderTypeWire::Limit(LimitOrderWire { tif: tif.to_string() }),
                client_order_id: client_order_id.clone(),
            };
            let action = ActionWire { r#type: "order".to_string(), orders: vec![order], grouping: "na".to_string() };
            let (sig, action_json) = signing::sign_order_action(&self.private_key, action, nonce)?;
            let result = self.post_exchange(action_json, nonce, sig).await?;

            let oid = result["response"]["data"]["statuses"][0]["resting"]["oid"]
                .as_u64()
                .or_else(|| result["response"]["data"]["statuses"][0]["filled"]["oid"].as_u64());
            match oid {
                Some(id) => Ok(OrderAck { exchange_order_id: id.to_string() }),
                None => Ok(OrderAck { exchange_order_id: format!("nonce-{nonce}") }),
            }
        })
        .await
    }

    /// Places a reduce-only trigger (stop-loss or take-profit) order bound to
    /// the position (`positionTpsl` grouping, per the default Open Question
    /// decision recorded in DESIGN.md).
    pub async fn place_trigger_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        tpsl: &str,
        grouping: &str,
    ) -> Result<OrderAck, EngineError> {
        let info = self.asset(coin)?;
        let size_rounded = super::round_f64(size.abs(), info.sz_decimals as usize);
        let price_rounded = round_to_5_sig_figs(trigger_price);

        if self.dry_run {
            let id = self.dry_run_order_seq.fetch_add(1, Ordering::SeqCst);
            log::info!("[DRY-RUN] place_trigger_order {coin} {tpsl} trigger={price_rounded}");
            return Ok(OrderAck { exchange_order_id: format!("dryrun-{id}") });
        }

        let _guard = self.serialize.lock().await;

        self.with_retry(|| async {
            let nonce = Self::nonce();
            let order = OrderRequest {
                asset: info.asset_index,
                is_buy,
                limit_px: float_to_wire(price_rounded),
                sz: float_to_wire(size_rounded),
                reduce_only: true,
                order_type: OrderTypeWire::Trigger(TriggerOrderWire {
                    is_market: true,
                    trigger_px: float_to_wire(price_rounded),
                    tpsl: tpsl.to_string(),
                }),
                client_order_id: None,
            };
            let action = ActionWire { r#type: "order".to_string(), orders: vec![order], grouping: grouping.to_string() };
            let (sig, action_json) = signing::sign_order_action(&self.private_key, action, nonce)?;
            let result = self.post_exchange(action_json, nonce, sig).await?;
            let oid = result["response"]["data"]["statuses"][0]["resting"]["oid"].as_u64();
            Ok(OrderAck { exchange_order_id: oid.map(|o| o.to_string()).unwrap_or_else(|| format!("nonce-{nonce}")) })
        })
        .await
    }

    pub async fn cancel_order(&self, coin: &str, order_id: &str) -> Result<(), EngineError> {
        let info = self.asset(coin)?;
        let oid: u64 = order_id
            .parse()
            .map_err(|_| EngineError::InvalidOrder(format!("non-numeric order id: {order_id}")))?;

        if self.dry_run {
            log::info!("[DRY-RUN] cancel_order {coin} oid={oid}");
            return Ok(());
        }

        let _guard = self.serialize.lock().await;
        self.with_retry(|| async {
            let nonce = Self::nonce();
            let (sig, action_json) = signing::sign_cancel_action(&self.private_key, info.asset_index, oid, nonce)?;
            self.post_exchange(action_json, nonce, sig).await?;
            Ok(())
        })
        .await
    }

    pub async fn update_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> Result<(), EngineError> {
        let info = self.asset(coin)?;
        let leverage = leverage.min(info.max_leverage);

        if self.dry_run {
            log::info!("[DRY-RUN] update_leverage {coin} -> {leverage}x cross={is_cross}");
            return Ok(());
        }

        let _guard = self.serialize.lock().await;
        self.with_retry(|| async {
            let nonce = Self::nonce();
            let (sig, action_json) =
                signing::sign_update_leverage_action(&self.private_key, info.asset_index, is_cross, leverage, nonce)?;
            self.post_exchange(action_json, nonce, sig).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dry_run: bool) -> ExchangeExecutor {
        let mut assets = HashMap::new();
        assets.insert(
            "BTC".to_string(),
            AssetInfo { asset_index: 0, sz_decimals: 5, max_leverage: 20 },
        );
        ExchangeExecutor::new(
            "0x0123456789012345678901234567890123456789012345678901234567890a".to_string(),
            "https://example.invalid".to_string(),
            reqwest::Client::new(),
            dry_run,
            assets,
        )
    }

    #[tokio::test]
    async fn dry_run_place_order_never_hits_network_and_returns_unique_ids() {
        let ex = executor(true);
        let a1 = ex.place_order("BTC", true, 0.03, 50000.0, OrderKind::Market, false, None).await.unwrap();
        let a2 = ex.place_order("BTC", true, 0.03, 50000.0, OrderKind::Market, false, None).await.unwrap();
        assert_ne!(a1.exchange_order_id, a2.exchange_order_id);
        assert!(!a1.exchange_order_id.is_empty());
    }

    #[tokio::test]
    async fn place_order_with_same_client_order_id_is_idempotent() {
        let ex = executor(true);
        let a1 = ex
            .place_order("BTC", true, 0.03, 50000.0, OrderKind::Market, false, Some("trade-123".to_string()))
            .await
            .unwrap();
        let a2 = ex
            .place_order("BTC", true, 0.03, 50000.0, OrderKind::Market, false, Some("trade-123".to_string()))
            .await
            .unwrap();
        assert_eq!(a1.exchange_order_id, a2.exchange_order_id);
    }

    #[tokio::test]
    async fn unknown_coin_is_rejected_without_network_call() {
        let ex = executor(true);
        let err = ex.place_order("DOGE", true, 1.0, 1.0, OrderKind::Market, false, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn zero_rounded_size_is_rejected() {
        let ex = executor(true);
        let err = ex.place_order("BTC", true, 0.0000001, 50000.0, OrderKind::Market, false, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder(_)));
    }
}
