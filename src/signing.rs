// EIP-712-style signing of HyperLiquid L1 actions (§4.1).
//
// HyperLiquid's validator re-msgpacks the JSON request body to verify the
// signature, so the JSON key order sent on the wire must match the order the
// msgpack encoder would produce. We build both representations by hand rather
// than relying on `serde_json::json!` (which alphabetizes keys via
// `preserve_order` only if we insert in the right order ourselves).
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

#[derive(Serialize)]
struct Agent {
    source: String,
    #[serde(rename = "connectionId")]
    connection_id: H256,
}

// ─── JSON wire types for the `action` field of the request body ──────

#[derive(Serialize, Clone)]
pub struct OrderRequest {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub order_type: OrderTypeWire,
    pub client_order_id: Option<String>,
}

#[derive(Serialize, Clone)]
pub enum OrderTypeWire {
    Limit(LimitOrderWire),
    Trigger(TriggerOrderWire),
}

#[derive(Serialize, Clone)]
pub struct LimitOrderWire {
    pub tif: String,
}

#[derive(Serialize, Clone)]
pub struct TriggerOrderWire {
    pub is_market: bool,
    pub trigger_px: String,
    pub tpsl: String, // "tp" | "sl"
}

#[derive(Serialize, Clone)]
pub struct ActionWire {
    pub r#type: String, // "order"
    pub orders: Vec<OrderRequest>,
    pub grouping: String, // "na" | "normalTpsl" | "positionTpsl"
}

// ─── MsgPack mirror types (abbreviated keys, matching the Python SDK) ─

#[derive(Serialize)]
struct OrderWireMsgPack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeWireMsgPack,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<String>,
}

#[derive(Serialize)]
enum OrderTypeWireMsgPack {
    #[serde(rename = "limit")]
    Limit { limit: LimitOrderWireMsgPack },
    #[serde(rename = "trigger")]
    Trigger { trigger: TriggerOrderWireMsgPack },
}

#[derive(Serialize)]
struct LimitOrderWireMsgPack {
    tif: String,
}

#[derive(Serialize)]
struct TriggerOrderWireMsgPack {
    #[serde(rename = "isMarket")]
    is_market: bool,
    #[serde(rename = "triggerPx")]
    trigger_px: String,
    tpsl: String,
}

#[derive(Serialize)]
struct ActionMsgPack {
    r#type: String,
    orders: Vec<OrderWireMsgPack>,
    grouping: String,
}

fn order_to_msgpack(o: &OrderRequest) -> OrderWireMsgPack {
    let t = match &o.order_type {
        OrderTypeWire::Limit(l) => OrderTypeWireMsgPack::Limit {
            limit: LimitOrderWireMsgPack { tif: l.tif.clone() },
        },
        OrderTypeWire::Trigger(tr) => OrderTypeWireMsgPack::Trigger {
            trigger: TriggerOrderWireMsgPack {
                is_market: tr.is_market,
                trigger_px: tr.trigger_px.clone(),
                tpsl: tr.tpsl.clone(),
            },
        },
    };
    OrderWireMsgPack {
        a: o.asset,
        b: o.is_buy,
        p: o.limit_px.clone(),
        s: o.sz.clone(),
        r: o.reduce_only,
        t,
        c: o.client_order_id.clone(),
    }
}

fn order_to_json(o: &OrderRequest) -> serde_json::Value {
    let mut order_map = serde_json::Map::new();
    order_map.insert("a".into(), serde_json::Value::from(o.asset));
    order_map.insert("b".into(), serde_json::Value::from(o.is_buy));
    order_map.insert("p".into(), serde_json::Value::from(o.limit_px.clone()));
    order_map.insert("s".into(), serde_json::Value::from(o.sz.clone()));
    order_map.insert("r".into(), serde_json::Value::from(o.reduce_only));

    let t = match &o.order_type {
        OrderTypeWire::Limit(l) => {
            let mut tif_map = serde_json::Map::new();
            tif_map.insert("tif".into(), serde_json::Value::from(l.tif.clone()));
            let mut limit_map = serde_json::Map::new();
            limit_map.insert("limit".into(), serde_json::Value::Object(tif_map));
            serde_json::Value::Object(limit_map)
        }
        OrderTypeWire::Trigger(tr) => {
            let mut trig_map = serde_json::Map::new();
            trig_map.insert("isMarket".into(), serde_json::Value::from(tr.is_market));
            trig_map.insert("triggerPx".into(), serde_json::Value::from(tr.trigger_px.clone()));
            trig_map.insert("tpsl".into(), serde_json::Value::from(tr.tpsl.clone()));
            let mut trigger_map = serde_json::Map::new();
            trigger_map.insert("trigger".into(), serde_json::Value::Object(trig_map));
            serde_json::Value::Object(trigger_map)
        }
    };
    order_map.insert("t".into(), t);
    if let Some(c) = &o.client_order_id {
        order_map.insert("c".into(), serde_json::Value::from(c.clone()));
    }
    serde_json::Value::Object(order_map)
}

/// Computes the action hash matching the Python SDK's `action_hash()`:
/// msgpack(action) || nonce.to_bytes(8, "big") || vault_marker.
fn compute_action_hash(action: &ActionWire, nonce: u64, vault_address: Option<&str>) -> [u8; 32] {
    let msgpack_action = ActionMsgPack {
        r#type: action.r#type.clone(),
        orders: action.orders.iter().map(order_to_msgpack).collect(),
        grouping: action.grouping.clone(),
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .expect("msgpack serialization of action is infallible for this shape");

    buf.extend_from_slice(&nonce.to_be_bytes());

    match vault_address {
        None => buf.push(0x00),
        Some(addr) => {
            buf.push(0x01);
            let addr_clean = addr.strip_prefix("0x").unwrap_or(addr);
            if let Ok(bytes) = hex::decode(addr_clean) {
                buf.extend_from_slice(&bytes);
            }
        }
    }

    keccak256(&buf)
}

/// EIP-712 domain used by all HyperLiquid L1 actions: {name: "Exchange",
/// version: "1", chainId: 1337, verifyingContract: 0x0}.
fn eip712_digest(action_hash: [u8; 32]) -> H256 {
    let domain = ethers_core::types::transaction::eip712::EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(1337)),
        verifying_contract: Some(Address::zero()),
        salt: None,
    };
    let domain_hash = domain.separator();

    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256("a".as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(&action_hash);
    let struct_hash = keccak256(&encoded);

    let mut final_payload = Vec::new();
    final_payload.extend_from_slice(&[0x19, 0x01]);
    final_payload.extend_from_slice(&domain_hash);
    final_payload.extend_from_slice(&struct_hash);

    H256::from(keccak256(&final_payload))
}

fn sign_digest(private_key: &str, digest: H256) -> Result<Signature, EngineError> {
    let wallet = LocalWallet::from_str(private_key)
        .map_err(|e| EngineError::Auth(format!("invalid signing key: {e}")))?;
    let sig = wallet
        .sign_hash(digest)
        .map_err(|e| EngineError::Auth(format!("signing failed: {e}")))?;
    Ok(Signature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v as u8,
    })
}

/// Returns the lowercase address derived from the signing key, per §4.1's
/// `address()` contract.
pub fn address_of(private_key: &str) -> Result<String, EngineError> {
    let wallet = LocalWallet::from_str(private_key)
        .map_err(|e| EngineError::Auth(format!("invalid signing key: {e}")))?;
    Ok(format!("{:#x}", wallet.address()))
}

pub fn sign_order_action(
    private_key: &str,
    action: ActionWire,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), EngineError> {
    let action_hash = compute_action_hash(&action, nonce, None);
    let signature = sign_digest(private_key, eip712_digest(action_hash))?;

    let json_orders: Vec<serde_json::Value> = action.orders.iter().map(order_to_json).collect();
    let mut action_map = serde_json::Map::new();
    action_map.insert("type".into(), serde_json::Value::from(action.r#type.clone()));
    action_map.insert("orders".into(), serde_json::Value::Array(json_orders));
    action_map.insert("grouping".into(), serde_json::Value::from(action.grouping.clone()));

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_cancel_action(
    private_key: &str,
    asset: u32,
    oid: u64,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), EngineError> {
    #[derive(Serialize)]
    struct CancelWireMsgPack {
        a: u32,
        o: u64,
    }
    #[derive(Serialize)]
    struct CancelActionMsgPack {
        r#type: String,
        cancels: Vec<CancelWireMsgPack>,
    }

    let msgpack_action = CancelActionMsgPack {
        r#type: "cancel".to_string(),
        cancels: vec![CancelWireMsgPack { a: asset, o: oid }],
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .expect("msgpack serialization of cancel action is infallible for this shape");
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.push(0x00);

    let action_hash = keccak256(&buf);
    let signature = sign_digest(private_key, eip712_digest(action_hash))?;

    let mut cancel_obj = serde_json::Map::new();
    cancel_obj.insert("a".into(), serde_json::Value::from(asset));
    cancel_obj.insert("o".into(), serde_json::Value::from(oid));

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".into(), serde_json::Value::from("cancel"));
    action_map.insert(
        "cancels".into(),
        serde_json::Value::Array(vec![serde_json::Value::Object(cancel_obj)]),
    );

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_update_leverage_action(
    private_key: &str,
    asset: u32,
    is_cross: bool,
    leverage: u32,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), EngineError> {
    #[derive(Serialize)]
    struct UpdateLeverageMsgPack {
        r#type: String,
        asset: u32,
        #[serde(rename = "isCross")]
        is_cross: bool,
        leverage: u32,
    }

    let msgpack_action = UpdateLeverageMsgPack {
        r#type: "updateLeverage".to_string(),
        asset,
        is_cross,
        leverage,
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .expect("msgpack serialization of updateLeverage action is infallible for this shape");
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.push(0x00);

    let action_hash = keccak256(&buf);
    let signature = sign_digest(private_key, eip712_digest(action_hash))?;

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".into(), serde_json::Value::from("updateLeverage"));
    action_map.insert("asset".into(), serde_json::Value::from(asset));
    action_map.insert("isCross".into(), serde_json::Value::from(is_cross));
    action_map.insert("leverage".into(), serde_json::Value::from(leverage));

    Ok((signature, serde_json::Value::Object(action_map)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890a";

    #[test]
    fn address_is_deterministic() {
        let a1 = address_of(TEST_KEY).unwrap();
        let a2 = address_of(TEST_KEY).unwrap();
        assert_eq!(a1, a2);
        assert!(a1.starts_with("0x"));
    }

    #[test]
    fn signing_does_not_panic_and_produces_hex_fields() {
        let action = ActionWire {
            r#type: "order".to_string(),
            orders: vec![OrderRequest {
                asset: 0,
                is_buy: true,
                limit_px: "50000".to_string(),
                sz: "0.01".to_string(),
                reduce_only: false,
                order_type: OrderTypeWire::Limit(LimitOrderWire { tif: "Ioc".to_string() }),
                client_order_id: None,
            }],
            grouping: "na".to_string(),
        };
        let (sig, json) = sign_order_action(TEST_KEY, action, 1).unwrap();
        assert!(sig.r.starts_with("0x"));
        assert!(sig.s.starts_with("0x"));
        assert_eq!(json["type"], "order");
    }

    #[test]
    fn cancel_action_signs() {
        let (sig, json) = sign_cancel_action(TEST_KEY, 0, 42, 1).unwrap();
        assert!(!sig.r.is_empty());
        assert_eq!(json["cancels"][0]["o"], 42);
    }

    #[test]
    fn update_leverage_signs() {
        let (sig, json) = sign_update_leverage_action(TEST_KEY, 0, true, 10, 1).unwrap();
        assert!(!sig.r.is_empty());
        assert_eq!(json["leverage"], 10);
    }
}
