//! ETH JSON-RPC compatibility shim
//!
//! Balances cross this boundary in Wei: the ledger keeps 8 decimals, wallets
//! expect 18, so every amount read here is multiplied by 10^10.

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::server::RpcState;
use crate::constants::WEI_PER_BASE_UNIT;
use crate::crypto::{Address, Hash};
use crate::ledger::SignedTx;

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// 1 gwei
const GAS_PRICE_HEX: &str = "0x3b9aca00";

/// JSON-RPC 2.0 request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Value,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

type MethodResult = Result<Value, (i32, String)>;

fn invalid(msg: impl Into<String>) -> (i32, String) {
    (INVALID_PARAMS, msg.into())
}

fn to_quantity(v: u128) -> String {
    format!("0x{:x}", v)
}

/// Base units to a `0x` Wei quantity
pub fn base_units_to_wei_hex(balance: i64) -> String {
    to_quantity(balance.max(0) as u128 * WEI_PER_BASE_UNIT)
}

fn param_str(params: &Option<Value>, index: usize) -> Result<&str, (i32, String)> {
    params
        .as_ref()
        .and_then(|p| p.get(index))
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("missing string param {}", index)))
}

fn param_address(params: &Option<Value>, index: usize) -> Result<Address, (i32, String)> {
    let raw = param_str(params, index)?;
    Address::parse(raw).map_err(|e| invalid(format!("bad address {}: {}", raw, e)))
}

fn param_hash(params: &Option<Value>, index: usize) -> Result<Hash, (i32, String)> {
    let raw = param_str(params, index)?;
    Hash::from_hex(raw.trim_start_matches("0x")).map_err(|_| invalid("hash must be 32 bytes of hex"))
}

/// Block tags `latest`, `earliest`, `pending` or a `0x` quantity
fn param_block_number(params: &Option<Value>, index: usize, tip: u64) -> Result<u64, (i32, String)> {
    match param_str(params, index)? {
        "latest" | "pending" | "safe" | "finalized" => Ok(tip),
        "earliest" => Ok(0),
        raw => {
            let digits = raw
                .strip_prefix("0x")
                .ok_or_else(|| invalid("block number must be 0x-hex"))?;
            u64::from_str_radix(digits, 16).map_err(|_| invalid("block number must be 0x-hex"))
        }
    }
}

/// Dispatch one request; the HTTP status is always 200
pub fn dispatch(state: &RpcState, req: JsonRpcRequest) -> JsonRpcResponse {
    let node = &state.node;
    let params = &req.params;
    let result: MethodResult = match req.method.as_str() {
        "eth_chainId" => Ok(json!(to_quantity(node.config().network.network_id as u128))),
        "net_version" => Ok(json!(node.config().network.network_id.to_string())),
        "eth_blockNumber" => Ok(json!(to_quantity(node.height() as u128))),
        "eth_gasPrice" => Ok(json!(GAS_PRICE_HEX)),
        "eth_syncing" => Ok(json!(false)),
        "eth_getBalance" => param_address(params, 0).map(|addr| {
            let balance = node.account(&addr).map_or(0, |a| a.balance);
            json!(base_units_to_wei_hex(balance))
        }),
        "eth_getTransactionCount" => param_address(params, 0).map(|addr| {
            let nonce = node.account(&addr).map_or(0, |a| a.nonce);
            json!(to_quantity(nonce as u128))
        }),
        "eth_getCode" => param_address(params, 0).map(|_| json!("0x")),
        "eth_getTransactionReceipt" => param_hash(params, 0).and_then(|hash| {
            match node.receipt(&hash) {
                Ok(Some(r)) => Ok(json!({
                    "transactionHash": format!("0x{}", r.tx_hash),
                    "blockNumber": to_quantity(r.height as u128),
                    "blockHash": node.block(r.height).map(|b| format!("0x{}", b.hash())),
                    "transactionIndex": to_quantity(r.index as u128),
                    "from": r.from,
                    "to": r.to.to_hex(),
                    "gasUsed": to_quantity(r.gas_used as u128),
                    "status": to_quantity(r.status as u128),
                })),
                Ok(None) => Ok(Value::Null),
                Err(e) => Err((INTERNAL_ERROR, e.to_string())),
            }
        }),
        "eth_getBlockByNumber" => param_block_number(params, 0, node.height()).map(|height| {
            node.block(height).map_or(Value::Null, |b| {
                json!({
                    "number": to_quantity(b.height as u128),
                    "hash": format!("0x{}", b.hash()),
                    "parentHash": format!("0x{}", b.prev_hash),
                    "timestamp": to_quantity(b.timestamp_unix.max(0) as u128),
                    "miner": b.farmer_addr.to_hex(),
                    "difficulty": to_quantity(b.difficulty as u128),
                    "stateRoot": format!("0x{}", b.state_root),
                    "receiptsRoot": format!("0x{}", b.receipts_root),
                    "gasUsed": to_quantity(b.gas_used as u128),
                    "gasLimit": to_quantity(b.gas_limit as u128),
                    "transactions": b.txs.iter().map(|t| format!("0x{}", t.hash())).collect::<Vec<_>>(),
                })
            })
        }),
        "eth_sendRawTransaction" => send_raw(state, params),
        "arcv_toHexAddress" => param_address(params, 0).map(|a| json!(a.to_hex())),
        "arcv_fromHexAddress" => param_address(params, 0).map(|a| json!(a.to_bech32())),
        other => Err((METHOD_NOT_FOUND, format!("method {} not found", other))),
    };
    match result {
        Ok(value) => JsonRpcResponse::success(req.id, value),
        Err((code, message)) => JsonRpcResponse::error(req.id, code, message),
    }
}

/// Hex-encoded JSON `SignedTx`
fn send_raw(state: &RpcState, params: &Option<Value>) -> MethodResult {
    let raw = param_str(params, 0)?;
    let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(|_| invalid("raw transaction must be hex"))?;
    let tx: SignedTx =
        serde_json::from_slice(&bytes).map_err(|e| invalid(format!("raw transaction is not a TxV1: {}", e)))?;
    state
        .node
        .submit_v1_tx(tx)
        .map(|hash| json!(format!("0x{}", hash)))
        .map_err(|e| (INTERNAL_ERROR, e.to_string()))
}

pub async fn handle_eth(State(state): State<RpcState>, body: Bytes) -> Json<JsonRpcResponse> {
    let resp = match serde_json::from_slice::<JsonRpcRequest>(&body) {
        Ok(req) => {
            let state = state.clone();
            tokio::task::spawn_blocking(move || dispatch(&state, req))
                .await
                .unwrap_or_else(|e| JsonRpcResponse::error(Value::Null, INTERNAL_ERROR, e.to_string()))
        }
        Err(e) => JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("parse error: {}", e)),
    };
    Json(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wei_conversion() {
        assert_eq!(base_units_to_wei_hex(0), "0x0");
        // 1 RCHV = 10^8 base units = 10^18 wei
        assert_eq!(base_units_to_wei_hex(100_000_000), "0xde0b6b3a7640000");
        assert_eq!(base_units_to_wei_hex(-5), "0x0");
    }

    #[test]
    fn test_block_number_tags() {
        let p = Some(json!(["latest"]));
        assert_eq!(param_block_number(&p, 0, 42).unwrap(), 42);
        let p = Some(json!(["0x10"]));
        assert_eq!(param_block_number(&p, 0, 42).unwrap(), 16);
        let p = Some(json!(["16"]));
        assert_eq!(param_block_number(&p, 0, 42).unwrap_err().0, INVALID_PARAMS);
        assert_eq!(param_block_number(&None, 0, 42).unwrap_err().0, INVALID_PARAMS);
    }

    #[test]
    fn test_error_shape() {
        let resp = JsonRpcResponse::error(json!(7), METHOD_NOT_FOUND, "nope");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["error"]["code"], -32601);
        assert_eq!(v["id"], 7);
        assert!(v.get("result").is_none());
    }
}
