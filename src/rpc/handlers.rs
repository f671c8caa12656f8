//! REST handlers

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::server::{ApiError, RpcState};
use super::types::*;
use crate::constants::{DENOM_SYMBOL, MAX_BLOCKS_PER_BATCH, NODE_VERSION};
use crate::consensus::Block;
use crate::crypto::{Address, Hash};
use crate::ledger::{LegacyTx, Receipt, SignedTx, Transaction};
use crate::metrics::WatchdogSnapshot;
use crate::node::{BlockSubmission, NodeError};
use crate::p2p::PeerSummary;
use crate::vdf::VdfState;

/// Fee per KiB of transaction, in base units
pub const FEE_PER_KIB: u64 = 100;

/// Size assumed when `/estimateFee` gets no `bytes`
pub const DEFAULT_TX_BYTES: u64 = 256;

/// Linear fee: 100 base units per started KiB, never below 100
pub fn estimate_fee_for(bytes: u64) -> u64 {
    (bytes.div_ceil(1024) * FEE_PER_KIB).max(FEE_PER_KIB)
}

pub(super) async fn banner(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let config = state.node.config();
    Json(json!({
        "service": "archivas-node",
        "version": NODE_VERSION,
        "network": config.network.name,
        "chainId": config.network.chain_id,
        "denom": DENOM_SYMBOL,
    }))
}

pub(super) async fn chain_tip(State(state): State<RpcState>) -> Json<ChainTipResponse> {
    Json(state.node.tip().into())
}

pub(super) async fn challenge(State(state): State<RpcState>) -> Json<ChallengeResponse> {
    Json(state.node.challenge().into())
}

pub(super) async fn submit_block(
    State(state): State<RpcState>,
    Json(req): Json<SubmitBlockRequest>,
) -> Response {
    if !req.farmer_pubkey_hex.is_empty()
        && !req
            .farmer_pubkey_hex
            .trim_start_matches("0x")
            .eq_ignore_ascii_case(&req.proof.farmer_pubkey.to_hex())
    {
        return block_reply(
            StatusCode::BAD_REQUEST,
            "rejected",
            "farmer_pubkey_hex does not match proof".into(),
            None,
        );
    }
    let submission = BlockSubmission {
        vdf: req.vdf(),
        proof: req.proof,
        farmer_addr: req.farmer_addr,
    };
    let node = state.node.clone();
    let result = tokio::task::spawn_blocking(move || node.submit_block(submission)).await;
    match result {
        Ok(Ok(accepted)) => block_reply(
            StatusCode::OK,
            "accepted",
            format!("block {} accepted", accepted.height),
            Some((accepted.height, accepted.hash)),
        ),
        Ok(Err(e)) => {
            let err = ApiError::from(e);
            block_reply(err.status, "rejected", err.message, None)
        }
        Err(e) => block_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error",
            format!("block task failed: {}", e),
            None,
        ),
    }
}

fn block_reply(status: StatusCode, word: &str, message: String, block: Option<(u64, Hash)>) -> Response {
    let body = SubmitBlockResponse {
        status: word.to_string(),
        message,
        height: block.map(|b| b.0),
        hash: block.map(|b| b.1),
    };
    (status, Json(body)).into_response()
}

pub(super) async fn vdf_update(
    State(state): State<RpcState>,
    Json(update): Json<VdfState>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let node = state.node.clone();
    let snapshot = tokio::task::spawn_blocking(move || node.update_vdf(update))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(snapshot.into()))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map_or(false, |mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn tx_reply(status: StatusCode, result: Result<Hash, String>) -> Response {
    let body = match result {
        Ok(hash) => SubmitTxResponse {
            ok: true,
            hash: Some(hash),
            error: None,
        },
        Err(error) => SubmitTxResponse {
            ok: false,
            hash: None,
            error: Some(error),
        },
    };
    (status, Json(body)).into_response()
}

/// Content-type check and JSON parse shared by the transaction endpoints
fn parse_tx_body<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, Response> {
    if !is_json(headers) {
        return Err(tx_reply(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Err("content type must be application/json".into()),
        ));
    }
    serde_json::from_slice(body)
        .map_err(|e| tx_reply(StatusCode::BAD_REQUEST, Err(format!("invalid transaction json: {}", e))))
}

/// Runs the admission off the async workers; it takes the chain lock
async fn finish_tx<F>(admit: F) -> Response
where
    F: FnOnce() -> Result<Hash, NodeError> + Send + 'static,
{
    match tokio::task::spawn_blocking(admit).await {
        Ok(Ok(hash)) => tx_reply(StatusCode::OK, Ok(hash)),
        Ok(Err(e)) => {
            let err = ApiError::from(e);
            tx_reply(err.status, Err(err.message))
        }
        Err(e) => tx_reply(StatusCode::INTERNAL_SERVER_ERROR, Err(format!("tx task failed: {}", e))),
    }
}

/// `POST /submit` and `POST /broadcast`: signed TxV1
pub(super) async fn submit_v1(State(state): State<RpcState>, headers: HeaderMap, body: Bytes) -> Response {
    let tx: SignedTx = match parse_tx_body(&headers, &body) {
        Ok(tx) => tx,
        Err(resp) => return resp,
    };
    let node = state.node.clone();
    finish_tx(move || node.submit_v1_tx(tx)).await
}

/// `POST /submitTx`: legacy ECDSA transfer
pub(super) async fn submit_legacy(State(state): State<RpcState>, headers: HeaderMap, body: Bytes) -> Response {
    let tx: LegacyTx = match parse_tx_body(&headers, &body) {
        Ok(tx) => tx,
        Err(resp) => return resp,
    };
    let node = state.node.clone();
    finish_tx(move || node.submit_legacy_tx(tx)).await
}

pub(super) async fn account(
    State(state): State<RpcState>,
    Path(addr): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    let address: Address = addr
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid address: {}", e)))?;
    let account = state.node.account(&address).unwrap_or_default();
    Ok(Json(AccountResponse {
        address: address.to_hex(),
        balance: account.balance,
        nonce: account.nonce,
    }))
}

/// Pending transaction as listed on `/mempool`
#[derive(Debug, Serialize)]
pub struct PendingTx {
    pub hash: Hash,
    pub from: String,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
}

impl From<&Transaction> for PendingTx {
    fn from(tx: &Transaction) -> Self {
        Self {
            hash: tx.hash(),
            from: tx.from_label(),
            to: tx.recipient(),
            amount: tx.amount(),
            fee: tx.fee(),
            nonce: tx.nonce(),
        }
    }
}

pub(super) async fn mempool(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let pending: Vec<PendingTx> = state.node.mempool().pending().iter().map(PendingTx::from).collect();
    Json(json!({ "count": pending.len(), "txs": pending }))
}

pub(super) async fn tx_receipt(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
) -> Result<Json<Receipt>, ApiError> {
    let hash = Hash::from_hex(hash.trim_start_matches("0x"))
        .map_err(|_| ApiError::bad_request("hash must be 32 bytes of hex"))?;
    state
        .node
        .receipt(&hash)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("transaction {} not found", hash)))
}

#[derive(Debug, Deserialize)]
pub(super) struct FeeQuery {
    bytes: Option<u64>,
}

pub(super) async fn estimate_fee(Query(q): Query<FeeQuery>) -> Json<serde_json::Value> {
    let bytes = q.bytes.unwrap_or(DEFAULT_TX_BYTES);
    Json(json!({ "bytes": bytes, "fee": estimate_fee_for(bytes) }))
}

#[derive(Debug, Deserialize)]
pub(super) struct RangeQuery {
    from: Option<u64>,
    limit: Option<u32>,
}

pub(super) async fn blocks_range(
    State(state): State<RpcState>,
    Query(q): Query<RangeQuery>,
) -> Json<BlocksRangeResponse> {
    let from = q.from.unwrap_or(0);
    let limit = q.limit.unwrap_or(MAX_BLOCKS_PER_BATCH).min(MAX_BLOCKS_PER_BATCH);
    let blocks = state.node.blocks_range(from, limit);
    let to = blocks.last().map_or(from, |b| b.height);
    Json(BlocksRangeResponse {
        from,
        to,
        blocks,
        tip: state.node.height(),
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct RecentQuery {
    count: Option<usize>,
}

pub(super) async fn recent_blocks(
    State(state): State<RpcState>,
    Query(q): Query<RecentQuery>,
) -> Json<Vec<Block>> {
    let count = q.count.unwrap_or(10).min(MAX_BLOCKS_PER_BATCH as usize);
    Json(state.node.recent_blocks(count))
}

pub(super) async fn block_at(
    State(state): State<RpcState>,
    Path(height): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    state
        .node
        .block(height)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("block {} not found", height)))
}

pub(super) async fn genesis_hash(State(state): State<RpcState>) -> Json<serde_json::Value> {
    Json(json!({ "genesisHash": state.node.genesis_hash() }))
}

pub(super) async fn version(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let network = &state.node.config().network;
    Json(json!({
        "version": NODE_VERSION,
        "network": network.name,
        "chainId": network.chain_id,
        "networkId": network.network_id,
        "protocolVersion": network.protocol_version,
    }))
}

pub(super) async fn healthz(State(state): State<RpcState>) -> Response {
    let halted = state.node.is_halted();
    let status = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({ "ok": !halted, "height": state.node.height() });
    (status, Json(body)).into_response()
}

pub(super) async fn peers(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let (connected, known): (Vec<PeerSummary>, Vec<String>) = match &state.network {
        Some(net) => (net.peer_summaries().await, net.known_peers()),
        None => (Vec::new(), Vec::new()),
    };
    Json(json!({ "connected": connected, "known": known }))
}

pub(super) async fn metrics(State(state): State<RpcState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.node.metrics().render(),
    )
}

pub(super) async fn watchdogs(State(state): State<RpcState>) -> Json<Vec<WatchdogSnapshot>> {
    Json(state.node.watchdog().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_is_linear_per_kib() {
        assert_eq!(estimate_fee_for(0), 100);
        assert_eq!(estimate_fee_for(256), 100);
        assert_eq!(estimate_fee_for(1024), 100);
        assert_eq!(estimate_fee_for(1025), 200);
        assert_eq!(estimate_fee_for(10 * 1024), 1000);
    }
}
