//! RPC HTTP server
//!
//! Axum router over the node: chain queries, farmer and timelord
//! submissions, transaction ingest, metrics and the ETH shim.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::eth::handle_eth;
use super::handlers::*;
use crate::consensus::ValidationError;
use crate::mempool::MempoolError;
use crate::node::{Node, NodeError};
use crate::p2p::Network;

/// Largest accepted transaction body
pub const MAX_TX_BODY_BYTES: usize = 64 * 1024;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct RpcState {
    pub node: Arc<Node>,
    pub network: Option<Network>,
}

impl RpcState {
    pub fn new(node: Arc<Node>, network: Option<Network>) -> Self {
        Self { node, network }
    }
}

/// Error body `{error}` with a status derived from its cause
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        let status = match &e {
            NodeError::Validation(_)
            | NodeError::Tx(_)
            | NodeError::Mempool(MempoolError::Duplicate | MempoolError::Rejected(_))
            | NodeError::VdfDisabled
            | NodeError::UnknownFork => StatusCode::BAD_REQUEST,
            NodeError::Mempool(MempoolError::Full(_)) | NodeError::Halted => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Storage(_) | NodeError::Config(_) | NodeError::GenesisMismatch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        NodeError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Build the router; exposed for in-process tests
pub fn router(state: RpcState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let tx_routes = Router::new()
        .route("/submit", post(submit_v1).fallback(post_only))
        .route("/broadcast", post(submit_v1).fallback(post_only))
        .route("/submitTx", post(submit_legacy).fallback(post_only))
        .layer(DefaultBodyLimit::max(MAX_TX_BODY_BYTES));

    Router::new()
        .route("/", get(banner))
        .route("/chainTip", get(chain_tip))
        .route("/challenge", get(challenge))
        .route("/submitBlock", post(submit_block))
        .route("/vdf/update", post(vdf_update))
        .route("/balance/:addr", get(account))
        .route("/account/:addr", get(account))
        .route("/mempool", get(mempool))
        .route("/tx/:hash", get(tx_receipt))
        .route("/estimateFee", get(estimate_fee))
        .route("/blocks/range", get(blocks_range))
        .route("/blocks/recent", get(recent_blocks))
        .route("/block/:height", get(block_at))
        .route("/genesisHash", get(genesis_hash))
        .route("/version", get(version))
        .route("/healthz", get(healthz))
        .route("/peers", get(peers))
        .route("/metrics", get(metrics))
        .route("/metrics/watchdogs", get(watchdogs))
        .route("/eth", post(handle_eth))
        .merge(tx_routes)
        .layer(cors)
        .with_state(state)
}

/// Serve until the listener fails
pub async fn start_rpc_server(state: RpcState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[rpc] listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

/// 405 for non-POST calls to the transaction endpoints
async fn post_only() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(serde_json::json!({ "ok": false, "error": "method not allowed, use POST" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;
    use crate::ledger::LegacyTx;
    use crate::node::test_support::{farm, funded_key, test_config};
    use crate::rpc::types::{AccountResponse, BlocksRangeResponse, ChainTipResponse, SubmitTxResponse};
    use serde_json::{json, Value};

    async fn spawn(dir: &std::path::Path) -> (String, Arc<Node>) {
        let node = Arc::new(Node::open(test_config(dir, false)).unwrap());
        let app = router(RpcState::new(node.clone(), None));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{}", addr), node)
    }

    #[tokio::test]
    async fn test_chain_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (url, node) = spawn(dir.path()).await;
        farm(&node, Address([5; 20])).unwrap();
        let client = reqwest::Client::new();

        let tip: ChainTipResponse = client.get(format!("{}/chainTip", url)).send().await.unwrap().json().await.unwrap();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.hash, tip.block_hash);

        let range: BlocksRangeResponse = client
            .get(format!("{}/blocks/range?from=0&limit=10", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(range.blocks.len(), 2);
        assert_eq!((range.to, range.tip), (1, 1));

        let resp = client.get(format!("{}/block/99", url)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client.get(format!("{}/account/not-an-address", url)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let bech = Address([5; 20]).to_bech32();
        let acct: AccountResponse = client
            .get(format!("{}/balance/{}", url, bech))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(acct.address, Address([5; 20]).to_hex());
        assert_eq!(acct.balance, crate::node::block_reward() as i64);
    }

    #[tokio::test]
    async fn test_tx_endpoint_contract() {
        let dir = tempfile::tempdir().unwrap();
        let (url, node) = spawn(dir.path()).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/submit", url)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[header::ALLOW], "POST");

        let resp = client
            .post(format!("{}/submit", url))
            .header(header::CONTENT_TYPE, "text/plain")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let resp = client
            .post(format!("{}/broadcast", url))
            .header(header::CONTENT_TYPE, "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: SubmitTxResponse = resp.json().await.unwrap();
        assert!(!body.ok && body.error.is_some());

        let tx = LegacyTx::signed(&funded_key(), Address([6; 20]), 1_000, 100, 0).unwrap();
        let body: SubmitTxResponse = client
            .post(format!("{}/submitTx", url))
            .json(&tx)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.ok);
        assert_eq!(node.mempool().len(), 1);

        // same nonce again is a duplicate
        let resp = client.post(format!("{}/submitTx", url)).json(&tx).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_tx_admission_runs_beside_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (url, node) = spawn(dir.path()).await;
        let client = reqwest::Client::new();

        for nonce in 0..5 {
            let tx = LegacyTx::signed(&funded_key(), Address([6; 20]), 1_000, 100, nonce).unwrap();
            let submit = client.post(format!("{}/submitTx", url)).json(&tx).send();
            let tip = client.get(format!("{}/chainTip", url)).send();
            let (submit, tip) = tokio::join!(submit, tip);
            let body: SubmitTxResponse = submit.unwrap().json().await.unwrap();
            assert!(body.ok, "nonce {}: {:?}", nonce, body.error);
            assert_eq!(tip.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(node.mempool().len(), 5);

        let stale = LegacyTx::signed(&funded_key(), Address([6; 20]), 1_000, 100, 2).unwrap();
        let resp = client.post(format!("{}/submitTx", url)).json(&stale).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_eth_shim() {
        let dir = tempfile::tempdir().unwrap();
        let (url, node) = spawn(dir.path()).await;
        let client = reqwest::Client::new();
        let call = |method: &str, params: Value| {
            client
                .post(format!("{}/eth", url))
                .json(&json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1}))
                .send()
        };

        let v: Value = call("eth_chainId", json!([])).await.unwrap().json().await.unwrap();
        assert_eq!(v["result"], format!("0x{:x}", node.config().network.network_id));

        let funded = funded_key().public_key().legacy_address();
        let v: Value = call("eth_getBalance", json!([funded.to_hex(), "latest"]))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // 1_000_000 base units = 10^16 wei
        assert_eq!(v["result"], "0x2386f26fc10000");

        let resp = call("eth_mine", json!([])).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v: Value = resp.json().await.unwrap();
        assert_eq!(v["error"]["code"], -32601);

        let v: Value = call("eth_getBalance", json!([])).await.unwrap().json().await.unwrap();
        assert_eq!(v["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_submit_block_checks_pubkey() {
        let dir = tempfile::tempdir().unwrap();
        let (url, node) = spawn(dir.path()).await;
        let snap = node.challenge();
        let key = crate::crypto::PrivateKey::from_bytes(&[7; 32]).unwrap().public_key();
        let other = crate::crypto::PrivateKey::from_bytes(&[8; 32]).unwrap().public_key();
        let proof = crate::pospace::Proof::from_entry(snap.challenge, key, 0);
        let client = reqwest::Client::new();

        let mut body = json!({
            "proof": proof,
            "farmer_addr": Address([5; 20]),
            "farmer_pubkey_hex": other.to_hex(),
        });
        let resp = client.post(format!("{}/submitBlock", url)).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        body["farmer_pubkey_hex"] = json!(key.to_hex());
        let resp = client.post(format!("{}/submitBlock", url)).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(node.height(), 1);
    }
}
