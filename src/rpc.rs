//! JSON RPC facade over the node core.
//!
//! A thin read/write surface for wallets and explorers: chain info and
//! blocks, transactions, pool state reconciliation, transaction submission
//! and decoy sampling. All heavy lifting stays in the engine; handlers only
//! translate between JSON and core calls.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::blockchain::Core;
use crate::codec;
use crate::p2p::node::NetNodeHandle;
use crate::pool::AddTxResult;
use crate::protocol::ProtocolHandler;
use crate::Hash;

/// Shared state behind the router.
pub struct RpcState {
    pub core: Arc<Core>,
    pub handler: Arc<ProtocolHandler>,
    pub node: Option<NetNodeHandle>,
}

#[derive(Serialize)]
struct InfoResponse {
    height: u64,
    top_block_hash: String,
    difficulty: u64,
    cumulative_difficulty: u64,
    coins_in_circulation: u64,
    full_deposit_amount: u64,
    tx_pool_size: usize,
    alternative_blocks: usize,
    incoming_connections: usize,
    outgoing_connections: usize,
}

#[derive(Deserialize)]
struct GetBlocksRequest {
    #[serde(default)]
    heights: Vec<u64>,
    #[serde(default)]
    hashes: Vec<String>,
    #[serde(default)]
    timestamp_begin: Option<u64>,
    #[serde(default)]
    timestamp_end: Option<u64>,
}

#[derive(Serialize)]
struct BlockSummary {
    hash: String,
    height: u64,
    timestamp: u64,
    major_version: u8,
    transaction_count: usize,
    difficulty: u64,
    already_generated_coins: u64,
}

#[derive(Serialize)]
struct BlockResponse {
    summary: BlockSummary,
    block_blob: String,
}

#[derive(Serialize)]
struct TransactionResponse {
    hash: String,
    block_height: Option<u64>,
    in_pool: bool,
    tx_blob: String,
}

#[derive(Deserialize)]
struct PoolStateRequest {
    #[serde(default)]
    known_tx_hashes: Vec<String>,
    known_top: Option<String>,
}

#[derive(Serialize)]
struct PoolStateResponse {
    is_actual: bool,
    new_txs: Vec<String>,
    removed: Vec<String>,
}

#[derive(Deserialize)]
struct SendTransactionRequest {
    tx_blob: String,
}

#[derive(Serialize)]
struct SendTransactionResponse {
    status: String,
    hash: Option<String>,
}

#[derive(Deserialize)]
struct RandomOutsRequest {
    amounts: Vec<u64>,
    count: usize,
}

#[derive(Serialize)]
struct RandomOutsResponse {
    outs: Vec<RandomOutsForAmount>,
}

#[derive(Serialize)]
struct RandomOutsForAmount {
    amount: u64,
    outs: Vec<(u32, String)>,
}

fn parse_hash(hex_str: &str) -> Option<Hash> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// Build the router.
pub fn router(state: Arc<RpcState>) -> Router {
    Router::new()
        .route("/getinfo", get(get_info))
        .route("/getblocks", post(get_blocks))
        .route("/getblock/{hash}", get(get_block))
        .route("/gettransaction/{hash}", get(get_transaction))
        .route("/getpoolstate", post(get_pool_state))
        .route("/sendtransaction", post(send_transaction))
        .route("/getrandomouts", post(get_random_outs))
        .with_state(state)
}

/// Serve the RPC surface until the process exits.
pub async fn serve(state: Arc<RpcState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "rpc listening");
    axum::serve(listener, router(state)).await
}

async fn get_info(State(state): State<Arc<RpcState>>) -> Json<InfoResponse> {
    let (incoming, outgoing) = match &state.node {
        Some(node) => node.connection_count().await.unwrap_or((0, 0)),
        None => (0, 0),
    };
    let response = state.core.with_chain(|chain| {
        let (top, top_height) = chain.top_info();
        InfoResponse {
            height: chain.height(),
            top_block_hash: hex::encode(top),
            difficulty: chain.difficulty_for_next_block(),
            cumulative_difficulty: chain
                .block_by_height(top_height)
                .map(|e| e.cumulative_difficulty)
                .unwrap_or(0),
            coins_in_circulation: chain.coins_in_circulation(),
            full_deposit_amount: chain.full_deposit_amount(),
            tx_pool_size: 0,
            alternative_blocks: chain.alternative_block_count(),
            incoming_connections: incoming,
            outgoing_connections: outgoing,
        }
    });
    let mut response = response;
    response.tx_pool_size = state.core.with_pool(|pool| pool.len());
    Json(response)
}

fn summarize(chain: &crate::blockchain::Blockchain, height: u64) -> Option<BlockResponse> {
    let entry = chain.block_by_height(height)?;
    let hash = entry.block.hash();
    Some(BlockResponse {
        summary: BlockSummary {
            hash: hex::encode(hash),
            height: entry.height,
            timestamp: entry.block.timestamp,
            major_version: entry.block.major_version,
            transaction_count: entry.transactions.len(),
            difficulty: chain.block_difficulty(height),
            already_generated_coins: entry.already_generated_coins,
        },
        block_blob: hex::encode(
            codec::to_binary(&entry.block)
                .expect("stored blocks are bounded by the cumulative size cap"),
        ),
    })
}

async fn get_blocks(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<GetBlocksRequest>,
) -> Result<Json<Vec<BlockResponse>>, StatusCode> {
    let blocks = state.core.with_chain(|chain| {
        let mut result = Vec::new();
        for height in &request.heights {
            if let Some(block) = summarize(chain, *height) {
                result.push(block);
            }
        }
        for hash_hex in &request.hashes {
            if let Some(hash) = parse_hash(hash_hex) {
                if let Some(height) = chain.block_height(&hash) {
                    if let Some(block) = summarize(chain, height) {
                        result.push(block);
                    }
                }
            }
        }
        if let (Some(begin), Some(end)) = (request.timestamp_begin, request.timestamp_end) {
            for hash in chain.blocks_by_timestamp(begin, end, 100) {
                if let Some(height) = chain.block_height(&hash) {
                    if let Some(block) = summarize(chain, height) {
                        result.push(block);
                    }
                }
            }
        }
        result
    });
    Ok(Json(blocks))
}

async fn get_block(
    State(state): State<Arc<RpcState>>,
    Path(hash_hex): Path<String>,
) -> Result<Json<BlockResponse>, StatusCode> {
    let hash = parse_hash(&hash_hex).ok_or(StatusCode::BAD_REQUEST)?;
    state
        .core
        .with_chain(|chain| {
            chain
                .block_height(&hash)
                .and_then(|height| summarize(chain, height))
        })
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_transaction(
    State(state): State<Arc<RpcState>>,
    Path(hash_hex): Path<String>,
) -> Result<Json<TransactionResponse>, StatusCode> {
    let hash = parse_hash(&hash_hex).ok_or(StatusCode::BAD_REQUEST)?;

    let chain_hit = state.core.with_chain(|chain| {
        chain.transaction_by_hash(&hash).map(|entry| {
            (
                chain.transaction_block_height(&hash),
                hex::encode(
                    codec::to_binary(&entry.tx)
                        .expect("stored transactions are bounded by the transaction size cap"),
                ),
            )
        })
    });
    if let Some((height, blob)) = chain_hit {
        return Ok(Json(TransactionResponse {
            hash: hash_hex,
            block_height: height,
            in_pool: false,
            tx_blob: blob,
        }));
    }

    let pool_hit = state
        .core
        .with_pool(|pool| pool.get_tx(&hash).map(|tx| codec::to_binary(tx).map(hex::encode)));
    match pool_hit {
        Some(Ok(blob)) => Ok(Json(TransactionResponse {
            hash: hash_hex,
            block_height: None,
            in_pool: true,
            tx_blob: blob,
        })),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn get_pool_state(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<PoolStateRequest>,
) -> Json<PoolStateResponse> {
    let known: Vec<Hash> = request
        .known_tx_hashes
        .iter()
        .filter_map(|h| parse_hash(h))
        .collect();
    let is_actual = match request.known_top.as_deref().and_then(parse_hash) {
        Some(top) => state.core.sync_data().1 == top,
        None => false,
    };
    let (new_txs, removed) = state.core.with_pool(|pool| pool.get_difference(&known));
    Json(PoolStateResponse {
        is_actual,
        new_txs: new_txs.iter().map(hex::encode).collect(),
        removed: removed.iter().map(hex::encode).collect(),
    })
}

async fn send_transaction(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<SendTransactionRequest>,
) -> Result<Json<SendTransactionResponse>, StatusCode> {
    let bytes = hex::decode(&request.tx_blob).map_err(|_| StatusCode::BAD_REQUEST)?;
    let tx: crate::blockchain::block::Transaction =
        codec::from_binary(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;
    let hash = tx.hash();

    match state.core.handle_incoming_transaction(tx.clone(), false) {
        AddTxResult::Added => {
            if let Some(node) = &state.node {
                let action = state.handler.transaction_relay_action(tx);
                let _ = node.execute(vec![action]).await;
            }
            Ok(Json(SendTransactionResponse {
                status: "OK".into(),
                hash: Some(hex::encode(hash)),
            }))
        }
        AddTxResult::AlreadyPresent => Ok(Json(SendTransactionResponse {
            status: "ALREADY_PRESENT".into(),
            hash: Some(hex::encode(hash)),
        })),
        AddTxResult::Invalid(reason) => Ok(Json(SendTransactionResponse {
            status: format!("REJECTED: {reason:?}"),
            hash: None,
        })),
    }
}

async fn get_random_outs(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<RandomOutsRequest>,
) -> Json<RandomOutsResponse> {
    let outs = state.core.with_chain(|chain| {
        request
            .amounts
            .iter()
            .map(|&amount| RandomOutsForAmount {
                amount,
                outs: chain
                    .random_outputs_for_amount(amount, request.count)
                    .into_iter()
                    .map(|(index, key)| (index, hex::encode(key.0)))
                    .collect(),
            })
            .collect()
    });
    Json(RandomOutsResponse { outs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::Checkpoints;
    use crate::currency::CurrencyBuilder;
    use crate::observers::EventBus;

    fn make_state() -> Arc<RpcState> {
        let currency = CurrencyBuilder::new().build();
        let core =
            Arc::new(Core::new(currency, Checkpoints::new(), EventBus::new(), None).unwrap());
        let handler = Arc::new(ProtocolHandler::new(core.clone()));
        Arc::new(RpcState {
            core,
            handler,
            node: None,
        })
    }

    #[tokio::test]
    async fn info_reports_genesis() {
        let state = make_state();
        let Json(info) = get_info(State(state.clone())).await;
        assert_eq!(info.height, 1);
        assert_eq!(info.tx_pool_size, 0);
        assert_eq!(
            info.top_block_hash,
            hex::encode(state.core.currency().genesis_block_hash())
        );
    }

    #[tokio::test]
    async fn get_block_by_hash() {
        let state = make_state();
        let genesis = hex::encode(state.core.currency().genesis_block_hash());
        let result = get_block(State(state), Path(genesis.clone())).await.unwrap();
        assert_eq!(result.0.summary.height, 0);
        assert_eq!(result.0.summary.hash, genesis);
    }

    #[tokio::test]
    async fn get_block_unknown_is_404() {
        let state = make_state();
        let missing = hex::encode([0xABu8; 32]);
        assert!(matches!(
            get_block(State(state), Path(missing)).await,
            Err(StatusCode::NOT_FOUND)
        ));
    }

    #[tokio::test]
    async fn pool_state_reports_actual_top() {
        let state = make_state();
        let top = hex::encode(state.core.sync_data().1);
        let Json(response) = get_pool_state(
            State(state),
            Json(PoolStateRequest {
                known_tx_hashes: vec![hex::encode([1u8; 32])],
                known_top: Some(top),
            }),
        )
        .await;
        assert!(response.is_actual);
        assert_eq!(response.removed.len(), 1);
        assert!(response.new_txs.is_empty());
    }

    #[tokio::test]
    async fn send_malformed_transaction_is_400() {
        let state = make_state();
        let result = send_transaction(
            State(state),
            Json(SendTransactionRequest {
                tx_blob: "zz-not-hex".into(),
            }),
        )
        .await;
        assert!(matches!(result, Err(StatusCode::BAD_REQUEST)));
    }
}
