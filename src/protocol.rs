//! Chain protocol handler: interprets relay and sync commands against the
//! core, drives per-connection sync state, and produces the notifications
//! the P2P node sends out.
//!
//! Handlers are pure with respect to the transport: they take a connection
//! context and a decoded payload and return a list of actions (send, relay,
//! drop) for the node loop to execute.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockchain::block::{Block, Transaction};
use crate::blockchain::Core;
use crate::codec;
use crate::constants;
use crate::p2p::messages::*;
use crate::p2p::{ConnectionId, PeerId};
use crate::pool::AddTxResult;
use crate::Hash;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    BeforeHandshake,
    Synchronizing,
    Idle,
    Normal,
    SyncRequired,
    PoolSyncRequired,
    Shutdown,
}

/// Per-connection protocol state, owned by the node loop.
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub peer_id: PeerId,
    pub remote_addr: SocketAddr,
    pub is_income: bool,
    pub version: u8,
    pub state: PeerState,
    pub remote_height: u64,
    pub last_response_height: u64,
    /// Block ids learned from a chain entry, still to be requested.
    pub needed_objects: Vec<Hash>,
    /// Block ids currently in flight via a get-objects request.
    pub requested_objects: HashSet<Hash>,
    /// Lite blocks waiting for transaction bodies.
    pub pending_lite_blocks: Vec<NewLiteBlockNotification>,
}

impl ConnectionContext {
    pub fn new(
        connection_id: ConnectionId,
        peer_id: PeerId,
        remote_addr: SocketAddr,
        is_income: bool,
        version: u8,
    ) -> Self {
        ConnectionContext {
            connection_id,
            peer_id,
            remote_addr,
            is_income,
            version,
            state: PeerState::BeforeHandshake,
            remote_height: 0,
            last_response_height: 0,
            needed_objects: Vec::new(),
            requested_objects: HashSet::new(),
            pending_lite_blocks: Vec::new(),
        }
    }
}

/// An encoded notification ready for a Levin frame.
#[derive(Clone, Debug)]
pub struct WireNotification {
    pub command: u32,
    pub payload: Vec<u8>,
}

impl WireNotification {
    fn encode<T: serde::Serialize>(command: u32, message: &T) -> Self {
        // Bulk responses (get-objects windows) are the one payload class not
        // statically bounded below the codec limit. An encode failure is
        // logged and sent as an empty payload, which the peer discards as a
        // malformed frame.
        let payload = match codec::to_binary(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(command, error = %e, "failed to encode notification payload");
                Vec::new()
            }
        };
        WireNotification { command, payload }
    }
}

/// What the node loop should do after a handler ran.
#[derive(Debug)]
pub enum ProtocolAction {
    /// Send one notification to a specific connection.
    Notify {
        to: ConnectionId,
        message: WireNotification,
    },
    /// Fan a notification out to every synced connection except `exclude`.
    /// When `lite` is present, connections at or above the lite-block
    /// protocol version receive it instead of `message`.
    Relay {
        message: WireNotification,
        lite: Option<WireNotification>,
        exclude: Option<ConnectionId>,
    },
    /// Drop the connection; `penalize` raises its fail score.
    Drop {
        connection: ConnectionId,
        penalize: bool,
    },
}

/// Handler errors: a malformed payload is peer misbehavior.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed payload for command {command}: {error}")]
    Malformed { command: u32, error: String },
    #[error("unknown command {0}")]
    UnknownCommand(u32),
}

fn decode<T: serde::de::DeserializeOwned>(command: u32, payload: &[u8]) -> Result<T, HandlerError> {
    codec::from_binary(payload).map_err(|e| HandlerError::Malformed {
        command,
        error: e.to_string(),
    })
}

/// The protocol engine shared by every connection.
pub struct ProtocolHandler {
    core: Arc<Core>,
    /// Highest chain height any peer has claimed.
    observed_height: AtomicU64,
}

impl ProtocolHandler {
    pub fn new(core: Arc<Core>) -> Self {
        ProtocolHandler {
            core,
            observed_height: AtomicU64::new(0),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn observed_height(&self) -> u64 {
        self.observed_height.load(Ordering::Relaxed)
    }

    fn update_observed_height(&self, peer_height: u64) {
        self.observed_height.fetch_max(peer_height, Ordering::Relaxed);
    }

    /// Our sync summary for handshakes and timed syncs.
    pub fn sync_data(&self) -> CoreSyncData {
        let (height, top_id) = self.core.sync_data();
        CoreSyncData {
            current_height: height,
            top_id,
        }
    }

    /// Digest a peer's sync data (handshake or timed sync). Decides whether
    /// the connection enters normal operation or chain sync.
    pub fn process_payload_sync_data(
        &self,
        data: CoreSyncData,
        ctx: &mut ConnectionContext,
        is_initial: bool,
    ) -> Vec<ProtocolAction> {
        if ctx.state == PeerState::BeforeHandshake && !is_initial {
            return Vec::new();
        }
        self.update_observed_height(data.current_height);
        ctx.remote_height = data.current_height;

        let (our_height, our_top) = self.core.sync_data();
        if data.top_id == our_top {
            tracing::debug!(peer = ctx.peer_id, "peer is at our top, entering normal state");
            ctx.state = PeerState::Normal;
            if is_initial {
                return self.request_tx_pool_actions(ctx);
            }
            return Vec::new();
        }

        if data.current_height > our_height {
            let behind = data.current_height - our_height;
            tracing::info!(
                peer = ctx.peer_id,
                behind,
                remote = data.current_height,
                local = our_height,
                "peer reports a higher chain, synchronizing"
            );
            ctx.state = PeerState::SyncRequired;
            return self.start_sync(ctx);
        }

        ctx.state = PeerState::Normal;
        Vec::new()
    }

    /// Begin catch-up: probe the peer with our sparse chain locator.
    pub fn start_sync(&self, ctx: &mut ConnectionContext) -> Vec<ProtocolAction> {
        if ctx.state != PeerState::SyncRequired && ctx.state != PeerState::Synchronizing {
            return Vec::new();
        }
        ctx.state = PeerState::Synchronizing;
        let locator = self.core.with_chain(|chain| chain.build_sparse_chain());
        vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(
                NOTIFY_REQUEST_CHAIN,
                &RequestChain { block_ids: locator },
            ),
        }]
    }

    fn request_tx_pool_actions(&self, ctx: &mut ConnectionContext) -> Vec<ProtocolAction> {
        let known = self.core.with_pool(|pool| pool.tx_hashes());
        vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(NOTIFY_REQUEST_TX_POOL, &RequestTxPool { txs: known }),
        }]
    }

    /// Dispatch one chain-protocol notification.
    pub fn handle_command(
        &self,
        ctx: &mut ConnectionContext,
        command: u32,
        payload: &[u8],
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        match command {
            NOTIFY_NEW_BLOCK => self.handle_new_block(ctx, decode(command, payload)?),
            NOTIFY_NEW_TRANSACTIONS => {
                self.handle_new_transactions(ctx, decode(command, payload)?)
            }
            NOTIFY_REQUEST_GET_OBJECTS => {
                self.handle_request_get_objects(ctx, decode(command, payload)?)
            }
            NOTIFY_RESPONSE_GET_OBJECTS => {
                self.handle_response_get_objects(ctx, decode(command, payload)?)
            }
            NOTIFY_REQUEST_CHAIN => self.handle_request_chain(ctx, decode(command, payload)?),
            NOTIFY_RESPONSE_CHAIN_ENTRY => {
                self.handle_response_chain_entry(ctx, decode(command, payload)?)
            }
            NOTIFY_REQUEST_TX_POOL => self.handle_request_tx_pool(ctx, decode(command, payload)?),
            NOTIFY_NEW_LITE_BLOCK => self.handle_new_lite_block(ctx, decode(command, payload)?),
            NOTIFY_MISSING_TXS => self.handle_missing_txs(ctx, decode(command, payload)?),
            other => Err(HandlerError::UnknownCommand(other)),
        }
    }

    fn handle_new_block(
        &self,
        ctx: &mut ConnectionContext,
        arg: NewBlockNotification,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        self.update_observed_height(arg.current_blockchain_height);
        ctx.remote_height = arg.current_blockchain_height;
        if ctx.state != PeerState::Normal && ctx.state != PeerState::Synchronizing {
            return Ok(Vec::new());
        }

        // Pool the carried bodies so the engine can materialize the block.
        for tx in &arg.transactions {
            self.core.handle_incoming_transaction(tx.clone(), true);
        }

        let bvc = self.core.handle_incoming_block(arg.block.clone());
        if bvc.verification_failed {
            tracing::info!(peer = ctx.peer_id, "peer sent an invalid block, dropping");
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }
        if bvc.added_to_main_chain {
            let relayed = NewBlockNotification {
                block: arg.block.clone(),
                transactions: arg.transactions,
                current_blockchain_height: self.core.sync_data().0,
                hop: arg.hop + 1,
            };
            return Ok(vec![self.block_relay_action(relayed, Some(ctx.connection_id))]);
        }
        if bvc.marked_as_orphaned {
            tracing::info!(peer = ctx.peer_id, "received an orphan block, requesting chain");
            ctx.state = PeerState::SyncRequired;
            return Ok(self.start_sync(ctx));
        }
        Ok(Vec::new())
    }

    fn handle_new_transactions(
        &self,
        ctx: &mut ConnectionContext,
        arg: NewTransactionsNotification,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        if ctx.state != PeerState::Normal {
            return Ok(Vec::new());
        }

        let mut accepted = Vec::new();
        for tx in arg.transactions {
            match self.core.handle_incoming_transaction(tx.clone(), false) {
                AddTxResult::Added => accepted.push(tx),
                AddTxResult::AlreadyPresent => {}
                AddTxResult::Invalid(reason) => {
                    tracing::debug!(peer = ctx.peer_id, ?reason, "transaction rejected");
                }
            }
        }

        // Bodies may satisfy a parked lite block.
        let mut actions = self.retry_pending_lite_blocks(ctx);
        if !accepted.is_empty() {
            actions.push(ProtocolAction::Relay {
                message: WireNotification::encode(
                    NOTIFY_NEW_TRANSACTIONS,
                    &NewTransactionsNotification {
                        transactions: accepted,
                    },
                ),
                lite: None,
                exclude: Some(ctx.connection_id),
            });
        }
        Ok(actions)
    }

    fn handle_request_get_objects(
        &self,
        ctx: &mut ConnectionContext,
        arg: RequestGetObjects,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        if arg.blocks.len() > constants::COMMAND_GET_OBJECTS_MAX_COUNT
            || arg.txs.len() > constants::COMMAND_GET_OBJECTS_MAX_COUNT
        {
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }
        let response = self.core.with_chain(|chain| {
            let mut missed = Vec::new();
            let blocks = chain.get_blocks_by_hash(&arg.blocks, &mut missed);
            let mut txs = Vec::new();
            for hash in &arg.txs {
                match chain.transaction_by_hash(hash) {
                    Some(entry) => txs.push(entry.tx.clone()),
                    None => missed.push(*hash),
                }
            }
            ResponseGetObjects {
                blocks,
                txs,
                missed_ids: missed,
                current_blockchain_height: chain.height(),
            }
        });
        Ok(vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(NOTIFY_RESPONSE_GET_OBJECTS, &response),
        }])
    }

    fn handle_response_get_objects(
        &self,
        ctx: &mut ConnectionContext,
        arg: ResponseGetObjects,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        self.update_observed_height(arg.current_blockchain_height);
        ctx.remote_height = arg.current_blockchain_height;

        for (block, transactions) in arg.blocks {
            let id = block.hash();
            if !ctx.requested_objects.remove(&id) {
                tracing::info!(
                    peer = ctx.peer_id,
                    block = %hex::encode(&id[..8]),
                    "peer sent a block we did not ask for, dropping"
                );
                return Ok(vec![ProtocolAction::Drop {
                    connection: ctx.connection_id,
                    penalize: true,
                }]);
            }
            for tx in &transactions {
                self.core.handle_incoming_transaction(tx.clone(), true);
            }
            let bvc = self.core.handle_incoming_block(block);
            if bvc.verification_failed {
                return Ok(vec![ProtocolAction::Drop {
                    connection: ctx.connection_id,
                    penalize: true,
                }]);
            }
        }

        if !ctx.requested_objects.is_empty() {
            // Strictly in-order delivery is part of the contract.
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }

        if !ctx.needed_objects.is_empty() {
            return Ok(self.request_missing_objects(ctx));
        }
        let (our_height, _) = self.core.sync_data();
        if ctx.remote_height > our_height {
            ctx.state = PeerState::Synchronizing;
            return Ok(self.start_sync(ctx));
        }
        self.on_connection_synchronized(ctx)
    }

    fn on_connection_synchronized(
        &self,
        ctx: &mut ConnectionContext,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        tracing::info!(peer = ctx.peer_id, "connection synchronized");
        ctx.state = PeerState::PoolSyncRequired;
        let actions = self.request_tx_pool_actions(ctx);
        ctx.state = PeerState::Normal;
        Ok(actions)
    }

    /// Pull the next window of needed blocks.
    fn request_missing_objects(&self, ctx: &mut ConnectionContext) -> Vec<ProtocolAction> {
        let take = ctx
            .needed_objects
            .len()
            .min(constants::BLOCKS_SYNCHRONIZING_DEFAULT_COUNT);
        let window: Vec<Hash> = ctx.needed_objects.drain(..take).collect();
        ctx.requested_objects = window.iter().copied().collect();
        vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(
                NOTIFY_REQUEST_GET_OBJECTS,
                &RequestGetObjects {
                    blocks: window,
                    txs: Vec::new(),
                },
            ),
        }]
    }

    fn handle_request_chain(
        &self,
        ctx: &mut ConnectionContext,
        arg: RequestChain,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        if arg.block_ids.is_empty() {
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }
        let response = self.core.with_chain(|chain| {
            chain.handle_chain_request(
                &arg.block_ids,
                constants::BLOCKS_IDS_SYNCHRONIZING_DEFAULT_COUNT,
            )
        });
        match response {
            Some((total_height, start_height, block_ids)) => Ok(vec![ProtocolAction::Notify {
                to: ctx.connection_id,
                message: WireNotification::encode(
                    NOTIFY_RESPONSE_CHAIN_ENTRY,
                    &ResponseChainEntry {
                        start_height,
                        total_height,
                        block_ids,
                    },
                ),
            }]),
            None => {
                tracing::info!(
                    peer = ctx.peer_id,
                    "peer locator shares no common block, dropping"
                );
                Ok(vec![ProtocolAction::Drop {
                    connection: ctx.connection_id,
                    penalize: true,
                }])
            }
        }
    }

    fn handle_response_chain_entry(
        &self,
        ctx: &mut ConnectionContext,
        arg: ResponseChainEntry,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        if arg.block_ids.is_empty() {
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }
        self.update_observed_height(arg.total_height);
        ctx.remote_height = arg.total_height;
        ctx.last_response_height = arg.start_height + arg.block_ids.len() as u64 - 1;

        ctx.needed_objects = self.core.with_chain(|chain| {
            arg.block_ids
                .iter()
                .filter(|id| !chain.have_block(id))
                .copied()
                .collect()
        });
        if ctx.needed_objects.is_empty() {
            return self.on_connection_synchronized(ctx);
        }
        Ok(self.request_missing_objects(ctx))
    }

    fn handle_request_tx_pool(
        &self,
        ctx: &mut ConnectionContext,
        arg: RequestTxPool,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        let transactions: Vec<Transaction> = self.core.with_pool(|pool| {
            let (new_hashes, _) = pool.get_difference(&arg.txs);
            new_hashes
                .iter()
                .filter_map(|h| pool.get_tx(h).cloned())
                .collect()
        });
        if transactions.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(
                NOTIFY_NEW_TRANSACTIONS,
                &NewTransactionsNotification { transactions },
            ),
        }])
    }

    fn handle_new_lite_block(
        &self,
        ctx: &mut ConnectionContext,
        arg: NewLiteBlockNotification,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        self.update_observed_height(arg.current_blockchain_height);
        ctx.remote_height = arg.current_blockchain_height;
        if ctx.state != PeerState::Normal && ctx.state != PeerState::Synchronizing {
            return Ok(Vec::new());
        }

        let missing: Vec<Hash> = {
            let core = &self.core;
            arg.block
                .transaction_hashes
                .iter()
                .filter(|hash| {
                    !core.with_pool(|pool| pool.have_tx(hash))
                        && !core.with_chain(|chain| chain.have_transaction(hash))
                })
                .copied()
                .collect()
        };

        if !missing.is_empty() {
            tracing::debug!(
                peer = ctx.peer_id,
                missing = missing.len(),
                "lite block lacks bodies, requesting"
            );
            let block_hash = arg.block.hash();
            let height = self.core.sync_data().0;
            ctx.pending_lite_blocks.push(arg);
            return Ok(vec![ProtocolAction::Notify {
                to: ctx.connection_id,
                message: WireNotification::encode(
                    NOTIFY_MISSING_TXS,
                    &MissingTxsNotification {
                        block_hash,
                        current_blockchain_height: height,
                        missing_txs: missing,
                    },
                ),
            }]);
        }

        self.process_lite_block(ctx, arg)
    }

    fn process_lite_block(
        &self,
        ctx: &mut ConnectionContext,
        arg: NewLiteBlockNotification,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        let bvc = self.core.handle_incoming_block(arg.block.clone());
        if bvc.verification_failed {
            return Ok(vec![ProtocolAction::Drop {
                connection: ctx.connection_id,
                penalize: true,
            }]);
        }
        if bvc.added_to_main_chain {
            let relayed = NewLiteBlockNotification {
                block: arg.block,
                current_blockchain_height: self.core.sync_data().0,
                hop: arg.hop + 1,
            };
            return Ok(vec![self.lite_relay_action(relayed, Some(ctx.connection_id))]);
        }
        if bvc.marked_as_orphaned {
            ctx.state = PeerState::SyncRequired;
            return Ok(self.start_sync(ctx));
        }
        Ok(Vec::new())
    }

    /// Re-run parked lite blocks whose bodies may have arrived.
    fn retry_pending_lite_blocks(&self, ctx: &mut ConnectionContext) -> Vec<ProtocolAction> {
        let pending = std::mem::take(&mut ctx.pending_lite_blocks);
        let mut actions = Vec::new();
        for lite in pending {
            let still_missing = lite.block.transaction_hashes.iter().any(|hash| {
                !self.core.with_pool(|pool| pool.have_tx(hash))
                    && !self.core.with_chain(|chain| chain.have_transaction(hash))
            });
            if still_missing {
                ctx.pending_lite_blocks.push(lite);
                continue;
            }
            if let Ok(mut a) = self.process_lite_block(ctx, lite) {
                actions.append(&mut a);
            }
        }
        actions
    }

    fn handle_missing_txs(
        &self,
        ctx: &mut ConnectionContext,
        arg: MissingTxsNotification,
    ) -> Result<Vec<ProtocolAction>, HandlerError> {
        let transactions: Vec<Transaction> = {
            let mut found = Vec::with_capacity(arg.missing_txs.len());
            for hash in &arg.missing_txs {
                let tx = self
                    .core
                    .with_pool(|pool| pool.get_tx(hash).cloned())
                    .or_else(|| {
                        self.core
                            .with_chain(|chain| chain.transaction_by_hash(hash).map(|e| e.tx.clone()))
                    });
                match tx {
                    Some(tx) => found.push(tx),
                    None => {
                        tracing::info!(
                            peer = ctx.peer_id,
                            tx = %hex::encode(&hash[..8]),
                            "peer asked for a transaction we do not have"
                        );
                        return Ok(Vec::new());
                    }
                }
            }
            found
        };
        Ok(vec![ProtocolAction::Notify {
            to: ctx.connection_id,
            message: WireNotification::encode(
                NOTIFY_NEW_TRANSACTIONS,
                &NewTransactionsNotification { transactions },
            ),
        }])
    }

    /// Relay action for a locally produced or newly accepted block.
    pub fn block_relay_action(
        &self,
        notification: NewBlockNotification,
        exclude: Option<ConnectionId>,
    ) -> ProtocolAction {
        let lite = NewLiteBlockNotification {
            block: notification.block.clone(),
            current_blockchain_height: notification.current_blockchain_height,
            hop: notification.hop,
        };
        ProtocolAction::Relay {
            message: WireNotification::encode(NOTIFY_NEW_BLOCK, &notification),
            lite: Some(WireNotification::encode(NOTIFY_NEW_LITE_BLOCK, &lite)),
            exclude,
        }
    }

    fn lite_relay_action(
        &self,
        notification: NewLiteBlockNotification,
        exclude: Option<ConnectionId>,
    ) -> ProtocolAction {
        // Peers below the lite version need the bodies; resolve them from
        // the chain (the block was just accepted).
        let transactions: Vec<Transaction> = self.core.with_chain(|chain| {
            notification
                .block
                .transaction_hashes
                .iter()
                .filter_map(|h| chain.transaction_by_hash(h).map(|e| e.tx.clone()))
                .collect()
        });
        let full = NewBlockNotification {
            block: notification.block.clone(),
            transactions,
            current_blockchain_height: notification.current_blockchain_height,
            hop: notification.hop,
        };
        ProtocolAction::Relay {
            message: WireNotification::encode(NOTIFY_NEW_BLOCK, &full),
            lite: Some(WireNotification::encode(NOTIFY_NEW_LITE_BLOCK, &notification)),
            exclude,
        }
    }

    /// Relay a locally submitted transaction.
    pub fn transaction_relay_action(&self, tx: Transaction) -> ProtocolAction {
        ProtocolAction::Relay {
            message: WireNotification::encode(
                NOTIFY_NEW_TRANSACTIONS,
                &NewTransactionsNotification {
                    transactions: vec![tx],
                },
            ),
            lite: None,
            exclude: None,
        }
    }

    /// Relay a locally found block.
    pub fn local_block_relay(&self, block: Block) -> ProtocolAction {
        let transactions: Vec<Transaction> = self.core.with_chain(|chain| {
            block
                .transaction_hashes
                .iter()
                .filter_map(|h| chain.transaction_by_hash(h).map(|e| e.tx.clone()))
                .collect()
        });
        let height = self.core.sync_data().0;
        self.block_relay_action(
            NewBlockNotification {
                block,
                transactions,
                current_blockchain_height: height,
                hop: 0,
            },
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::Checkpoints;
    use crate::currency::CurrencyBuilder;
    use crate::observers::EventBus;

    fn make_handler() -> ProtocolHandler {
        let currency = CurrencyBuilder::new().build();
        let core = Core::new(currency, Checkpoints::new(), EventBus::new(), None).unwrap();
        ProtocolHandler::new(Arc::new(core))
    }

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(1, 42, "10.0.0.1:16000".parse().unwrap(), true, 3)
    }

    #[test]
    fn sync_data_reports_genesis() {
        let handler = make_handler();
        let data = handler.sync_data();
        assert_eq!(data.current_height, 1);
    }

    #[test]
    fn equal_top_enters_normal() {
        let handler = make_handler();
        let mut context = ctx();
        let data = handler.sync_data();
        let actions = handler.process_payload_sync_data(data, &mut context, true);
        assert_eq!(context.state, PeerState::Normal);
        // Initial contact also reconciles the pool.
        assert!(matches!(
            actions.first(),
            Some(ProtocolAction::Notify { message, .. })
                if message.command == NOTIFY_REQUEST_TX_POOL
        ));
    }

    #[test]
    fn higher_peer_triggers_chain_request() {
        let handler = make_handler();
        let mut context = ctx();
        let data = CoreSyncData {
            current_height: 100,
            top_id: [9u8; 32],
        };
        let actions = handler.process_payload_sync_data(data, &mut context, true);
        assert_eq!(context.state, PeerState::Synchronizing);
        assert!(matches!(
            actions.first(),
            Some(ProtocolAction::Notify { message, .. })
                if message.command == NOTIFY_REQUEST_CHAIN
        ));
        assert_eq!(handler.observed_height(), 100);
    }

    #[test]
    fn non_initial_sync_data_before_handshake_ignored() {
        let handler = make_handler();
        let mut context = ctx();
        let data = CoreSyncData {
            current_height: 100,
            top_id: [9u8; 32],
        };
        let actions = handler.process_payload_sync_data(data, &mut context, false);
        assert!(actions.is_empty());
        assert_eq!(context.state, PeerState::BeforeHandshake);
    }

    #[test]
    fn request_chain_without_common_root_drops() {
        let handler = make_handler();
        let mut context = ctx();
        let payload = codec::to_binary(&RequestChain {
            block_ids: vec![[0xAB; 32]],
        })
        .unwrap();
        let actions = handler
            .handle_command(&mut context, NOTIFY_REQUEST_CHAIN, &payload)
            .unwrap();
        assert!(matches!(
            actions.first(),
            Some(ProtocolAction::Drop { penalize: true, .. })
        ));
    }

    #[test]
    fn request_chain_serves_entry() {
        let handler = make_handler();
        let mut context = ctx();
        let genesis = handler.core.currency().genesis_block_hash();
        let payload = codec::to_binary(&RequestChain {
            block_ids: vec![genesis],
        })
        .unwrap();
        let actions = handler
            .handle_command(&mut context, NOTIFY_REQUEST_CHAIN, &payload)
            .unwrap();
        match actions.first() {
            Some(ProtocolAction::Notify { message, .. }) => {
                assert_eq!(message.command, NOTIFY_RESPONSE_CHAIN_ENTRY);
                let entry: ResponseChainEntry = codec::from_binary(&message.payload).unwrap();
                assert_eq!(entry.total_height, 1);
                assert_eq!(entry.block_ids, vec![genesis]);
            }
            other => panic!("expected Notify, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_error() {
        let handler = make_handler();
        let mut context = ctx();
        let err = handler
            .handle_command(&mut context, NOTIFY_REQUEST_CHAIN, &[0xFF, 0x01])
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed { .. }));
    }

    #[test]
    fn unknown_command_is_error() {
        let handler = make_handler();
        let mut context = ctx();
        let err = handler.handle_command(&mut context, 9999, &[]).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownCommand(9999)));
    }

    #[test]
    fn unrequested_block_in_response_drops_peer() {
        let handler = make_handler();
        let mut context = ctx();
        context.state = PeerState::Synchronizing;
        let block = handler.core.currency().genesis_block().clone();
        let payload = codec::to_binary(&ResponseGetObjects {
            blocks: vec![(block, vec![])],
            txs: vec![],
            missed_ids: vec![],
            current_blockchain_height: 5,
        })
        .unwrap();
        let actions = handler
            .handle_command(&mut context, NOTIFY_RESPONSE_GET_OBJECTS, &payload)
            .unwrap();
        assert!(matches!(
            actions.first(),
            Some(ProtocolAction::Drop { penalize: true, .. })
        ));
    }

    #[test]
    fn chain_entry_filters_known_blocks() {
        let handler = make_handler();
        let mut context = ctx();
        context.state = PeerState::Synchronizing;
        let genesis = handler.core.currency().genesis_block_hash();
        let unknown = [0x55u8; 32];
        let payload = codec::to_binary(&ResponseChainEntry {
            start_height: 0,
            total_height: 2,
            block_ids: vec![genesis, unknown],
        })
        .unwrap();
        let actions = handler
            .handle_command(&mut context, NOTIFY_RESPONSE_CHAIN_ENTRY, &payload)
            .unwrap();
        // Only the unknown block is requested.
        match actions.first() {
            Some(ProtocolAction::Notify { message, .. }) => {
                assert_eq!(message.command, NOTIFY_REQUEST_GET_OBJECTS);
                let req: RequestGetObjects = codec::from_binary(&message.payload).unwrap();
                assert_eq!(req.blocks, vec![unknown]);
            }
            other => panic!("expected Notify, got {other:?}"),
        }
        assert!(context.requested_objects.contains(&unknown));
    }

    #[test]
    fn empty_chain_entry_drops_peer() {
        let handler = make_handler();
        let mut context = ctx();
        let payload = codec::to_binary(&ResponseChainEntry {
            start_height: 0,
            total_height: 2,
            block_ids: vec![],
        })
        .unwrap();
        let actions = handler
            .handle_command(&mut context, NOTIFY_RESPONSE_CHAIN_ENTRY, &payload)
            .unwrap();
        assert!(matches!(
            actions.first(),
            Some(ProtocolAction::Drop { penalize: true, .. })
        ));
    }
}
