//! The P2P node: listener, per-connection tasks, handshake with back-ping
//! verification, the connection maker, timed sync and peer-list upkeep.
//!
//! Each connection runs as two tasks sharing a cancellation token: a reader
//! that forwards decoded frames to the node loop and a writer draining a
//! bounded queue. The node loop owns every connection context and the peer
//! lists, so message handling is serialized per node while socket I/O stays
//! concurrent.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::blockchain::storage::ChainDb;
use crate::codec;
use crate::constants;
use crate::p2p::levin::{read_frame, write_frame, Frame, LEVIN_OK};
use crate::p2p::messages::*;
use crate::p2p::peerlist::{AnchorPeerlistEntry, PeerlistManager};
use crate::p2p::{ConnectionId, PeerId, NETWORK_ID};
use crate::protocol::{ConnectionContext, PeerState, ProtocolAction, ProtocolHandler};

/// Node configuration.
#[derive(Clone)]
pub struct NetNodeConfig {
    pub listen_addr: SocketAddr,
    /// Port advertised to peers; zero hides us from back-ping promotion.
    pub external_port: u16,
    pub connections_count: usize,
    pub seed_nodes: Vec<SocketAddr>,
    /// When non-empty, connect only to these peers.
    pub exclusive_peers: Vec<SocketAddr>,
}

impl Default for NetNodeConfig {
    fn default() -> Self {
        NetNodeConfig {
            listen_addr: format!("0.0.0.0:{}", constants::P2P_DEFAULT_PORT)
                .parse()
                .expect("static address"),
            external_port: 0,
            connections_count: constants::P2P_CONNECTIONS_COUNT,
            seed_nodes: constants::SEED_NODES
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            exclusive_peers: Vec::new(),
        }
    }
}

/// Errors from the node lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("node stopped")]
    Stopped,
}

/// Commands from the application into the node loop.
pub enum NodeCommand {
    Connect(SocketAddr),
    Execute(Vec<ProtocolAction>),
    ConnectionCount(oneshot::Sender<(usize, usize)>),
    Stop,
}

/// Handle over a running node.
#[derive(Clone)]
pub struct NetNodeHandle {
    command_tx: mpsc::Sender<NodeCommand>,
    pub local_addr: SocketAddr,
    pub peer_id: PeerId,
}

impl NetNodeHandle {
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NodeError> {
        self.command_tx
            .send(NodeCommand::Connect(addr))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Execute protocol actions originating outside a connection (local
    /// block found, RPC-submitted transaction).
    pub async fn execute(&self, actions: Vec<ProtocolAction>) -> Result<(), NodeError> {
        self.command_tx
            .send(NodeCommand::Execute(actions))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// `(incoming, outgoing)` connection counts.
    pub async fn connection_count(&self) -> Result<(usize, usize), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::ConnectionCount(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn stop(&self) {
        let _ = self.command_tx.send(NodeCommand::Stop).await;
    }
}

/// Shared node identity handed to connection tasks.
struct NodeIdentity {
    peer_id: PeerId,
    external_port: u16,
}

impl NodeIdentity {
    fn basic_node_data(&self) -> BasicNodeData {
        BasicNodeData {
            network_id: NETWORK_ID,
            version: constants::P2P_CURRENT_VERSION,
            peer_id: self.peer_id,
            local_time: unix_now(),
            my_port: self.external_port,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One live connection as the node loop sees it.
struct Connection {
    context: ConnectionContext,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    cancel: CancellationToken,
    advertised_port: u16,
}

/// Events from connection tasks into the node loop.
enum InternalEvent {
    HandshakeDone {
        id: ConnectionId,
        peer_id: PeerId,
        addr: SocketAddr,
        is_income: bool,
        version: u8,
        advertised_port: u16,
        sync_data: CoreSyncData,
        write_tx: mpsc::UnboundedSender<Vec<u8>>,
        queued_bytes: Arc<AtomicUsize>,
        cancel: CancellationToken,
    },
    Frame {
        id: ConnectionId,
        frame: Frame,
    },
    Disconnected {
        id: ConnectionId,
    },
}

/// Per-IP fail scoring with cool-off blocking.
#[derive(Default)]
struct FailScores {
    scores: HashMap<IpAddr, (u32, Option<Instant>)>,
}

impl FailScores {
    fn penalize(&mut self, ip: IpAddr) {
        let entry = self.scores.entry(ip).or_insert((0, None));
        entry.0 += 1;
        if entry.0 >= constants::P2P_FAIL_SCORE_THRESHOLD {
            tracing::info!(%ip, score = entry.0, "blocking misbehaving peer");
            entry.1 = Some(Instant::now() + Duration::from_secs(constants::P2P_IP_BLOCK_SECS));
        }
    }

    fn is_blocked(&self, ip: IpAddr) -> bool {
        self.scores
            .get(&ip)
            .and_then(|(_, until)| *until)
            .is_some_and(|until| Instant::now() < until)
    }

    fn prune(&mut self) {
        self.scores
            .retain(|_, (score, until)| *score > 0 && until.map_or(true, |u| Instant::now() < u));
    }
}

/// Start the node: bind, restore peer state, spawn the loop.
pub async fn start(
    config: NetNodeConfig,
    handler: Arc<ProtocolHandler>,
    db: Option<Arc<ChainDb>>,
) -> Result<NetNodeHandle, NodeError> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(NodeError::Bind)?;
    let local_addr = listener.local_addr().map_err(NodeError::Bind)?;

    let peerlist = Arc::new(Mutex::new(PeerlistManager::new()));
    let mut peer_id: PeerId = rand::random();
    if let Some(db) = &db {
        if let Ok(Some(bytes)) = db.get_p2p_state() {
            if let Ok(record) = codec::from_binary::<P2pStateRecord>(&bytes) {
                if record.version == P2P_STATE_VERSION {
                    peer_id = record.peer_id;
                    peerlist
                        .lock()
                        .expect("peerlist lock poisoned")
                        .restore_state(record);
                    tracing::info!("restored p2p state");
                }
            }
        }
    }
    tracing::info!(peer_id, addr = %local_addr, "p2p node listening");

    let (command_tx, command_rx) = mpsc::channel(256);
    let identity = Arc::new(NodeIdentity {
        peer_id,
        external_port: config.external_port,
    });

    tokio::spawn(node_loop(
        config,
        listener,
        identity,
        handler,
        peerlist,
        db,
        command_rx,
    ));

    Ok(NetNodeHandle {
        command_tx,
        local_addr,
        peer_id,
    })
}

#[allow(clippy::too_many_arguments)]
async fn node_loop(
    config: NetNodeConfig,
    listener: TcpListener,
    identity: Arc<NodeIdentity>,
    handler: Arc<ProtocolHandler>,
    peerlist: Arc<Mutex<PeerlistManager>>,
    db: Option<Arc<ChainDb>>,
    mut command_rx: mpsc::Receiver<NodeCommand>,
) {
    let mut connections: HashMap<ConnectionId, Connection> = HashMap::new();
    let mut next_connection_id: ConnectionId = 1;
    let mut fail_scores = FailScores::default();
    let mut connecting: HashMap<SocketAddr, Instant> = HashMap::new();
    let (internal_tx, mut internal_rx) = mpsc::channel::<InternalEvent>(512);
    let root_cancel = CancellationToken::new();

    let mut idle_tick = tokio::time::interval(Duration::from_secs(1));
    let mut timed_sync_tick =
        tokio::time::interval(Duration::from_secs(constants::P2P_HANDSHAKE_INTERVAL_SECS));
    timed_sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = listener.accept() => {
                if let Ok((stream, addr)) = result {
                    if fail_scores.is_blocked(addr.ip()) {
                        tracing::debug!(%addr, "rejecting blocked peer");
                        continue;
                    }
                    let id = next_connection_id;
                    next_connection_id += 1;
                    tokio::spawn(serve_inbound(
                        stream,
                        addr,
                        id,
                        identity.clone(),
                        handler.clone(),
                        peerlist.clone(),
                        internal_tx.clone(),
                        root_cancel.child_token(),
                    ));
                }
            }

            Some(command) = command_rx.recv() => {
                match command {
                    NodeCommand::Connect(addr) => {
                        if !is_connect_candidate(&connections, &connecting, &fail_scores, addr) {
                            continue;
                        }
                        let id = next_connection_id;
                        next_connection_id += 1;
                        connecting.insert(addr, Instant::now());
                        tokio::spawn(serve_outbound(
                            addr,
                            id,
                            identity.clone(),
                            handler.clone(),
                            peerlist.clone(),
                            internal_tx.clone(),
                            root_cancel.child_token(),
                        ));
                    }
                    NodeCommand::Execute(actions) => {
                        execute_actions(actions, None, &mut connections, &mut fail_scores, &peerlist);
                    }
                    NodeCommand::ConnectionCount(reply) => {
                        let income = connections.values().filter(|c| c.context.is_income).count();
                        let _ = reply.send((income, connections.len() - income));
                    }
                    NodeCommand::Stop => {
                        break;
                    }
                }
            }

            Some(event) = internal_rx.recv() => {
                match event {
                    InternalEvent::HandshakeDone {
                        id, peer_id, addr, is_income, version, advertised_port,
                        sync_data, write_tx, queued_bytes, cancel,
                    } => {
                        connecting.remove(&addr);
                        if peer_id == identity.peer_id {
                            tracing::debug!("rejected self-connection");
                            cancel.cancel();
                            continue;
                        }
                        let mut context = ConnectionContext::new(id, peer_id, addr, is_income, version);
                        let actions = handler.process_payload_sync_data(sync_data, &mut context, true);
                        connections.insert(id, Connection {
                            context,
                            write_tx,
                            queued_bytes,
                            cancel,
                            advertised_port,
                        });
                        execute_actions(actions, Some(id), &mut connections, &mut fail_scores, &peerlist);
                    }
                    InternalEvent::Frame { id, frame } => {
                        handle_frame(
                            id, frame, &identity, &handler, &peerlist,
                            &mut connections, &mut fail_scores,
                        );
                    }
                    InternalEvent::Disconnected { id } => {
                        if let Some(connection) = connections.remove(&id) {
                            connection.cancel.cancel();
                            tracing::debug!(
                                peer = connection.context.peer_id,
                                addr = %connection.context.remote_addr,
                                "connection closed"
                            );
                        }
                    }
                }
            }

            _ = idle_tick.tick() => {
                fail_scores.prune();
                connecting.retain(|_, started| started.elapsed() < Duration::from_secs(30));
                make_expected_connections(
                    &config, &connections, &mut connecting, &fail_scores,
                    &peerlist, &identity, &handler, &internal_tx,
                    &mut next_connection_id, &root_cancel,
                );
                handler.core().on_idle();
            }

            _ = timed_sync_tick.tick() => {
                let request = TimedSyncRequest { payload_data: handler.sync_data() };
                let payload = codec::to_binary(&request)
                    .expect("timed sync request is a fixed-shape record");
                let ids: Vec<ConnectionId> = connections.keys().copied().collect();
                for id in ids {
                    send_frame(
                        &mut connections,
                        &mut fail_scores,
                        id,
                        Frame::request(COMMAND_TIMED_SYNC, payload.clone(), true),
                    );
                }
            }
        }
    }

    // Shutdown: cancel every task and persist peer state.
    root_cancel.cancel();
    for (_, connection) in connections.drain() {
        connection.cancel.cancel();
    }
    if let Some(db) = &db {
        let record = peerlist
            .lock()
            .expect("peerlist lock poisoned")
            .serialize_state(identity.peer_id);
        if let Ok(bytes) = codec::to_binary(&record) {
            let _ = db.put_p2p_state(&bytes);
            let _ = db.flush();
        }
    }
    tracing::info!("p2p node stopped");
}

fn is_connect_candidate(
    connections: &HashMap<ConnectionId, Connection>,
    connecting: &HashMap<SocketAddr, Instant>,
    fail_scores: &FailScores,
    addr: SocketAddr,
) -> bool {
    !fail_scores.is_blocked(addr.ip())
        && !connecting.contains_key(&addr)
        && !connections
            .values()
            .any(|c| c.context.remote_addr == addr || (!c.context.is_income && c.context.remote_addr.ip() == addr.ip() && c.advertised_port == addr.port()))
}

/// Keep the outbound connection count at its target, anchor peers first,
/// then white-list-biased random picks, seeds as a last resort.
#[allow(clippy::too_many_arguments)]
fn make_expected_connections(
    config: &NetNodeConfig,
    connections: &HashMap<ConnectionId, Connection>,
    connecting: &mut HashMap<SocketAddr, Instant>,
    fail_scores: &FailScores,
    peerlist: &Arc<Mutex<PeerlistManager>>,
    identity: &Arc<NodeIdentity>,
    handler: &Arc<ProtocolHandler>,
    internal_tx: &mpsc::Sender<InternalEvent>,
    next_connection_id: &mut ConnectionId,
    root_cancel: &CancellationToken,
) {
    let outbound = connections
        .values()
        .filter(|c| !c.context.is_income)
        .count();
    if outbound + connecting.len() >= config.connections_count {
        return;
    }
    let mut want = config.connections_count - outbound - connecting.len();

    let mut candidates: Vec<SocketAddr> = Vec::new();
    if !config.exclusive_peers.is_empty() {
        candidates.extend(config.exclusive_peers.iter().copied());
    } else {
        let peers = peerlist.lock().expect("peerlist lock poisoned");
        // Anchors first for post-restart stability.
        for anchor in peers.anchor_peers() {
            candidates.push(anchor.address);
        }
        let expected_white = (config.connections_count
            * constants::P2P_WHITELIST_CONNECTIONS_PERCENT)
            / 100;
        let use_white_first = outbound < expected_white && peers.white_peers_count() > 0;
        for _ in 0..want * 3 {
            let from_white = if use_white_first {
                true
            } else {
                peers.gray_peers_count() == 0
            };
            let entry = if from_white && peers.white_peers_count() > 0 {
                let index = crate::p2p::peerlist::random_index_with_fixed_probability(
                    peers.white_peers_count() - 1,
                );
                peers.get_white_peer_by_index(index)
            } else if peers.gray_peers_count() > 0 {
                let index = crate::p2p::peerlist::random_index_with_fixed_probability(
                    peers.gray_peers_count() - 1,
                );
                peers.get_gray_peer_by_index(index)
            } else {
                None
            };
            if let Some(entry) = entry {
                candidates.push(entry.address);
            }
        }
        // Seeds only when we know no verified peer at all.
        if peers.white_peers_count() == 0 && connections.is_empty() {
            candidates.extend(config.seed_nodes.iter().copied());
        }
    }

    for addr in candidates {
        if want == 0 {
            break;
        }
        if !is_connect_candidate(connections, connecting, fail_scores, addr) {
            continue;
        }
        let id = *next_connection_id;
        *next_connection_id += 1;
        connecting.insert(addr, Instant::now());
        tokio::spawn(serve_outbound(
            addr,
            id,
            identity.clone(),
            handler.clone(),
            peerlist.clone(),
            internal_tx.clone(),
            root_cancel.child_token(),
        ));
        want -= 1;
    }
}

/// Enqueue a frame, interrupting the connection when its write buffer is
/// over the cap.
fn send_frame(
    connections: &mut HashMap<ConnectionId, Connection>,
    fail_scores: &mut FailScores,
    id: ConnectionId,
    frame: Frame,
) {
    let Some(connection) = connections.get(&id) else {
        return;
    };
    let bytes = frame.encode();
    let queued = connection.queued_bytes.load(Ordering::Relaxed);
    if queued + bytes.len() > constants::P2P_CONNECTION_MAX_WRITE_BUFFER_SIZE {
        tracing::warn!(
            peer = connection.context.peer_id,
            queued,
            "write buffer overflow, interrupting connection"
        );
        fail_scores.penalize(connection.context.remote_addr.ip());
        connection.cancel.cancel();
        connections.remove(&id);
        return;
    }
    connection
        .queued_bytes
        .fetch_add(bytes.len(), Ordering::Relaxed);
    if connection.write_tx.send(bytes).is_err() {
        connection.cancel.cancel();
        connections.remove(&id);
    }
}

/// Run a handler's actions against the live connection set.
fn execute_actions(
    actions: Vec<ProtocolAction>,
    _origin: Option<ConnectionId>,
    connections: &mut HashMap<ConnectionId, Connection>,
    fail_scores: &mut FailScores,
    peerlist: &Arc<Mutex<PeerlistManager>>,
) {
    for action in actions {
        match action {
            ProtocolAction::Notify { to, message } => {
                send_frame(
                    connections,
                    fail_scores,
                    to,
                    Frame::notify(message.command, message.payload),
                );
            }
            ProtocolAction::Relay {
                message,
                lite,
                exclude,
            } => {
                let targets: Vec<(ConnectionId, bool)> = connections
                    .values()
                    .filter(|c| {
                        exclude != Some(c.context.connection_id)
                            && matches!(
                                c.context.state,
                                PeerState::Normal | PeerState::Synchronizing
                            )
                    })
                    .map(|c| {
                        (
                            c.context.connection_id,
                            c.context.version >= constants::P2P_LITE_BLOCKS_PROPAGATION_VERSION,
                        )
                    })
                    .collect();
                for (id, lite_capable) in targets {
                    let wire = match (&lite, lite_capable) {
                        (Some(lite), true) => lite.clone(),
                        _ => message.clone(),
                    };
                    send_frame(
                        connections,
                        fail_scores,
                        id,
                        Frame::notify(wire.command, wire.payload),
                    );
                }
            }
            ProtocolAction::Drop {
                connection,
                penalize,
            } => {
                if let Some(dropped) = connections.remove(&connection) {
                    if penalize {
                        fail_scores.penalize(dropped.context.remote_addr.ip());
                        peerlist
                            .lock()
                            .expect("peerlist lock poisoned")
                            .demote_to_gray(SocketAddr::new(
                                dropped.context.remote_addr.ip(),
                                dropped.advertised_port,
                            ));
                    }
                    dropped.cancel.cancel();
                }
            }
        }
    }
}

/// Process one incoming frame inside the node loop.
fn handle_frame(
    id: ConnectionId,
    frame: Frame,
    identity: &Arc<NodeIdentity>,
    handler: &Arc<ProtocolHandler>,
    peerlist: &Arc<Mutex<PeerlistManager>>,
    connections: &mut HashMap<ConnectionId, Connection>,
    fail_scores: &mut FailScores,
) {
    let Some(connection) = connections.get_mut(&id) else {
        return;
    };

    match frame.command {
        COMMAND_TIMED_SYNC if frame.is_request() => {
            let actions = match codec::from_binary::<TimedSyncRequest>(&frame.payload) {
                Ok(request) => handler.process_payload_sync_data(
                    request.payload_data,
                    &mut connection.context,
                    false,
                ),
                Err(_) => {
                    vec![ProtocolAction::Drop {
                        connection: id,
                        penalize: true,
                    }]
                }
            };
            let response = TimedSyncResponse {
                local_time: unix_now(),
                payload_data: handler.sync_data(),
                local_peerlist: peerlist
                    .lock()
                    .expect("peerlist lock poisoned")
                    .get_peerlist_head(constants::P2P_PEERS_IN_HANDSHAKE),
            };
            let payload = codec::to_binary(&response)
                .expect("timed sync response is bounded by the peer list head cap");
            send_frame(
                connections,
                fail_scores,
                id,
                Frame::response(COMMAND_TIMED_SYNC, payload, LEVIN_OK),
            );
            execute_actions(actions, Some(id), connections, fail_scores, peerlist);
        }
        COMMAND_TIMED_SYNC => {
            let actions = match codec::from_binary::<TimedSyncResponse>(&frame.payload) {
                Ok(response) => {
                    {
                        let mut peers = peerlist.lock().expect("peerlist lock poisoned");
                        peers.merge_peerlist(&response.local_peerlist);
                        if !connection.context.is_income {
                            peers.set_peer_just_seen(
                                connection.context.peer_id,
                                SocketAddr::new(
                                    connection.context.remote_addr.ip(),
                                    connection.advertised_port,
                                ),
                                unix_now(),
                            );
                        }
                    }
                    handler.process_payload_sync_data(
                        response.payload_data,
                        &mut connection.context,
                        false,
                    )
                }
                Err(_) => vec![ProtocolAction::Drop {
                    connection: id,
                    penalize: true,
                }],
            };
            execute_actions(actions, Some(id), connections, fail_scores, peerlist);
        }
        COMMAND_PING if frame.is_request() => {
            let response = PingResponse {
                status: PING_OK_RESPONSE_STATUS,
                peer_id: identity.peer_id,
            };
            let payload = codec::to_binary(&response)
                .expect("ping response is a fixed-shape record");
            send_frame(
                connections,
                fail_scores,
                id,
                Frame::response(COMMAND_PING, payload, LEVIN_OK),
            );
        }
        COMMAND_HANDSHAKE => {
            // A second handshake on a live connection is misbehavior.
            execute_actions(
                vec![ProtocolAction::Drop {
                    connection: id,
                    penalize: true,
                }],
                Some(id),
                connections,
                fail_scores,
                peerlist,
            );
        }
        command => {
            let result = handler.handle_command(&mut connection.context, command, &frame.payload);
            let actions = match result {
                Ok(actions) => actions,
                Err(error) => {
                    tracing::info!(peer = connection.context.peer_id, %error, "protocol error");
                    vec![ProtocolAction::Drop {
                        connection: id,
                        penalize: true,
                    }]
                }
            };
            execute_actions(actions, Some(id), connections, fail_scores, peerlist);
        }
    }
}

/// Responder side of the handshake, then the read loop.
#[allow(clippy::too_many_arguments)]
async fn serve_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    identity: Arc<NodeIdentity>,
    handler: Arc<ProtocolHandler>,
    peerlist: Arc<Mutex<PeerlistManager>>,
    internal_tx: mpsc::Sender<InternalEvent>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let handshake = tokio::time::timeout(
        Duration::from_millis(constants::P2P_HANDSHAKE_INVOKE_TIMEOUT_MS),
        read_frame(&mut reader),
    )
    .await;
    let frame = match handshake {
        Ok(Ok(frame)) if frame.command == COMMAND_HANDSHAKE && frame.is_request() => frame,
        _ => {
            tracing::debug!(%addr, "inbound connection did not handshake");
            return;
        }
    };
    let request: HandshakeRequest = match codec::from_binary(&frame.payload) {
        Ok(r) => r,
        Err(_) => return,
    };
    if request.node_data.network_id != NETWORK_ID {
        tracing::debug!(%addr, "wrong network id");
        return;
    }
    if request.node_data.version < constants::P2P_MINIMUM_VERSION {
        tracing::debug!(%addr, version = request.node_data.version, "peer version too old");
        return;
    }

    let response = HandshakeResponse {
        node_data: identity.basic_node_data(),
        payload_data: handler.sync_data(),
        local_peerlist: peerlist
            .lock()
            .expect("peerlist lock poisoned")
            .get_peerlist_head(constants::P2P_PEERS_IN_HANDSHAKE),
    };
    let payload = match codec::to_binary(&response) {
        Ok(p) => p,
        Err(_) => return,
    };
    if write_frame(&mut writer, &Frame::response(COMMAND_HANDSHAKE, payload, LEVIN_OK))
        .await
        .is_err()
    {
        return;
    }

    // Back-ping: verify the advertised port before promoting to white.
    if request.node_data.my_port != 0 {
        let ping_addr = SocketAddr::new(addr.ip(), request.node_data.my_port);
        let expected = request.node_data.peer_id;
        let peers = peerlist.clone();
        tokio::spawn(async move {
            if back_ping(ping_addr, expected).await {
                peers
                    .lock()
                    .expect("peerlist lock poisoned")
                    .append_with_peer_white(PeerlistEntry {
                        address: ping_addr,
                        id: expected,
                        last_seen: unix_now(),
                    });
                tracing::debug!(%ping_addr, "back-ping verified, peer whitelisted");
            } else {
                tracing::debug!(%ping_addr, "back-ping failed");
            }
        });
    }

    run_connection(
        id,
        request.node_data.peer_id,
        addr,
        true,
        request.node_data.version,
        request.node_data.my_port,
        request.payload_data,
        reader,
        writer,
        internal_tx,
        cancel,
    )
    .await;
}

/// Initiator side of the handshake, then the read loop.
#[allow(clippy::too_many_arguments)]
async fn serve_outbound(
    addr: SocketAddr,
    id: ConnectionId,
    identity: Arc<NodeIdentity>,
    handler: Arc<ProtocolHandler>,
    peerlist: Arc<Mutex<PeerlistManager>>,
    internal_tx: mpsc::Sender<InternalEvent>,
    cancel: CancellationToken,
) {
    let stream = match tokio::time::timeout(
        Duration::from_millis(constants::P2P_CONNECTION_TIMEOUT_MS),
        TcpStream::connect(addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        _ => {
            tracing::debug!(%addr, "outbound connect failed");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let request = HandshakeRequest {
        node_data: identity.basic_node_data(),
        payload_data: handler.sync_data(),
    };
    let payload = match codec::to_binary(&request) {
        Ok(p) => p,
        Err(_) => return,
    };
    if write_frame(&mut writer, &Frame::request(COMMAND_HANDSHAKE, payload, true))
        .await
        .is_err()
    {
        return;
    }

    // One connection timeout for the dial, two more budgeted for the peer's
    // back-ping before its handshake response arrives.
    let response = tokio::time::timeout(
        Duration::from_millis(constants::P2P_CONNECTION_TIMEOUT_MS * 3),
        read_frame(&mut reader),
    )
    .await;
    let frame = match response {
        Ok(Ok(frame)) if frame.command == COMMAND_HANDSHAKE && frame.is_response() => frame,
        _ => {
            tracing::debug!(%addr, "handshake with peer timed out");
            return;
        }
    };
    let response: HandshakeResponse = match codec::from_binary(&frame.payload) {
        Ok(r) => r,
        Err(_) => return,
    };
    if response.node_data.network_id != NETWORK_ID
        || response.node_data.version < constants::P2P_MINIMUM_VERSION
    {
        tracing::debug!(%addr, "peer failed handshake validation");
        return;
    }

    {
        let mut peers = peerlist.lock().expect("peerlist lock poisoned");
        peers.merge_peerlist(&response.local_peerlist);
        // We dialed this address; it is verified by construction.
        peers.append_with_peer_white(PeerlistEntry {
            address: addr,
            id: response.node_data.peer_id,
            last_seen: unix_now(),
        });
        peers.append_with_peer_anchor(AnchorPeerlistEntry {
            address: addr,
            id: response.node_data.peer_id,
            first_seen: unix_now(),
        });
    }

    run_connection(
        id,
        response.node_data.peer_id,
        addr,
        false,
        response.node_data.version,
        addr.port(),
        response.payload_data,
        reader,
        writer,
        internal_tx,
        cancel,
    )
    .await;
}

/// Open a throwaway connection to the advertised port and confirm the peer
/// id matches.
async fn back_ping(addr: SocketAddr, expected_peer_id: PeerId) -> bool {
    let connect = tokio::time::timeout(
        Duration::from_millis(constants::P2P_PING_CONNECTION_TIMEOUT_MS),
        TcpStream::connect(addr),
    )
    .await;
    let stream = match connect {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };
    let (mut reader, mut writer) = stream.into_split();
    let payload = match codec::to_binary(&PingRequest) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if write_frame(&mut writer, &Frame::request(COMMAND_PING, payload, true))
        .await
        .is_err()
    {
        return false;
    }
    let frame = match tokio::time::timeout(
        Duration::from_millis(constants::P2P_PING_CONNECTION_TIMEOUT_MS),
        read_frame(&mut reader),
    )
    .await
    {
        Ok(Ok(frame)) if frame.command == COMMAND_PING => frame,
        _ => return false,
    };
    match codec::from_binary::<PingResponse>(&frame.payload) {
        Ok(response) => {
            response.status == PING_OK_RESPONSE_STATUS && response.peer_id == expected_peer_id
        }
        Err(_) => false,
    }
}

/// Spawn the writer task and run the read loop until EOF, error or cancel.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    id: ConnectionId,
    peer_id: PeerId,
    addr: SocketAddr,
    is_income: bool,
    version: u8,
    advertised_port: u16,
    sync_data: CoreSyncData,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    internal_tx: mpsc::Sender<InternalEvent>,
    cancel: CancellationToken,
) {
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let queued_bytes = Arc::new(AtomicUsize::new(0));

    tokio::spawn(write_loop(
        writer,
        write_rx,
        queued_bytes.clone(),
        cancel.clone(),
    ));

    if internal_tx
        .send(InternalEvent::HandshakeDone {
            id,
            peer_id,
            addr,
            is_income,
            version,
            advertised_port,
            sync_data,
            write_tx,
            queued_bytes,
            cancel: cancel.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_frame(&mut reader) => {
                match result {
                    Ok(frame) => {
                        if internal_tx.send(InternalEvent::Frame { id, frame }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = peer_id, error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }
    let _ = internal_tx.send(InternalEvent::Disconnected { id }).await;
}

/// Drain the write queue; a single write exceeding the invoke timeout
/// interrupts the connection.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = write_rx.recv() => match maybe {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let len = bytes.len();
        let result = tokio::time::timeout(
            Duration::from_millis(constants::P2P_INVOKE_TIMEOUT_MS),
            tokio::io::AsyncWriteExt::write_all(&mut writer, &bytes),
        )
        .await;
        queued_bytes.fetch_sub(len, Ordering::Relaxed);
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "write failed");
                cancel.cancel();
                break;
            }
            Err(_) => {
                tracing::warn!("write operation timed out, interrupting connection");
                cancel.cancel();
                break;
            }
        }
    }
}
