use std::{
    cmp::min,
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::wallet::Account;

use super::block::Block;
use super::blockchain::{get_proof_of_work, validate_chain, Blockchain};
use super::message::{
    addr_message, block_inventory_item, block_message, decode_block, getaddr_message,
    getblocks_message, getdata_message, inv_message, ping_message, pong_message, reject_message,
    verack_message, version_message, AddrData, BlockData, GetBlocksData, InvData, Message,
    PingData, VersionData, INV_TYPE_BLOCK, REJECT_CODE_DIF_VERSION,
};
use super::message::codes;
use super::net_error::ErrorKind::{NotRunning, PeerUnreachable, PortUnavailable};
use super::net_error::NetResult;
use super::params::{unix_time, NetParams, MAX_MALFORMED_MSGS, MAX_MESSAGE_BYTES, PROTOCOL_VERSION};
use super::transaction::CoinTransfer;

/// Peer-table endpoint identifier.
pub fn endpoint(host: &str, port: u16) -> String {
    format!("{}_{}", host, port)
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    ReadyToConnect,
    WaitingVerack,
    Connected,
}

/// One live TCP connection. Reading happens on a dedicated thread; all other
/// access goes through the node state lock.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    pub state: PeerState,
    /// The peer's advertised listen endpoint, learned from its version
    /// message.
    pub remote_endpoint: Option<String>,
    /// Seconds without received bytes, advanced by the inactivity timer and
    /// reset by the reader.
    inactivity_secs: u64,
    pub last_ping_pong: Option<f64>,
    /// Block identifiers requested via getdata and not yet received.
    requested_blocks: Vec<String>,
    received_blocks: Vec<Block>,
    malformed_msgs: u32,
}

pub struct NodeState {
    pub params: NetParams,
    pub account: Account,
    pub blockchain: Blockchain,
    peers: Vec<String>,
    connections: HashMap<u64, Connection>,
    next_conn_id: u64,
    running: bool,
}

enum HandshakeAction {
    SendVersion,
    SendVerack,
    None,
}

impl NodeState {
    pub fn listen_endpoint(&self) -> String {
        endpoint(&self.params.ip_address, self.params.port)
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == PeerState::Connected)
            .count()
    }

    fn add_peer(&mut self, peer: String) {
        if peer != self.listen_endpoint() && !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    fn send_to(&mut self, conn_id: u64, msg: &Message) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            if let Err(err) = conn.stream.write_all(msg.to_line().as_bytes()) {
                warn!("Failed to write to connection {}: {}", conn_id, err);
            }
        }
    }

    fn send_to_connected(&mut self, msg: &Message) {
        let ids: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == PeerState::Connected)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.send_to(id, msg);
        }
    }

    fn close_connection(&mut self, conn_id: u64) {
        if let Some(conn) = self.connections.remove(&conn_id) {
            conn.stream.shutdown(Shutdown::Both).ok();
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<u64> = self.connections.keys().copied().collect();

        for id in ids {
            self.close_connection(id);
        }
    }

    /// An initial block download is due when the tip header has gone stale
    /// or the header chain has run well ahead of the block store.
    pub fn should_start_sync(&self) -> bool {
        let tip_age = unix_time() - self.blockchain.tip().header.time_start_hashing;

        if tip_age > self.params.stale_tip_secs {
            return true;
        }

        let headers = self.blockchain.headers().len();
        let blocks = self.blockchain.chain().len();

        headers > blocks && headers - blocks > self.params.header_gap_limit
    }

    fn handle_message(&mut self, conn_id: u64, msg: Message) {
        match msg.command() {
            codes::VERSION => self.handle_version(conn_id, &msg),
            codes::VERACK => self.handle_verack(conn_id),
            codes::REJECT => self.handle_reject(conn_id, &msg),
            command => {
                // Request handlers only run on fully connected peers.
                let connected = self
                    .connections
                    .get(&conn_id)
                    .map(|c| c.state == PeerState::Connected)
                    .unwrap_or(false);

                if !connected {
                    debug!(
                        "Ignoring command {} on a connection that has not completed its handshake",
                        command
                    );
                    return;
                }

                match command {
                    codes::GETADDR => self.handle_getaddr(conn_id),
                    codes::ADDR => self.handle_addr(&msg),
                    codes::PING => self.handle_ping(conn_id, &msg),
                    codes::PONG => self.handle_pong(conn_id),
                    codes::GETBLOCKS => self.handle_getblocks(conn_id, &msg),
                    codes::INV => self.handle_inv(conn_id, &msg),
                    codes::GETDATA => self.handle_getdata(conn_id, &msg),
                    codes::BLOCK => self.handle_block(conn_id, &msg),
                    other => debug!("Ignoring unknown command {}", other),
                }
            }
        }
    }

    fn handle_version(&mut self, conn_id: u64, msg: &Message) {
        let data: VersionData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad version payload: {}", err);
                return;
            }
        };

        let start = self.params.start_string.clone();

        if data.version != PROTOCOL_VERSION {
            info!(
                "Rejecting peer with protocol version {} (ours is {})",
                data.version, PROTOCOL_VERSION
            );
            let reject = reject_message(
                &start,
                "version",
                REJECT_CODE_DIF_VERSION,
                Some("protocol version mismatch"),
            );
            self.send_to(conn_id, &reject);
            self.close_connection(conn_id);
            return;
        }

        let remote = endpoint(&data.ip_address, data.port);

        if remote == self.listen_endpoint() {
            debug!("Connected to myself, dropping");
            self.close_connection(conn_id);
            return;
        }

        self.add_peer(remote.clone());

        let (ip, port) = (self.params.ip_address.clone(), self.params.port);
        let action = match self.connections.get_mut(&conn_id) {
            None => return,
            Some(conn) => {
                conn.remote_endpoint = Some(remote);

                match conn.state {
                    PeerState::ReadyToConnect => {
                        conn.state = PeerState::WaitingVerack;
                        HandshakeAction::SendVersion
                    }
                    PeerState::WaitingVerack => {
                        conn.state = PeerState::Connected;
                        HandshakeAction::SendVerack
                    }
                    PeerState::Connected => HandshakeAction::None,
                }
            }
        };

        match action {
            HandshakeAction::SendVersion => {
                let version = version_message(&start, &ip, port);
                self.send_to(conn_id, &version);
            }
            HandshakeAction::SendVerack => {
                self.send_to(conn_id, &verack_message(&start));
                self.on_connected(conn_id);
            }
            HandshakeAction::None => (),
        };
    }

    fn handle_verack(&mut self, conn_id: u64) {
        let start = self.params.start_string.clone();

        let was_waiting = match self.connections.get_mut(&conn_id) {
            None => return,
            Some(conn) if conn.state == PeerState::WaitingVerack => {
                conn.state = PeerState::Connected;
                true
            }
            Some(_) => false,
        };

        if was_waiting {
            self.send_to(conn_id, &verack_message(&start));
            self.on_connected(conn_id);
        }
    }

    fn handle_reject(&mut self, conn_id: u64, msg: &Message) {
        match msg.data::<super::message::RejectData>() {
            Ok(data) => info!(
                "Peer rejected our {} (code {})",
                data.msg_rejected_type, data.reject_code
            ),
            Err(_) => info!("Peer sent a reject"),
        };

        self.close_connection(conn_id);
    }

    /// Runs once a handshake completes: ask the peer for its address list,
    /// and start a block download if our chain looks behind.
    fn on_connected(&mut self, conn_id: u64) {
        let start = self.params.start_string.clone();
        self.send_to(conn_id, &getaddr_message(&start));

        if self.should_start_sync() {
            let tip_hash = self.blockchain.tip().header_hash();
            self.send_to(conn_id, &getblocks_message(&start, &tip_hash));
        }
    }

    fn handle_getaddr(&mut self, conn_id: u64) {
        let msg = addr_message(&self.params.start_string, &self.peers);
        self.send_to(conn_id, &msg);
    }

    fn handle_addr(&mut self, msg: &Message) {
        let data: AddrData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad addr payload: {}", err);
                return;
            }
        };

        for peer in data.ip_addresses {
            self.add_peer(peer);
        }
    }

    fn handle_ping(&mut self, conn_id: u64, msg: &Message) {
        if let Ok(data) = msg.data::<PingData>() {
            let pong = pong_message(&self.params.start_string, data.nonce);
            self.send_to(conn_id, &pong);
        }
    }

    fn handle_pong(&mut self, conn_id: u64) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.last_ping_pong = Some(unix_time());
        }
    }

    /// Advertises up to `max_inv_blocks` block identifiers following the
    /// requested hash. An unknown hash advertises from just after genesis.
    fn handle_getblocks(&mut self, conn_id: u64, msg: &Message) {
        let data: GetBlocksData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad getblocks payload: {}", err);
                return;
            }
        };

        let chain = self.blockchain.chain();
        let start_pos = match self.blockchain.find_block_position(&data.header_hash) {
            Some(pos) => pos + 1,
            None => 1,
        };
        let end_pos = min(start_pos + self.params.max_inv_blocks, chain.len());

        let items = if start_pos < end_pos {
            chain[start_pos..end_pos]
                .iter()
                .map(|b| block_inventory_item(&b.header_hash()))
                .collect()
        } else {
            vec![]
        };

        let inv = inv_message(&self.params.start_string, items);
        self.send_to(conn_id, &inv);
    }

    /// Requests the first `max_getdata_blocks` advertised blocks.
    fn handle_inv(&mut self, conn_id: u64, msg: &Message) {
        let data: InvData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad inv payload: {}", err);
                return;
            }
        };

        let wanted: Vec<String> = data
            .inventory
            .iter()
            .filter(|i| i.item_type == INV_TYPE_BLOCK)
            .take(min(data.count, self.params.max_getdata_blocks))
            .map(|i| i.identifier.clone())
            .collect();

        if wanted.is_empty() {
            return;
        }

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.requested_blocks = wanted.clone();
            conn.received_blocks.clear();
        }

        let items = wanted.iter().map(|h| block_inventory_item(h)).collect();
        let getdata = getdata_message(&self.params.start_string, items);
        self.send_to(conn_id, &getdata);
    }

    fn handle_getdata(&mut self, conn_id: u64, msg: &Message) {
        let data: InvData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad getdata payload: {}", err);
                return;
            }
        };

        let mut replies: Vec<Message> = vec![];

        for item in data.inventory.iter().filter(|i| i.item_type == INV_TYPE_BLOCK) {
            let block = self
                .blockchain
                .find_block_position(&item.identifier)
                .map(|pos| self.blockchain.chain()[pos].clone());

            match block {
                None => debug!("Peer requested unknown block {}", item.identifier),
                Some(block) => match block_message(&self.params.start_string, &block) {
                    Ok(msg) => replies.push(msg),
                    Err(err) => warn!("Failed to encode block: {}", err),
                },
            };
        }

        for reply in replies {
            self.send_to(conn_id, &reply);
        }
    }

    fn handle_block(&mut self, conn_id: u64, msg: &Message) {
        let data: BlockData = match msg.data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Bad block payload: {}", err);
                return;
            }
        };

        let block = match decode_block(&data) {
            Ok(block) => block,
            Err(err) => {
                warn!("Undecodable block payload: {}", err);
                return;
            }
        };

        let hash = block.header_hash();
        let batch = match self.connections.get_mut(&conn_id) {
            None => return,
            Some(conn) if conn.requested_blocks.contains(&hash) => {
                if !conn.received_blocks.iter().any(|b| b.header_hash() == hash) {
                    conn.received_blocks.push(block);
                }

                if conn.received_blocks.len() >= conn.requested_blocks.len() {
                    conn.requested_blocks.clear();
                    std::mem::take(&mut conn.received_blocks)
                } else {
                    return;
                }
            }
            // Unsolicited single block, e.g. relayed straight after mining.
            Some(_) => vec![block],
        };

        self.try_adopt(batch);
    }

    /// Appends or adopts a batch of fetched blocks. A single block extending
    /// the tip is applied directly; anything else is treated as a candidate
    /// chain and adopted only when strictly longer and fully valid.
    fn try_adopt(&mut self, mut blocks: Vec<Block>) {
        blocks.sort_by_key(|b| b.block_number);
        blocks.retain(|b| self.blockchain.find_block_position(&b.header_hash()).is_none());

        if blocks.is_empty() {
            return;
        }

        let first_prev = blocks[0].header.prev_block_header_hash.clone();

        if blocks.len() == 1 && first_prev == self.blockchain.tip().header_hash() {
            let block = blocks.remove(0);
            let hash = block.header_hash();

            if self.blockchain.apply_external_block(block) {
                info!("Appended block {} from the network", hash);
            }

            return;
        }

        let anchor = match self.blockchain.find_block_position(&first_prev) {
            None => {
                debug!("Fetched blocks do not connect to our chain, ignoring");
                return;
            }
            Some(pos) => pos,
        };

        let mut candidate = self.blockchain.chain()[..=anchor].to_vec();
        candidate.extend(blocks);

        if candidate.len() > self.blockchain.chain().len() && validate_chain(&candidate) {
            info!("Adopting a longer chain of {} blocks", candidate.len());
            self.blockchain.replace_chain(candidate);
        }
    }

    fn inactivity_tick(&mut self) {
        let tick = self.params.inactivity_tick_secs;
        let ping_limit = self.params.ping_limit_secs;
        let close_limit = self.params.close_limit_secs;
        let start = self.params.start_string.clone();

        let mut to_ping: Vec<u64> = vec![];
        let mut to_close: Vec<u64> = vec![];

        for (id, conn) in self.connections.iter_mut() {
            conn.inactivity_secs += tick;

            if conn.inactivity_secs > close_limit {
                to_close.push(*id);
            } else if conn.inactivity_secs > ping_limit {
                to_ping.push(*id);
            }
        }

        for id in to_ping {
            let ping = ping_message(&start, rand::random::<u64>());
            self.send_to(id, &ping);
        }

        for id in to_close {
            info!("Closing connection {} for inactivity", id);
            self.close_connection(id);
        }
    }
}

/// A node: a listening socket, a set of live connections, the peer table,
/// and the chain engine, all behind one lock. Cloning shares the node; tests
/// run several nodes in one process.
#[derive(Clone)]
pub struct Node {
    state: Arc<Mutex<NodeState>>,
}

impl Node {
    pub fn new(account: Account, blockchain: Blockchain, params: NetParams) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                params,
                account,
                blockchain,
                peers: vec![],
                connections: HashMap::new(),
                next_conn_id: 0,
                running: false,
            })),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();

        f(&mut guard)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running)
    }

    pub fn port(&self) -> u16 {
        self.with_state(|s| s.params.port)
    }

    pub fn listen_endpoint(&self) -> String {
        self.with_state(|s| s.listen_endpoint())
    }

    pub fn peers(&self) -> Vec<String> {
        self.with_state(|s| s.peers.clone())
    }

    /// Binds the listen socket and starts the accept and inactivity-timer
    /// threads. Port 0 asks the OS for a free port; the node then advertises
    /// the port it actually got.
    pub fn start(&self) -> NetResult<()> {
        let (ip, port) = self.with_state(|s| (s.params.ip_address.clone(), s.params.port));

        let listener = TcpListener::bind((ip.as_str(), port))
            .map_err(|_| Box::new(PortUnavailable(ip.clone(), port)))?;
        let actual_port = listener
            .local_addr()
            .map_err(|_| Box::new(PortUnavailable(ip.clone(), port)))?
            .port();

        self.with_state(|s| {
            s.params.port = actual_port;
            s.running = true;
        });

        info!("Node listening on {}:{}", ip, actual_port);

        let accept_node = self.clone();
        thread::Builder::new()
            .name(String::from("network-listener"))
            .spawn(move || {
                for stream in listener.incoming() {
                    if !accept_node.is_running() {
                        break;
                    }

                    match stream {
                        Err(err) => warn!("Error receiving incoming connection: {}", err),
                        Ok(conn) => {
                            accept_node.register_connection(conn);
                        }
                    };
                }
            })
            .expect("Failed to spawn the network listener thread");

        let timer_node = self.clone();
        let tick = self.with_state(|s| s.params.inactivity_tick_secs);
        thread::Builder::new()
            .name(String::from("inactivity-timer"))
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(tick));

                if !timer_node.is_running() {
                    break;
                }

                timer_node.with_state(|s| s.inactivity_tick());
            })
            .expect("Failed to spawn the inactivity timer thread");

        Ok(())
    }

    /// Stops the node: closes every connection and unblocks the accept loop.
    /// Peers stay in the peer table for a later restart.
    pub fn stop(&self) {
        let (ip, port) = self.with_state(|s| {
            s.running = false;
            s.close_all();
            (s.params.ip_address.clone(), s.params.port)
        });

        // Wake the accept loop so it observes the stop flag.
        TcpStream::connect((ip.as_str(), port)).ok();
    }

    /// Dials a peer and opens the handshake by sending our version.
    pub fn connect_to(&self, host: &str, port: u16) -> NetResult<u64> {
        if !self.is_running() {
            return Err(Box::new(NotRunning));
        }

        let stream = TcpStream::connect((host, port))
            .map_err(|_| Box::new(PeerUnreachable(endpoint(host, port))))?;

        let conn_id = self.register_connection(stream);

        self.with_state(|s| {
            let start = s.params.start_string.clone();
            let (ip, listen_port) = (s.params.ip_address.clone(), s.params.port);

            if let Some(conn) = s.connections.get_mut(&conn_id) {
                conn.state = PeerState::WaitingVerack;
            }

            let version = version_message(&start, &ip, listen_port);
            s.send_to(conn_id, &version);
        });

        Ok(conn_id)
    }

    /// Registers a connection and spawns its reader thread.
    fn register_connection(&self, stream: TcpStream) -> u64 {
        stream.set_nodelay(true).ok();

        let reader_stream = stream.try_clone().expect("TCP streams are clonable");

        let conn_id = self.with_state(|s| {
            let conn_id = s.next_conn_id;
            s.next_conn_id += 1;
            s.connections.insert(
                conn_id,
                Connection {
                    stream,
                    state: PeerState::ReadyToConnect,
                    remote_endpoint: None,
                    inactivity_secs: 0,
                    last_ping_pong: None,
                    requested_blocks: vec![],
                    received_blocks: vec![],
                    malformed_msgs: 0,
                },
            );

            conn_id
        });

        let reader_node = self.clone();
        thread::Builder::new()
            .name(String::from("peer-reader"))
            .spawn(move || {
                let reader = BufReader::new(reader_stream);

                for line in reader.lines() {
                    match line {
                        Err(_) => break,
                        Ok(line) if line.trim().is_empty() => continue,
                        Ok(line) => reader_node.handle_line(conn_id, &line),
                    };
                }

                reader_node.with_state(|s| s.close_connection(conn_id));
            })
            .expect("Failed to spawn a peer reader thread");

        conn_id
    }

    /// Decodes and dispatches one received line. Any received byte resets
    /// the connection's inactivity counter.
    fn handle_line(&self, conn_id: u64, line: &str) {
        self.with_state(|s| {
            if let Some(conn) = s.connections.get_mut(&conn_id) {
                conn.inactivity_secs = 0;
            }

            let msg = match Message::from_line(line) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("Received an invalid message: {}", err);

                    if let Some(conn) = s.connections.get_mut(&conn_id) {
                        conn.malformed_msgs += 1;

                        if conn.malformed_msgs >= MAX_MALFORMED_MSGS {
                            info!("Closing connection {}: persistent malformed input", conn_id);
                            s.close_connection(conn_id);
                        }
                    }

                    return;
                }
            };

            if msg.msg_header.payload_size > MAX_MESSAGE_BYTES {
                warn!(
                    "Dropping oversized message ({} bytes declared)",
                    msg.msg_header.payload_size
                );
                return;
            }

            s.handle_message(conn_id, msg);
        });
    }

    /// Queues a transfer batch signed by this node's wallet.
    pub fn submit_transfers(&self, transfers: &[CoinTransfer]) -> bool {
        self.with_state(|s| {
            let account = s.account.clone();

            s.blockchain.submit_transaction(&account, transfers)
        })
    }

    /// Mines the pending list into a block and advertises it. The
    /// proof-of-work search runs without the state lock, so network traffic
    /// keeps flowing while the node mines.
    pub fn mine(&self) -> usize {
        let block = match self.with_state(|s| s.blockchain.prepare_block()) {
            None => return 0,
            Some(block) => block,
        };

        let count = block.transactions.len();
        let nonce = get_proof_of_work(&block);

        let appended = self.with_state(|s| s.blockchain.append_mined(block, nonce));

        if !appended {
            return 0;
        }

        let tip_hash = self.with_state(|s| s.blockchain.tip().header_hash());
        self.broadcast_block_inv(&tip_hash);

        count
    }

    /// Advertises a block to every connected peer in parallel; peers fetch
    /// it with getdata.
    pub fn broadcast_block_inv(&self, header_hash: &str) {
        let (start, writers) = self.with_state(|s| {
            let writers: Vec<TcpStream> = s
                .connections
                .values()
                .filter(|c| c.state == PeerState::Connected)
                .filter_map(|c| c.stream.try_clone().ok())
                .collect();

            (s.params.start_string.clone(), writers)
        });

        if writers.is_empty() {
            return;
        }

        let line = inv_message(&start, vec![block_inventory_item(header_hash)]).to_line();

        crossbeam::scope(|scope| {
            for mut writer in writers {
                let line = line.clone();

                scope.spawn(move |_| {
                    writer.write_all(line.as_bytes()).ok();
                });
            }
        })
        .unwrap();
    }

    /// Asks every connected peer for the blocks after our tip.
    pub fn sync_with_peers(&self) {
        self.with_state(|s| {
            let start = s.params.start_string.clone();
            let tip_hash = s.blockchain.tip().header_hash();
            let msg = getblocks_message(&start, &tip_hash);

            s.send_to_connected(&msg);
        });
    }

    /// Polls every connected peer for its chain, anchored at our genesis
    /// block. Strictly longer valid chains replace ours as the block batches
    /// arrive; unreachable or nonsense peers are simply skipped.
    pub fn resolve_conflicts(&self) {
        self.with_state(|s| {
            let start = s.params.start_string.clone();
            let genesis_hash = s.blockchain.chain()[0].header_hash();
            let msg = getblocks_message(&start, &genesis_hash);

            s.send_to_connected(&msg);
        });
    }

    /// Asks every connected peer for its peer table.
    pub fn request_peer_addresses(&self) {
        self.with_state(|s| {
            let msg = getaddr_message(&s.params.start_string);

            s.send_to_connected(&msg);
        });
    }
}
