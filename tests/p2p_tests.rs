use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use obol_core::v1::blockchain::Blockchain;
use obol_core::v1::message::{
    block_inventory_item, decode_block, getblocks_message, getdata_message, ping_message,
    verack_message, BlockData, InvData, Message, PingData, RejectData,
};
use obol_core::v1::message::codes;
use obol_core::v1::net::{endpoint, Node};
use obol_core::v1::params::{NetParams, MAINNET_START_STRING, PROTOCOL_VERSION};
use obol_core::v1::transaction::CoinTransfer;
use obol_core::wallet::Account;

fn test_params() -> NetParams {
    // Port 0 lets the OS pick a free port; the node advertises what it got.
    NetParams::mainnet("127.0.0.1", 0)
}

fn start_node() -> Node {
    start_node_with_chain(Blockchain::new(), test_params())
}

fn start_node_with_chain(chain: Blockchain, params: NetParams) -> Node {
    let node = Node::new(Account::generate().unwrap(), chain, params);
    node.start().unwrap();

    node
}

fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    while Instant::now() < deadline {
        if cond() {
            return true;
        }

        thread::sleep(Duration::from_millis(20));
    }

    cond()
}

/// Queues a transfer from the chain creator and mines it into a block.
fn mine_transfer(node: &Node, to: &Account, value: u64) {
    node.with_state(|s| {
        let creator = s.blockchain.creator().clone();
        assert!(s
            .blockchain
            .submit_transaction(&creator, &[CoinTransfer::to_account(to, value)]));
    });

    assert!(node.mine() > 0);
}

/// A hand-driven peer speaking the wire protocol directly, for exercising
/// exact message flows against a real node.
struct TestPeer {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    listen_port: u16,
}

impl TestPeer {
    fn connect(node_port: u16, listen_port: u16) -> Self {
        let writer = TcpStream::connect(("127.0.0.1", node_port)).unwrap();
        writer
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let reader = BufReader::new(writer.try_clone().unwrap());

        Self {
            writer,
            reader,
            listen_port,
        }
    }

    fn advertised_endpoint(&self) -> String {
        endpoint("127.0.0.1", self.listen_port)
    }

    fn send(&mut self, msg: &Message) {
        self.writer.write_all(msg.to_line().as_bytes()).unwrap();
    }

    fn send_version(&mut self, protocol_version: u32) {
        let msg = Message::new(
            MAINNET_START_STRING,
            codes::VERSION,
            json!({
                "version": protocol_version,
                "services": 1,
                "timestamp": 0.0,
                "addrReceivServices": 1,
                "ipAddress": "127.0.0.1",
                "port": self.listen_port,
            }),
        );

        self.send(&msg);
    }

    /// Reads one full line, riding out read timeouts until the deadline.
    fn recv(&mut self, timeout_ms: u64) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut line = String::new();

        loop {
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => return Message::from_line(&line).ok(),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                Err(_) => return None,
            };
        }
    }

    /// Reads messages until one with the wanted command code arrives.
    fn recv_command(&mut self, command: u32, timeout_ms: u64) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        while Instant::now() < deadline {
            if let Some(msg) = self.recv(200) {
                if msg.command() == command {
                    return Some(msg);
                }
            }
        }

        None
    }

    /// Completes the handshake from the dialing side.
    fn handshake(&mut self) {
        self.send_version(PROTOCOL_VERSION);
        self.recv_command(codes::VERSION, 2000)
            .expect("peer answered with its version");
        self.send(&verack_message(MAINNET_START_STRING));
        self.recv_command(codes::VERACK, 2000)
            .expect("peer confirmed with verack");
    }

    /// True once the node closes the connection.
    fn wait_eof(&mut self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut line = String::new();

        while Instant::now() < deadline {
            line.clear();

            match self.reader.read_line(&mut line) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => return true,
            };
        }

        false
    }
}

#[test]
fn handshake_populates_both_peer_tables() {
    let a = start_node();
    let b = start_node();

    a.connect_to("127.0.0.1", b.port()).unwrap();

    assert!(wait_until(5000, || {
        a.peers().contains(&b.listen_endpoint()) && b.peers().contains(&a.listen_endpoint())
    }));

    assert!(wait_until(5000, || {
        a.with_state(|s| s.connected_count()) == 1 && b.with_state(|s| s.connected_count()) == 1
    }));

    a.stop();
    b.stop();
}

#[test]
fn connecting_to_self_is_dropped() {
    let a = start_node();

    a.connect_to("127.0.0.1", a.port()).unwrap();

    assert!(wait_until(5000, || a.with_state(|s| s.connection_count()) == 0));
    assert!(!a.peers().contains(&a.listen_endpoint()));

    a.stop();
}

// The protocol version is a compile-time constant, so two in-process nodes
// can never disagree about it; only the rejecting side of a mismatched
// handshake can be driven here, via a hand-rolled peer.
#[test]
fn version_mismatch_draws_a_reject_and_no_peer_entry() {
    let a = start_node();

    let mut peer = TestPeer::connect(a.port(), 39001);
    peer.send_version(PROTOCOL_VERSION + 1);

    let reject = peer
        .recv_command(codes::REJECT, 3000)
        .expect("node rejected the version");
    let data: RejectData = reject.data().unwrap();
    assert_eq!(data.msg_rejected_type, "version");
    assert_eq!(data.reject_code, 1);

    assert!(peer.wait_eof(3000));
    assert!(!a.peers().contains(&peer.advertised_endpoint()));

    a.stop();
}

#[test]
fn addr_union_is_idempotent_and_excludes_self() {
    let a = start_node();
    let own_endpoint = a.listen_endpoint();

    let mut peer = TestPeer::connect(a.port(), 39002);
    peer.handshake();

    let addrs = Message::new(
        MAINNET_START_STRING,
        codes::ADDR,
        json!({
            "ipAddresses": ["10.0.0.1_8010", "10.0.0.2_8010", "10.0.0.1_8010", own_endpoint],
            "ipAddressCount": 4,
        }),
    );

    peer.send(&addrs);
    assert!(wait_until(3000, || a.peers().len() >= 3));
    let after_first = a.peers();

    peer.send(&addrs);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(a.peers(), after_first);

    let mut expected = vec![
        peer.advertised_endpoint(),
        String::from("10.0.0.1_8010"),
        String::from("10.0.0.2_8010"),
    ];
    let mut actual = after_first.clone();
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);

    a.stop();
}

#[test]
fn ping_is_answered_with_an_echoing_pong() {
    let a = start_node();

    let mut peer = TestPeer::connect(a.port(), 39003);
    peer.handshake();

    peer.send(&ping_message(MAINNET_START_STRING, 7777));

    let pong = peer
        .recv_command(codes::PONG, 3000)
        .expect("node answered the ping");
    let data: PingData = pong.data().unwrap();
    assert_eq!(data.nonce, 7777);

    a.stop();
}

#[test]
fn idle_connections_are_pinged() {
    let mut params = test_params();
    params.inactivity_tick_secs = 1;
    params.ping_limit_secs = 1;
    params.close_limit_secs = 3600;

    let a = start_node_with_chain(Blockchain::new(), params);

    let mut peer = TestPeer::connect(a.port(), 39004);
    peer.handshake();

    // Stay silent; the inactivity timer should ping us.
    assert!(peer.recv_command(codes::PING, 8000).is_some());

    a.stop();
}

#[test]
fn idle_connections_past_the_close_limit_are_dropped() {
    let mut params = test_params();
    params.inactivity_tick_secs = 1;
    params.ping_limit_secs = 1;
    params.close_limit_secs = 2;

    let a = start_node_with_chain(Blockchain::new(), params);

    let mut peer = TestPeer::connect(a.port(), 39005);
    peer.handshake();

    assert!(peer.wait_eof(15000));
    assert!(wait_until(3000, || a.with_state(|s| s.connection_count()) == 0));

    a.stop();
}

#[test]
fn getblocks_inv_getdata_deliver_the_missing_blocks() {
    let base = Blockchain::new();
    let a = start_node_with_chain(base.clone(), test_params());
    let recipient = Account::generate().unwrap();

    mine_transfer(&a, &recipient, 10);
    mine_transfer(&a, &recipient, 20);

    let genesis_hash = a.with_state(|s| s.blockchain.chain()[0].header_hash());

    let mut peer = TestPeer::connect(a.port(), 39006);
    peer.handshake();

    peer.send(&getblocks_message(MAINNET_START_STRING, &genesis_hash));

    let inv = peer.recv_command(codes::INV, 3000).expect("node sent an inv");
    let inv_data: InvData = inv.data().unwrap();
    assert_eq!(inv_data.count, 2);

    let items = inv_data
        .inventory
        .iter()
        .map(|i| block_inventory_item(&i.identifier))
        .collect();
    peer.send(&getdata_message(MAINNET_START_STRING, items));

    let first = peer.recv_command(codes::BLOCK, 3000).expect("first block");
    let second = peer.recv_command(codes::BLOCK, 3000).expect("second block");

    let first_data: BlockData = first.data().unwrap();
    let second_data: BlockData = second.data().unwrap();
    let blocks = vec![
        decode_block(&first_data).unwrap(),
        decode_block(&second_data).unwrap(),
    ];

    assert_eq!(blocks[0].block_number, 1);
    assert_eq!(blocks[1].block_number, 2);

    a.stop();
}

#[test]
fn unknown_getblocks_hash_advertises_from_just_after_genesis() {
    let a = start_node_with_chain(Blockchain::new(), test_params());
    let recipient = Account::generate().unwrap();

    mine_transfer(&a, &recipient, 10);

    let mut peer = TestPeer::connect(a.port(), 39007);
    peer.handshake();

    peer.send(&getblocks_message(MAINNET_START_STRING, "deadbeef"));

    let inv = peer.recv_command(codes::INV, 3000).expect("node sent an inv");
    let inv_data: InvData = inv.data().unwrap();

    assert_eq!(inv_data.count, 1);

    a.stop();
}

#[test]
fn a_fresh_node_downloads_the_longer_chain() {
    let base = Blockchain::new();
    let recipient = Account::generate().unwrap();

    let a = start_node_with_chain(base.clone(), test_params());
    let b = start_node_with_chain(base, test_params());

    mine_transfer(&a, &recipient, 10);
    mine_transfer(&a, &recipient, 20);

    b.connect_to("127.0.0.1", a.port()).unwrap();
    assert!(wait_until(5000, || {
        b.with_state(|s| s.connected_count()) == 1
    }));

    b.sync_with_peers();

    assert!(wait_until(8000, || {
        b.with_state(|s| s.blockchain.chain().len()) == 3
    }));

    b.with_state(|s| {
        assert!(s.blockchain.validate());
        assert_eq!(s.blockchain.account_total(&recipient.address()), 30);
    });

    a.stop();
    b.stop();
}

#[test]
fn mined_blocks_propagate_to_connected_peers() {
    let base = Blockchain::new();
    let recipient = Account::generate().unwrap();

    let a = start_node_with_chain(base.clone(), test_params());
    let b = start_node_with_chain(base, test_params());

    b.connect_to("127.0.0.1", a.port()).unwrap();
    assert!(wait_until(5000, || {
        a.with_state(|s| s.connected_count()) == 1 && b.with_state(|s| s.connected_count()) == 1
    }));

    mine_transfer(&a, &recipient, 25);

    assert!(wait_until(8000, || {
        b.with_state(|s| s.blockchain.chain().len()) == 2
    }));

    b.with_state(|s| {
        assert!(s.blockchain.validate());
        assert_eq!(s.blockchain.account_total(&recipient.address()), 25);
    });

    a.stop();
    b.stop();
}

#[test]
fn fresh_nodes_do_not_trigger_an_initial_block_download() {
    let a = start_node();

    assert!(!a.with_state(|s| s.should_start_sync()));

    a.stop();
}
