//! Chain and network parameters. Values here are fixed cluster-wide; a node
//! that changes them is running its own network.

use chrono::Utc;

/// The highest protocol version this node understands.
pub const PROTOCOL_VERSION: u32 = 1;
/// Service bits advertised in version messages. This is a full node.
pub const NODE_SERVICE_FULL: u32 = 1;

pub const MAINNET_PORT: u16 = 8010;
pub const TESTNET_PORT: u16 = 8020;

pub const MAINNET_START_STRING: &str = "0xf9beb4d9";
pub const TESTNET_START_STRING: &str = "0x0b110907";

/// Block format version.
pub const BLOCK_VERSION: u32 = 1;
/// Required number of leading zero hex digits in a proof-of-work hash.
pub const TARGET_THRESHOLD: u32 = 1;
/// Obols seeded to the chain creator by the genesis block.
pub const INITIAL_SUPPLY: u64 = 100;

/// Most blocks a node will advertise in one inv response.
pub const MAX_BLOCKS_PER_INV: usize = 500;
/// Most blocks a node will request in one getdata.
pub const MAX_BLOCKS_PER_GETDATA: usize = 128;

/// Inactivity accounting tick.
pub const CON_INACTIVITY_TICK_SECS: u64 = 300;
/// Idle seconds after which a connection is pinged.
pub const CON_INACTIVITY_PING_LIMIT_SECS: u64 = 1800;
/// Idle seconds after which a connection is closed.
pub const CON_CLOSE_LIMIT_SECS: u64 = 5400;

/// Tip-header age that triggers an initial block download.
pub const IBD_STALE_TIP_SECS: f64 = 86_400.0;
/// Header-chain lead over the block chain that triggers an initial block
/// download.
pub const IBD_HEADER_GAP: usize = 144;

/// Messages with a larger declared payload are dropped unread.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;
/// Malformed lines tolerated before a connection is closed.
pub const MAX_MALFORMED_MSGS: u32 = 3;

/// Per-node network configuration. Tests shrink the timers; production nodes
/// keep the defaults.
#[derive(Debug, Clone)]
pub struct NetParams {
    pub start_string: String,
    pub ip_address: String,
    pub port: u16,
    pub inactivity_tick_secs: u64,
    pub ping_limit_secs: u64,
    pub close_limit_secs: u64,
    pub max_inv_blocks: usize,
    pub max_getdata_blocks: usize,
    pub stale_tip_secs: f64,
    pub header_gap_limit: usize,
}

impl NetParams {
    pub fn mainnet(ip_address: &str, port: u16) -> Self {
        Self {
            start_string: MAINNET_START_STRING.to_owned(),
            ip_address: ip_address.to_owned(),
            port,
            inactivity_tick_secs: CON_INACTIVITY_TICK_SECS,
            ping_limit_secs: CON_INACTIVITY_PING_LIMIT_SECS,
            close_limit_secs: CON_CLOSE_LIMIT_SECS,
            max_inv_blocks: MAX_BLOCKS_PER_INV,
            max_getdata_blocks: MAX_BLOCKS_PER_GETDATA,
            stale_tip_secs: IBD_STALE_TIP_SECS,
            header_gap_limit: IBD_HEADER_GAP,
        }
    }

    pub fn testnet(ip_address: &str, port: u16) -> Self {
        Self {
            start_string: TESTNET_START_STRING.to_owned(),
            ..Self::mainnet(ip_address, port)
        }
    }
}

impl Default for NetParams {
    fn default() -> Self {
        Self::mainnet("127.0.0.1", MAINNET_PORT)
    }
}

/// Seconds since the Unix epoch, as used in message timestamps and block
/// headers.
pub fn unix_time() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
