//! The wire format: one JSON object per line, UTF-8, newline-terminated.
//! Every message is an envelope of `msgHeader` (start string, integer
//! command code, payload size, checksum) and a command-specific `msgData`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::hash::payload_checksum;

use super::block::Block;
use super::net_error::ErrorKind::MalformedMessage;
use super::net_error::NetResult;
use super::params::{unix_time, NODE_SERVICE_FULL, PROTOCOL_VERSION};

/// Data message command codes (1–49).
pub mod codes {
    pub const BLOCK: u32 = 1;
    pub const GETBLOCKS: u32 = 2;
    pub const GETDATA: u32 = 3;
    pub const GETHEADERS: u32 = 4;
    pub const HEADERS: u32 = 5;
    pub const INV: u32 = 6;
    pub const MEMPOOL: u32 = 7;
    pub const MERKLEBLOCK: u32 = 8;
    pub const CMPCTBLOCK: u32 = 9;
    pub const SENDCMPCT: u32 = 10;
    pub const GETBLOCKTXN: u32 = 11;
    pub const BLOCKTXN: u32 = 12;
    pub const NOTFOUND: u32 = 13;
    pub const TX: u32 = 14;

    // Control message command codes (50+).
    pub const ADDR: u32 = 50;
    pub const GETADDR: u32 = 51;
    pub const VERSION: u32 = 52;
    pub const VERACK: u32 = 53;
    pub const PING: u32 = 54;
    pub const PONG: u32 = 55;
    pub const REJECT: u32 = 56;
}

pub const REJECT_CODE_DIF_VERSION: u32 = 1;

pub const INV_TYPE_TX: u32 = 1;
pub const INV_TYPE_BLOCK: u32 = 2;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub start_string: String,
    pub command_name: u32,
    pub payload_size: usize,
    pub check_sum: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub msg_header: MessageHeader,
    pub msg_data: Value,
}

impl Message {
    pub fn new(start_string: &str, command_name: u32, msg_data: Value) -> Self {
        let payload = msg_data.to_string();

        Self {
            msg_header: MessageHeader {
                start_string: start_string.to_owned(),
                command_name,
                payload_size: payload.len(),
                check_sum: payload_checksum(&payload),
            },
            msg_data,
        }
    }

    pub fn command(&self) -> u32 {
        self.msg_header.command_name
    }

    /// The newline-terminated line this message travels as.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("Messages always serialize");
        line.push('\n');

        line
    }

    pub fn from_line(line: &str) -> NetResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|err| Box::new(MalformedMessage(err.to_string())))
    }

    /// Deserializes the payload into a typed shape.
    pub fn data<T: DeserializeOwned>(&self) -> NetResult<T> {
        serde_json::from_value(self.msg_data.clone())
            .map_err(|err| Box::new(MalformedMessage(err.to_string())))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionData {
    pub version: u32,
    pub services: u32,
    pub timestamp: f64,
    pub addr_receiv_services: u32,
    pub ip_address: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RejectData {
    pub msg_rejected_type: String,
    pub reject_code: u32,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AddrData {
    pub ip_addresses: Vec<String>,
    pub ip_address_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PingData {
    pub nonce: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GetBlocksData {
    pub header_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InventoryItem {
    #[serde(rename = "type")]
    pub item_type: u32,
    pub identifier: String,
}

/// Payload of both `inv` and `getdata`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InvData {
    pub inventory: Vec<InventoryItem>,
    pub count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BlockData {
    pub payload: String,
}

pub fn version_message(start_string: &str, ip_address: &str, port: u16) -> Message {
    Message::new(
        start_string,
        codes::VERSION,
        json!({
            "version": PROTOCOL_VERSION,
            "services": NODE_SERVICE_FULL,
            "timestamp": unix_time(),
            "addrReceivServices": NODE_SERVICE_FULL,
            "ipAddress": ip_address,
            "port": port,
        }),
    )
}

pub fn verack_message(start_string: &str) -> Message {
    Message::new(start_string, codes::VERACK, json!({}))
}

pub fn reject_message(
    start_string: &str,
    msg_rejected_type: &str,
    reject_code: u32,
    reason: Option<&str>,
) -> Message {
    Message::new(
        start_string,
        codes::REJECT,
        json!({
            "msgRejectedType": msg_rejected_type,
            "rejectCode": reject_code,
            "reason": reason,
        }),
    )
}

pub fn getaddr_message(start_string: &str) -> Message {
    Message::new(start_string, codes::GETADDR, json!({}))
}

pub fn addr_message(start_string: &str, peers: &[String]) -> Message {
    Message::new(
        start_string,
        codes::ADDR,
        json!({
            "ipAddresses": peers,
            "ipAddressCount": peers.len(),
        }),
    )
}

pub fn ping_message(start_string: &str, nonce: u64) -> Message {
    Message::new(start_string, codes::PING, json!({ "nonce": nonce }))
}

pub fn pong_message(start_string: &str, nonce: u64) -> Message {
    Message::new(start_string, codes::PONG, json!({ "nonce": nonce }))
}

pub fn getblocks_message(start_string: &str, header_hash: &str) -> Message {
    Message::new(
        start_string,
        codes::GETBLOCKS,
        json!({ "headerHash": header_hash }),
    )
}

pub fn inv_message(start_string: &str, inventory: Vec<InventoryItem>) -> Message {
    Message::new(
        start_string,
        codes::INV,
        json!({
            "count": inventory.len(),
            "inventory": inventory,
        }),
    )
}

pub fn getdata_message(start_string: &str, inventory: Vec<InventoryItem>) -> Message {
    Message::new(
        start_string,
        codes::GETDATA,
        json!({
            "count": inventory.len(),
            "inventory": inventory,
        }),
    )
}

pub fn block_inventory_item(header_hash: &str) -> InventoryItem {
    InventoryItem {
        item_type: INV_TYPE_BLOCK,
        identifier: header_hash.to_owned(),
    }
}

/// Blocks travel as hex-encoded bincode, which round-trips exactly.
pub fn block_message(start_string: &str, block: &Block) -> NetResult<Message> {
    let bytes =
        bincode::serialize(block).map_err(|err| Box::new(MalformedMessage(err.to_string())))?;

    Ok(Message::new(
        start_string,
        codes::BLOCK,
        json!({ "payload": hex::encode(bytes) }),
    ))
}

pub fn decode_block(data: &BlockData) -> NetResult<Block> {
    let bytes =
        hex::decode(&data.payload).map_err(|err| Box::new(MalformedMessage(err.to_string())))?;

    bincode::deserialize(&bytes).map_err(|err| Box::new(MalformedMessage(err.to_string())))
}
