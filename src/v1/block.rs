use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical;
use crate::hash::sha256_hex;
use crate::obolscript_interpreter::pay_to_pub_key_hash;
use crate::wallet::Account;

use super::merkle::merkle_root;
use super::params::{unix_time, BLOCK_VERSION, INITIAL_SUPPLY, TARGET_THRESHOLD};
use super::transaction::{Transaction, TxOutput, SYSTEM_ADDRESS};

/// Previous-hash marker of the genesis block.
pub const GENESIS_PREV_HASH: &str = "-";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_header_hash: String,
    pub merkle_root: Option<String>,
    pub time_start_hashing: f64,
    /// Required number of leading zero hex digits in the proof-of-work hash.
    pub target_threshold: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// SHA-256 over the canonical rendering of the header fields. The nonce
    /// is part of the header, so the hash changes with every mining attempt.
    pub fn header_hash(&self) -> String {
        sha256_hex(&canonical::render(vec![
            ("merkleRoot", json!(self.merkle_root)),
            ("nonce", json!(self.nonce)),
            ("prevBlockHeaderHash", json!(self.prev_block_header_hash)),
            ("targetThreshold", json!(self.target_threshold)),
            ("timeStartHashing", json!(self.time_start_hashing)),
            ("versionNo", json!(self.version)),
        ]))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub block_number: usize,
}

impl Block {
    pub fn new(block_number: usize, prev_block_header_hash: &str, target_threshold: u32) -> Self {
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_block_header_hash: prev_block_header_hash.to_owned(),
                merkle_root: None,
                time_start_hashing: unix_time(),
                target_threshold,
                nonce: 0,
            },
            transactions: vec![],
            block_number,
        }
    }

    pub fn header_hash(&self) -> String {
        self.header.header_hash()
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
        self.refresh_merkle_root();
    }

    pub fn set_transactions(&mut self, transactions: Vec<Transaction>) {
        self.transactions = transactions;
        self.refresh_merkle_root();
    }

    pub fn refresh_merkle_root(&mut self) {
        let tx_hashes: Vec<String> = self.transactions.iter().map(|t| t.tx_hash.clone()).collect();
        self.header.merkle_root = merkle_root(&tx_hashes);
    }

    pub fn get_transaction(&self, tx_hash: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.tx_hash == tx_hash)
    }
}

/// The hash the proof-of-work predicate is evaluated on.
pub fn proof_of_work_hash(header_hash: &str, prev_block_header_hash: &str, nonce: u64) -> String {
    sha256_hex(&format!(
        "{}{}{}",
        header_hash, prev_block_header_hash, nonce
    ))
}

pub fn meets_target(pow_hash: &str, target_threshold: u32) -> bool {
    pow_hash
        .chars()
        .take(target_threshold as usize)
        .all(|c| c == '0')
}

/// Whether a block's stored nonce satisfies its proof of work.
pub fn satisfies_proof_of_work(block: &Block) -> bool {
    let pow_hash = proof_of_work_hash(
        &block.header_hash(),
        &block.header.prev_block_header_hash,
        block.header.nonce,
    );

    meets_target(&pow_hash, block.header.target_threshold)
}

/// Builds the synthetic genesis block: one unsigned transaction seeding the
/// initial supply to the creator. The genesis block is trusted and never
/// validated.
pub fn genesis_block(creator: &Account) -> Block {
    let mut seed = Transaction::new(SYSTEM_ADDRESS);
    seed.add_output(TxOutput {
        value: INITIAL_SUPPLY,
        sender: SYSTEM_ADDRESS.to_owned(),
        recipient: creator.address(),
        script_pub_key: pay_to_pub_key_hash(&creator.pub_key_hash()),
    });
    seed.set_tx_hash();
    seed.block_number = Some(0);

    let mut block = Block::new(0, GENESIS_PREV_HASH, TARGET_THRESHOLD);
    block.add_transaction(seed);

    block
}
