use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::hash::hash160;
use crate::obolscript_interpreter::{evaluate, pay_to_pub_key_hash, script_sig};
use crate::wallet::{verify_signature, Account};

use super::block::{
    genesis_block, meets_target, proof_of_work_hash, satisfies_proof_of_work, Block, BlockHeader,
};
use super::chain_error::ChainResult;
use super::chain_error::ErrorKind::{
    BadSignature, InsufficientFunds, MissingScriptSig, ScriptRejected,
};
use super::params::TARGET_THRESHOLD;
use super::transaction::{CoinTransfer, Transaction, TxInput, TxOutput};

/// One unspent output, addressable by `(tx_hash, output_index)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UtxoEntry {
    pub tx_hash: String,
    pub output_index: usize,
    pub output: TxOutput,
}

/// The unspent-output pool. Entries keep insertion order, which is also the
/// order inputs are selected in.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UtxoPool {
    entries: Vec<UtxoEntry>,
}

impl UtxoPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[UtxoEntry] {
        &self.entries
    }

    pub fn get(&self, tx_hash: &str, output_index: usize) -> Option<&UtxoEntry> {
        self.entries
            .iter()
            .find(|e| e.tx_hash == tx_hash && e.output_index == output_index)
    }

    pub fn insert(&mut self, tx_hash: &str, output_index: usize, output: TxOutput) {
        if self.get(tx_hash, output_index).is_some() {
            return;
        }

        self.entries.push(UtxoEntry {
            tx_hash: tx_hash.to_owned(),
            output_index,
            output,
        });
    }

    pub fn remove(&mut self, tx_hash: &str, output_index: usize) -> Option<UtxoEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.tx_hash == tx_hash && e.output_index == output_index)?;

        Some(self.entries.remove(pos))
    }

    /// Entries addressed to an account, in insertion order.
    pub fn owned_by<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a UtxoEntry> {
        self.entries
            .iter()
            .filter(move |e| e.output.recipient == address)
    }

    pub fn account_total(&self, address: &str) -> u64 {
        self.owned_by(address).fold(0, |a, e| a + e.output.value)
    }

    /// Every address holding at least one unspent output.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = vec![];

        for entry in &self.entries {
            if !out.contains(&entry.output.recipient) {
                out.push(entry.output.recipient.clone());
            }
        }

        out
    }
}

/// The chain state engine: the chain itself, its header chain, the UTXO
/// pool, and the pending and confirmed transaction lists. All mutation goes
/// through the operations below; the pool is always exactly the state
/// derived from the chain.
#[derive(Debug, Clone)]
pub struct Blockchain {
    creator: Account,
    chain: Vec<Block>,
    headers: Vec<BlockHeader>,
    utxo_pool: UtxoPool,
    pending: Vec<Transaction>,
    confirmed: Vec<Transaction>,
    target_threshold: u32,
}

impl Blockchain {
    /// A fresh chain with a newly generated creator account holding the
    /// initial supply.
    pub fn new() -> Self {
        let creator = Account::generate().expect("Failed to create the chain account");

        Self::with_creator(creator)
    }

    /// A fresh chain seeded to a caller-supplied creator. Nodes that must
    /// share a genesis block are built from clones of one chain instead.
    pub fn with_creator(creator: Account) -> Self {
        let genesis = genesis_block(&creator);
        let mut utxo_pool = UtxoPool::default();
        apply_block_to_pool(&genesis, &mut utxo_pool);

        Self {
            creator,
            headers: vec![genesis.header.clone()],
            chain: vec![genesis],
            utxo_pool,
            pending: vec![],
            confirmed: vec![],
            target_threshold: TARGET_THRESHOLD,
        }
    }

    pub fn creator(&self) -> &Account {
        &self.creator
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn utxo_pool(&self) -> &UtxoPool {
        &self.utxo_pool
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn confirmed(&self) -> &[Transaction] {
        &self.confirmed
    }

    pub fn tip(&self) -> &Block {
        self.chain.last().expect("The chain always has a genesis block")
    }

    pub fn find_block_position(&self, header_hash: &str) -> Option<usize> {
        self.chain.iter().position(|b| b.header_hash() == header_hash)
    }

    /// Total obols addressed to `address` in the pool.
    pub fn account_total(&self, address: &str) -> u64 {
        self.utxo_pool.account_total(address)
    }

    pub fn account_totals(&self) -> Vec<(String, u64)> {
        self.utxo_pool
            .addresses()
            .into_iter()
            .map(|a| {
                let total = self.utxo_pool.account_total(&a);
                (a, total)
            })
            .collect()
    }

    /// The balance an account can actually spend: the sum of pool entries
    /// whose locking script accepts a freshly built unlocking script for the
    /// account's key. Ownership is proven by the VM, not by the pool's
    /// bookkeeping fields.
    pub fn spendable_balance(&self, account: &Account) -> u64 {
        self.spendable_entries(account)
            .iter()
            .fold(0, |a, (e, _)| a + e.output.value)
    }

    fn spendable_entries(&self, account: &Account) -> Vec<(UtxoEntry, String)> {
        let mut out: Vec<(UtxoEntry, String)> = vec![];

        for entry in self.utxo_pool.entries() {
            let sig = match account.sign(&entry.tx_hash) {
                Ok(sig) => sig,
                Err(_) => continue,
            };
            let unlock = script_sig(&sig, account.public_key_hex());

            if evaluate(&unlock, &entry.output.script_pub_key, &entry.tx_hash) {
                out.push((entry.clone(), unlock));
            }
        }

        out
    }

    /// Builds, signs, and queues a transaction moving obols to each
    /// transfer's recipient. Does nothing when the sender's spendable
    /// balance cannot cover the transfer total.
    pub fn submit_transaction(&mut self, account: &Account, transfers: &[CoinTransfer]) -> bool {
        let required: u64 = transfers.iter().fold(0, |a, t| a + t.value);
        let spendable = self.spendable_entries(account);
        let spendable_total: u64 = spendable.iter().fold(0, |a, (e, _)| a + e.output.value);

        if spendable_total < required {
            debug!(
                "Dropping transfer batch from {}: spendable {} < required {}",
                account.address(),
                spendable_total,
                required
            );
            return false;
        }

        let mut inputs: Vec<TxInput> = vec![];
        let mut selected_total = 0;

        for (entry, unlock) in spendable {
            if selected_total >= required {
                break;
            }

            selected_total += entry.output.value;
            inputs.push(TxInput {
                prev_tx_hash: entry.tx_hash.clone(),
                prev_tx_out_index: entry.output_index,
                script_sig: unlock,
                value: entry.output.value,
                recipient: entry.output.recipient.clone(),
            });
        }

        let mut tx = Transaction::new(&account.address());
        tx.extend_inputs(inputs);

        for transfer in transfers {
            tx.add_output(TxOutput {
                value: transfer.value,
                sender: account.address(),
                recipient: transfer.recipient.clone(),
                script_pub_key: pay_to_pub_key_hash(&transfer.recipient_pub_key_hash),
            });
        }

        tx.set_tx_hash();

        if let Err(err) = tx.sign_with(account) {
            warn!("Failed to sign transaction: {}", err);
            return false;
        }

        self.pending.push(tx);

        true
    }

    /// Queues a transaction received from elsewhere, e.g. another node.
    pub fn add_pending(&mut self, tx: Transaction) {
        if !self.pending.iter().any(|t| t == &tx) {
            self.pending.push(tx);
        }
    }

    /// Runs every pending transaction, in submission order, into a candidate
    /// block. Failed transactions are dropped without affecting the rest.
    /// Returns `None` (and still clears the pending list) when nothing
    /// succeeded; otherwise the candidate is linked to the tip and ready to
    /// mine.
    pub fn prepare_block(&mut self) -> Option<Block> {
        let pending = std::mem::take(&mut self.pending);
        let block_number = self.chain.len();
        let mut block = Block::new(block_number, "", self.target_threshold);

        for mut tx in pending {
            match self.process_transaction(&mut tx, block_number) {
                Ok(()) => {
                    block.add_transaction(tx.clone());
                    self.confirmed.push(tx);
                }
                Err(err) => warn!("Dropping pending transaction: {}", err),
            };
        }

        if block.transactions.is_empty() {
            return None;
        }

        block.header.prev_block_header_hash = self.tip().header_hash();

        Some(block)
    }

    /// Attaches a mined nonce and appends the block. The block is discarded
    /// when the tip moved while it was being mined.
    pub fn append_mined(&mut self, mut block: Block, nonce: u64) -> bool {
        if block.header.prev_block_header_hash != self.tip().header_hash() {
            warn!("Discarding mined block {}: the tip moved", block.block_number);
            return false;
        }

        block.header.nonce = nonce;
        self.headers.push(block.header.clone());
        self.chain.push(block);

        true
    }

    /// The synchronous mining entry point: processes the pending list,
    /// mines, and appends. Returns the number of transactions confirmed.
    pub fn execute_transactions(&mut self) -> usize {
        let block = match self.prepare_block() {
            None => return 0,
            Some(block) => block,
        };

        let count = block.transactions.len();
        let nonce = get_proof_of_work(&block);
        self.append_mined(block, nonce);

        count
    }

    /// Validates and applies a block received from another node. The block
    /// must extend the tip and satisfy its proof of work.
    pub fn apply_external_block(&mut self, block: Block) -> bool {
        if block.header.prev_block_header_hash != self.tip().header_hash() {
            return false;
        }

        if !satisfies_proof_of_work(&block) {
            return false;
        }

        apply_block_to_pool(&block, &mut self.utxo_pool);
        self.confirmed.extend(block.transactions.iter().cloned());
        self.headers.push(block.header.clone());
        self.chain.push(block);

        true
    }

    /// Every block after the trusted genesis must link to its predecessor
    /// and satisfy its stored proof of work.
    pub fn validate(&self) -> bool {
        validate_chain(&self.chain)
    }

    /// Longest-valid-chain conflict resolution over already-fetched
    /// candidate chains. Candidates that are not strictly longer, or that
    /// fail validation, are ignored.
    pub fn resolve_conflicts(&mut self, candidates: Vec<Vec<Block>>) -> bool {
        let mut best: Option<Vec<Block>> = None;

        for candidate in candidates {
            let best_len = best.as_ref().map(|c| c.len()).unwrap_or(self.chain.len());

            if candidate.len() > best_len && validate_chain(&candidate) {
                best = Some(candidate);
            }
        }

        match best {
            Some(chain) => {
                self.replace_chain(chain);
                true
            }
            None => false,
        }
    }

    /// Wholesale chain replacement: the pool, header chain, and confirmed
    /// list are rebuilt from the new blocks.
    pub fn replace_chain(&mut self, chain: Vec<Block>) {
        let mut pool = UtxoPool::default();
        let mut confirmed: Vec<Transaction> = vec![];

        for block in &chain {
            apply_block_to_pool(block, &mut pool);

            if block.block_number > 0 {
                confirmed.extend(block.transactions.iter().cloned());
            }
        }

        self.headers = chain.iter().map(|b| b.header.clone()).collect();
        self.chain = chain;
        self.utxo_pool = pool;
        self.confirmed = confirmed;
    }

    /// Steps 1–5 of transaction execution. Nothing is mutated until every
    /// check has passed; a failed transaction leaves the pool untouched.
    fn process_transaction(&mut self, tx: &mut Transaction, block_number: usize) -> ChainResult<()> {
        let public_key = tx
            .sender_public_key()
            .ok_or_else(|| Box::new(MissingScriptSig(tx.tx_hash.clone())))?;

        // 1. The stored hash must match the canonical preimage and the
        // signature must verify under the sender's key.
        if tx.tx_hash != tx.compute_tx_hash()
            || !verify_signature(&tx.tx_hash, &tx.signature, &public_key)
        {
            return Err(Box::new(BadSignature(tx.tx_hash.clone())));
        }

        // 2. The sender's pool entries must cover the outputs.
        let required = tx.output_total();
        let sender = tx.sender_address.clone();
        let available: u64 = self.utxo_pool.account_total(&sender);

        if available < required {
            return Err(Box::new(InsufficientFunds(available, required)));
        }

        // 3. Greedy selection in pool insertion order. The submitted inputs
        // may be stale by now; selection is redone against the current pool
        // and the submitter's unlocking scripts are carried over by
        // outpoint where they still apply.
        let mut selected: Vec<UtxoEntry> = vec![];
        let mut selected_total = 0;

        for entry in self.utxo_pool.owned_by(&sender) {
            if selected_total >= required {
                break;
            }

            selected_total += entry.output.value;
            selected.push(entry.clone());
        }

        let fallback_sig = tx
            .inputs
            .first()
            .map(|i| i.script_sig.clone())
            .unwrap_or_default();
        let mut inputs: Vec<TxInput> = vec![];

        for (idx, entry) in selected.iter().enumerate() {
            let submitted = tx
                .inputs
                .iter()
                .find(|i| i.prev_tx_hash == entry.tx_hash && i.prev_tx_out_index == entry.output_index)
                .map(|i| i.script_sig.clone());

            // Where the submitter provided an unlocking script for this
            // exact outpoint, the VM has the final say on the spend.
            if let Some(unlock) = &submitted {
                if !evaluate(unlock, &entry.output.script_pub_key, &entry.tx_hash) {
                    return Err(Box::new(ScriptRejected(tx.tx_hash.clone(), idx)));
                }
            }

            inputs.push(TxInput {
                prev_tx_hash: entry.tx_hash.clone(),
                prev_tx_out_index: entry.output_index,
                script_sig: submitted.unwrap_or_else(|| fallback_sig.clone()),
                value: entry.output.value,
                recipient: entry.output.recipient.clone(),
            });
        }

        tx.replace_inputs(inputs);

        // 4. Exactly one change output returns any excess to the sender.
        // Change is excluded from the signed preimage, so the hash is
        // unchanged.
        if selected_total > required {
            tx.add_output(TxOutput {
                value: selected_total - required,
                sender: sender.clone(),
                recipient: sender.clone(),
                script_pub_key: pay_to_pub_key_hash(&hash160(&public_key)),
            });
        }

        // 5. Bookkeeping: consume the selected entries, then record every
        // output of this transaction as unspent.
        tx.block_number = Some(block_number);

        for entry in &selected {
            self.utxo_pool.remove(&entry.tx_hash, entry.output_index);
        }

        for (idx, output) in tx.outputs.iter().enumerate() {
            self.utxo_pool.insert(&tx.tx_hash, idx, output.clone());
        }

        Ok(())
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes a block's inputs from the pool and records its outputs.
fn apply_block_to_pool(block: &Block, pool: &mut UtxoPool) {
    for tx in &block.transactions {
        for input in &tx.inputs {
            pool.remove(&input.prev_tx_hash, input.prev_tx_out_index);
        }

        for (idx, output) in tx.outputs.iter().enumerate() {
            pool.insert(&tx.tx_hash, idx, output.clone());
        }
    }
}

/// Searches nonces from zero until the proof-of-work predicate holds. The
/// search is unbounded and CPU-bound; callers must not hold shared locks
/// while running it.
pub fn get_proof_of_work(block: &Block) -> u64 {
    let mut header = block.header.clone();
    let mut nonce: u64 = 0;

    loop {
        header.nonce = nonce;
        let pow_hash = proof_of_work_hash(
            &header.header_hash(),
            &header.prev_block_header_hash,
            nonce,
        );

        if meets_target(&pow_hash, header.target_threshold) {
            return nonce;
        }

        nonce += 1;
    }
}

/// Chain validity: every block after the trusted genesis links to its
/// predecessor, satisfies its stored proof of work, and carries the Merkle
/// root of its actual transaction content. Recomputing the transaction
/// hashes from the canonical preimages is what catches a swapped
/// transaction list.
pub fn validate_chain(chain: &[Block]) -> bool {
    for i in 1..chain.len() {
        let block = &chain[i];

        if block.header.prev_block_header_hash != chain[i - 1].header_hash() {
            return false;
        }

        if !satisfies_proof_of_work(block) {
            return false;
        }

        let tx_hashes: Vec<String> = block
            .transactions
            .iter()
            .map(|t| t.compute_tx_hash())
            .collect();

        if super::merkle::merkle_root(&tx_hashes) != block.header.merkle_root {
            return false;
        }
    }

    true
}
