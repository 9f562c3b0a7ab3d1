use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical;
use crate::hash::double_sha256;
use crate::obolscript_interpreter::script_sig_parts;
use crate::wallet::{verify_signature, Account};

use super::VERSION;

/// Sender/recipient marker for synthetic outputs that no key owns (the
/// genesis seed).
pub const SYSTEM_ADDRESS: &str = "-";

/// An instruction to move obols to one recipient. A transaction is built
/// from a batch of these.
#[derive(Debug, Clone)]
pub struct CoinTransfer {
    /// Recipient account address.
    pub recipient: String,
    /// Recipient public-key fingerprint, embedded in the locking script.
    pub recipient_pub_key_hash: String,
    pub value: u64,
}

impl CoinTransfer {
    pub fn new(recipient: &str, recipient_pub_key_hash: &str, value: u64) -> Self {
        Self {
            recipient: recipient.to_owned(),
            recipient_pub_key_hash: recipient_pub_key_hash.to_owned(),
            value,
        }
    }

    /// Transfer addressed to an account's own identifiers.
    pub fn to_account(account: &Account, value: u64) -> Self {
        Self::new(&account.address(), &account.pub_key_hash(), value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxInput {
    /// Hash of the transaction whose output is being spent.
    pub prev_tx_hash: String,
    /// Index of that output in the previous transaction.
    pub prev_tx_out_index: usize,
    /// Unlocking script: `<sig> <pubKey>`.
    pub script_sig: String,
    pub value: u64,
    /// Informational: who the spent output was addressed to.
    pub recipient: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub value: u64,
    pub sender: String,
    pub recipient: String,
    /// Locking script: `dup hash160 <pubKeyHash> equalVerify checkSig`.
    pub script_pub_key: String,
}

impl TxOutput {
    /// Canonical rendering of this output, as embedded in transaction
    /// preimages.
    pub fn canonical_text(&self) -> String {
        canonical::render(vec![
            ("recipient", json!(self.recipient)),
            ("scriptPubKey", json!(self.script_pub_key)),
            ("sender", json!(self.sender)),
            ("value", json!(self.value)),
        ])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Transaction {
    pub sender_address: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub version: u32,
    pub in_counter: usize,
    pub out_counter: usize,
    pub tx_hash: String,
    pub signature: String,
    pub block_number: Option<usize>,
}

impl Transaction {
    pub fn new(sender_address: &str) -> Self {
        Self {
            sender_address: sender_address.to_owned(),
            inputs: vec![],
            outputs: vec![],
            version: VERSION,
            in_counter: 0,
            out_counter: 0,
            tx_hash: String::new(),
            signature: String::new(),
            block_number: None,
        }
    }

    pub fn add_output(&mut self, output: TxOutput) {
        self.outputs.push(output);
        self.out_counter += 1;
    }

    pub fn extend_inputs(&mut self, inputs: Vec<TxInput>) {
        self.in_counter += inputs.len();
        self.inputs.extend(inputs);
    }

    /// Swaps in a freshly selected input set, e.g. when the executing node
    /// re-selects from the current pool. The signed preimage does not cover
    /// inputs, so this never invalidates the signature.
    pub fn replace_inputs(&mut self, inputs: Vec<TxInput>) {
        self.in_counter = inputs.len();
        self.inputs = inputs;
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().fold(0, |a, e| a + e.value)
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().fold(0, |a, e| a + e.value)
    }

    /// The outputs covered by the transaction hash and signature: everything
    /// except change back to the sender.
    pub fn signed_outputs(&self) -> Vec<&TxOutput> {
        self.outputs
            .iter()
            .filter(|o| o.recipient != self.sender_address)
            .collect()
    }

    /// The canonical preimage for hashing and signing. Inputs are excluded
    /// so that input selection at mining time cannot invalidate the
    /// signature, and change outputs are excluded because they are appended
    /// after signing.
    pub fn canonical_preimage(&self) -> String {
        let signed = self.signed_outputs();
        let output_list = signed
            .iter()
            .map(|o| o.canonical_text())
            .collect::<String>();

        canonical::render(vec![
            ("sender", json!(self.sender_address)),
            ("txOutputList", json!(output_list)),
            ("versionNo", json!(self.version)),
            ("outCounter", json!(signed.len())),
        ])
    }

    pub fn compute_tx_hash(&self) -> String {
        double_sha256(&self.canonical_preimage())
    }

    pub fn set_tx_hash(&mut self) {
        self.tx_hash = self.compute_tx_hash();
    }

    /// Signs the transaction hash with the sender's key.
    pub fn sign_with(&mut self, account: &Account) -> Result<(), Box<dyn std::error::Error>> {
        self.signature = account.sign(&self.tx_hash)?;

        Ok(())
    }

    /// The sender's public key, recovered from the first input's unlocking
    /// script.
    pub fn sender_public_key(&self) -> Option<String> {
        self.inputs
            .first()
            .and_then(|i| script_sig_parts(&i.script_sig))
            .map(|(_, public_key)| public_key)
    }

    /// Checks the stored hash against the canonical preimage and the
    /// signature against the sender's public key.
    pub fn verify(&self) -> bool {
        if self.tx_hash != self.compute_tx_hash() {
            return false;
        }

        match self.sender_public_key() {
            Some(public_key) => verify_signature(&self.tx_hash, &self.signature, &public_key),
            None => false,
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.tx_hash == other.tx_hash
    }
}

impl PartialEq<str> for Transaction {
    fn eq(&self, other: &str) -> bool {
        self.tx_hash == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obolscript_interpreter::pay_to_pub_key_hash;

    fn output_to(sender: &str, recipient: &str, value: u64) -> TxOutput {
        TxOutput {
            value,
            sender: sender.to_owned(),
            recipient: recipient.to_owned(),
            script_pub_key: pay_to_pub_key_hash("00112233445566778899aabbccddeeff00112233"),
        }
    }

    #[test]
    fn hash_ignores_change_outputs() {
        let mut tx = Transaction::new("alice");
        tx.add_output(output_to("alice", "bob", 30));
        tx.set_tx_hash();
        let before = tx.tx_hash.clone();

        // Change back to the sender, appended at mining time.
        tx.add_output(output_to("alice", "alice", 70));

        assert_eq!(tx.compute_tx_hash(), before);
    }

    #[test]
    fn hash_covers_real_outputs() {
        let mut tx = Transaction::new("alice");
        tx.add_output(output_to("alice", "bob", 30));
        tx.set_tx_hash();
        let before = tx.tx_hash.clone();

        tx.add_output(output_to("alice", "carol", 10));

        assert_ne!(tx.compute_tx_hash(), before);
    }

    #[test]
    fn signature_survives_input_reselection() {
        let account = Account::generate().unwrap();
        let mut tx = Transaction::new(&account.address());
        tx.add_output(output_to(&account.address(), "bob", 30));
        tx.extend_inputs(vec![TxInput {
            prev_tx_hash: String::from("aa"),
            prev_tx_out_index: 0,
            script_sig: crate::obolscript_interpreter::script_sig(
                "sig",
                account.public_key_hex(),
            ),
            value: 100,
            recipient: account.address(),
        }]);
        tx.set_tx_hash();
        tx.sign_with(&account).unwrap();
        assert!(tx.verify());

        let replacement = TxInput {
            prev_tx_hash: String::from("bb"),
            prev_tx_out_index: 1,
            script_sig: tx.inputs[0].script_sig.clone(),
            value: 50,
            recipient: account.address(),
        };
        tx.replace_inputs(vec![replacement]);

        assert!(tx.verify());
    }

    #[test]
    fn verify_rejects_a_tampered_recipient() {
        let account = Account::generate().unwrap();
        let mut tx = Transaction::new(&account.address());
        tx.add_output(output_to(&account.address(), "bob", 30));
        tx.extend_inputs(vec![TxInput {
            prev_tx_hash: String::from("aa"),
            prev_tx_out_index: 0,
            script_sig: crate::obolscript_interpreter::script_sig(
                "sig",
                account.public_key_hex(),
            ),
            value: 100,
            recipient: account.address(),
        }]);
        tx.set_tx_hash();
        tx.sign_with(&account).unwrap();

        tx.outputs[0].recipient = String::from("mallory");

        assert!(!tx.verify());
    }
}
