use obol_core::v1::block::{meets_target, proof_of_work_hash, satisfies_proof_of_work, Block};
use obol_core::v1::blockchain::{get_proof_of_work, validate_chain, Blockchain};
use obol_core::v1::params::INITIAL_SUPPLY;
use obol_core::v1::transaction::CoinTransfer;
use obol_core::wallet::Account;

fn transfer_to(account: &Account, value: u64) -> CoinTransfer {
    CoinTransfer::to_account(account, value)
}

#[test]
fn genesis_seeds_the_creator_balance() {
    let chain = Blockchain::new();
    let creator_address = chain.creator().address();

    assert_eq!(chain.chain().len(), 1);
    assert_eq!(chain.utxo_pool().len(), 1);
    assert_eq!(chain.account_total(&creator_address), INITIAL_SUPPLY);
    assert!(chain.validate());
}

#[test]
fn single_transfer_moves_coins_and_returns_change() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    assert!(chain.submit_transaction(&creator, &[transfer_to(&a, 30)]));
    assert_eq!(chain.execute_transactions(), 1);

    assert_eq!(chain.chain().len(), 2);
    assert_eq!(chain.tip().transactions.len(), 1);
    assert_eq!(chain.account_total(&creator.address()), 70);
    assert_eq!(chain.account_total(&a.address()), 30);
    assert!(chain.validate());
    assert!(chain.pending().is_empty());
}

#[test]
fn spendable_balance_agrees_with_the_pool_for_the_key_owner() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    assert_eq!(chain.spendable_balance(&creator), INITIAL_SUPPLY);

    chain.submit_transaction(&creator, &[transfer_to(&a, 30)]);
    chain.execute_transactions();

    assert_eq!(chain.spendable_balance(&creator), 70);
    assert_eq!(chain.spendable_balance(&a), 30);
}

#[test]
fn oversend_is_rejected_without_a_block() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    assert!(!chain.submit_transaction(&creator, &[transfer_to(&a, 200)]));
    assert_eq!(chain.execute_transactions(), 0);

    assert_eq!(chain.chain().len(), 1);
    assert_eq!(chain.account_total(&creator.address()), INITIAL_SUPPLY);
    assert_eq!(chain.account_total(&a.address()), 0);
}

#[test]
fn partial_batch_confirms_only_the_feasible_transactions() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();
    let b = Account::generate().unwrap();

    assert!(chain.submit_transaction(&creator, &[transfer_to(&a, 10), transfer_to(&b, 30)]));
    assert!(!chain.submit_transaction(&creator, &[transfer_to(&a, 10), transfer_to(&b, 300)]));
    assert!(!chain.submit_transaction(&creator, &[transfer_to(&a, 200), transfer_to(&b, 300)]));
    assert!(chain.submit_transaction(&creator, &[transfer_to(&a, 20), transfer_to(&b, 20)]));

    assert_eq!(chain.execute_transactions(), 2);

    assert_eq!(chain.chain().len(), 2);
    assert_eq!(chain.tip().transactions.len(), 2);
    assert_eq!(chain.account_total(&creator.address()), 20);
    assert_eq!(chain.account_total(&a.address()), 30);
    assert_eq!(chain.account_total(&b.address()), 50);
    assert!(chain.validate());
}

#[test]
fn multiple_senders_share_a_block_and_unknown_senders_are_dropped() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();
    let b = Account::generate().unwrap();
    let c = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 30)]);
    chain.execute_transactions();

    assert!(chain.submit_transaction(&a, &[transfer_to(&b, 20)]));
    assert!(!chain.submit_transaction(&c, &[transfer_to(&b, 50)]));

    assert_eq!(chain.execute_transactions(), 1);

    assert_eq!(chain.account_total(&creator.address()), 70);
    assert_eq!(chain.account_total(&a.address()), 10);
    assert_eq!(chain.account_total(&b.address()), 20);
    assert_eq!(chain.account_total(&c.address()), 0);
    assert!(chain.validate());
}

#[test]
fn accepted_transactions_conserve_value() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();
    let b = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 10), transfer_to(&b, 30)]);
    chain.submit_transaction(&creator, &[transfer_to(&a, 20), transfer_to(&b, 20)]);
    chain.execute_transactions();

    for tx in chain.confirmed() {
        assert_eq!(tx.input_total(), tx.output_total(), "change keeps totals equal");
    }

    // Every obol in the pool traces back to the genesis supply.
    let pool_total: u64 = chain
        .account_totals()
        .iter()
        .fold(0, |acc, (_, total)| acc + total);
    assert_eq!(pool_total, INITIAL_SUPPLY);
}

#[test]
fn change_is_a_single_output_back_to_the_sender() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 30)]);
    chain.execute_transactions();

    let tx = &chain.tip().transactions[0];
    let change: Vec<_> = tx
        .outputs
        .iter()
        .filter(|o| o.recipient == creator.address())
        .collect();

    assert_eq!(change.len(), 1);
    assert_eq!(change[0].value, 70);
    assert_eq!(change[0].sender, creator.address());
}

#[test]
fn proof_of_work_nonce_is_minimal_and_sound() {
    let chain = Blockchain::new();
    let mut block = Block::new(1, &chain.tip().header_hash(), 1);
    block.set_transactions(chain.tip().transactions.clone());

    let nonce = get_proof_of_work(&block);

    block.header.nonce = nonce;
    assert!(satisfies_proof_of_work(&block));

    for smaller in 0..nonce {
        block.header.nonce = smaller;
        let pow_hash = proof_of_work_hash(
            &block.header_hash(),
            &block.header.prev_block_header_hash,
            smaller,
        );
        assert!(!meets_target(&pow_hash, block.header.target_threshold));
    }
}

#[test]
fn tampered_transaction_list_fails_validation() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();
    let b = Account::generate().unwrap();
    let attacker = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 10), transfer_to(&b, 30)]);
    chain.submit_transaction(&creator, &[transfer_to(&a, 20), transfer_to(&b, 20)]);
    chain.execute_transactions();
    assert!(chain.validate());

    let mut tampered = chain.chain().to_vec();
    tampered[1].transactions[0].outputs[0].recipient = attacker.address();

    assert!(!validate_chain(&tampered));

    chain.replace_chain(tampered);
    assert!(!chain.validate());
}

#[test]
fn broken_prev_link_fails_validation() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 30)]);
    chain.execute_transactions();

    let mut tampered = chain.chain().to_vec();
    tampered[1].header.prev_block_header_hash = String::from("0000");

    assert!(!validate_chain(&tampered));
}

#[test]
fn longer_valid_chains_win_conflict_resolution() {
    let base = Blockchain::new();
    let creator = base.creator().clone();
    let a = Account::generate().unwrap();

    // A fork of the same genesis that grew by two blocks.
    let mut longer = base.clone();
    longer.submit_transaction(&creator, &[transfer_to(&a, 30)]);
    longer.execute_transactions();
    longer.submit_transaction(&creator, &[transfer_to(&a, 10)]);
    longer.execute_transactions();

    let mut local = base.clone();
    let candidates = vec![longer.chain().to_vec()];

    assert!(local.resolve_conflicts(candidates));
    assert_eq!(local.chain().len(), 3);
    assert_eq!(local.account_total(&a.address()), 40);
    assert_eq!(local.account_total(&creator.address()), 60);

    // Same length again: nothing to adopt.
    assert!(!local.resolve_conflicts(vec![longer.chain().to_vec()]));

    // Longer but invalid: ignored.
    let mut broken = longer.chain().to_vec();
    broken.push(broken[1].clone());

    assert!(!local.resolve_conflicts(vec![broken]));
    assert_eq!(local.chain().len(), 3);
}

#[test]
fn competing_pending_spends_confirm_only_while_funds_last() {
    let mut chain = Blockchain::new();
    let creator = chain.creator().clone();
    let a = Account::generate().unwrap();

    chain.submit_transaction(&creator, &[transfer_to(&a, 90)]);
    chain.execute_transactions();

    // Creator now holds 10. Both transfers pass the submit-time check, but
    // they compete for the same 10 obols at execution time.
    chain.submit_transaction(&creator, &[transfer_to(&a, 10)]);
    chain.submit_transaction(&creator, &[transfer_to(&a, 10)]);

    assert_eq!(chain.execute_transactions(), 1);
    assert_eq!(chain.account_total(&a.address()), 100);
    assert_eq!(chain.account_total(&creator.address()), 0);
    assert!(chain.pending().is_empty());
    assert!(chain.validate());
}

#[test]
fn forged_script_sig_is_rejected_and_no_block_appended() {
    use obol_core::obolscript_interpreter::{pay_to_pub_key_hash, script_sig};
    use obol_core::v1::transaction::{Transaction, TxInput, TxOutput};

    let mut chain = Blockchain::new();
    let creator_address = chain.creator().address();
    let thief = Account::generate().unwrap();
    let genesis_tx = chain.chain()[0].transactions[0].clone();

    // A transaction claiming the genesis output with the thief's key. The
    // hash and signature are internally consistent; only the unlocking
    // script fails against the output's lock.
    let mut forged = Transaction::new(&creator_address);
    forged.extend_inputs(vec![TxInput {
        prev_tx_hash: genesis_tx.tx_hash.clone(),
        prev_tx_out_index: 0,
        script_sig: script_sig(
            &thief.sign(&genesis_tx.tx_hash).unwrap(),
            thief.public_key_hex(),
        ),
        value: 100,
        recipient: creator_address.clone(),
    }]);
    forged.add_output(TxOutput {
        value: 100,
        sender: creator_address.clone(),
        recipient: thief.address(),
        script_pub_key: pay_to_pub_key_hash(&thief.pub_key_hash()),
    });
    forged.set_tx_hash();
    forged.sign_with(&thief).unwrap();

    chain.add_pending(forged);

    assert_eq!(chain.execute_transactions(), 0);
    assert_eq!(chain.chain().len(), 1);
    assert!(chain.pending().is_empty());
    assert_eq!(chain.account_total(&thief.address()), 0);
    assert_eq!(chain.account_total(&creator_address), 100);
}
