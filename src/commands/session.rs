use std::error::Error;
use std::io::{self, BufRead, Write};

use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::{
    command::{dispatch_command, Args, Command, CommandMap},
    v1::net::Node,
    v1::transaction::CoinTransfer,
};

fn balance(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();

    let (address, confirmed, spendable) = node.with_state(|s| {
        let account = s.account.clone();
        let address = account.address();
        let confirmed = s.blockchain.account_total(&address);
        let spendable = s.blockchain.spendable_balance(&account);

        (address, confirmed, spendable)
    });

    println!("Address: {}", address);
    println!("Balance: {} obols ({} spendable)", confirmed, spendable);

    Ok(())
}

fn totals(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();
    let totals = node.with_state(|s| s.blockchain.account_totals());

    println!("--- ACCOUNT TOTALS ---");
    for (address, total) in totals {
        println!("{}: {}", address, total);
    }

    Ok(())
}

fn send(args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();
    let recipient = args.require(0, "recipient-address")?;
    let pub_key_hash = args.require(1, "recipient-pubkeyhash")?;
    let amount = args.require(2, "amount")?.parse::<u64>()?;

    let transfer = CoinTransfer::new(&recipient, &pub_key_hash, amount);

    match node.submit_transfers(&[transfer]) {
        true => println!("Queued a transfer of {} obols to {}", amount, recipient),
        false => println!("Transfer dropped: not enough spendable obols"),
    };

    Ok(())
}

fn mine(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap().clone();

    let pending = node.with_state(|s| s.blockchain.pending().len());
    if pending == 0 {
        println!("Nothing to mine");
        return Ok(());
    }

    let handle = std::thread::Builder::new()
        .name(String::from("miner"))
        .spawn_with_priority(ThreadPriority::Max, move |_| node.mine())?;

    match handle.join() {
        Ok(0) => println!("No pending transaction survived validation; no block appended"),
        Ok(count) => println!("Mined a block with {} transaction(s)", count),
        Err(_) => println!("Miner thread crashed"),
    };

    Ok(())
}

fn peers(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();
    let (peers, connected) = node.with_state(|s| (s.peers().to_vec(), s.connected_count()));

    println!("{} known peer(s), {} live connection(s)", peers.len(), connected);
    for peer in peers {
        println!("\t{}", peer);
    }

    Ok(())
}

fn connect(args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();
    let host = args.require(0, "host")?;
    let port = args.require(1, "port")?.parse::<u16>()?;

    node.connect_to(&host, port)?;
    println!("Opened handshake with {}:{}", host, port);

    Ok(())
}

fn discover(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    state.unwrap().request_peer_addresses();
    println!("Asked peers for their address lists");

    Ok(())
}

fn sync(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    state.unwrap().sync_with_peers();
    println!("Asked peers for blocks after our tip");

    Ok(())
}

fn resolve(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    state.unwrap().resolve_conflicts();
    println!("Asked peers for their chains");

    Ok(())
}

fn chain_info(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let node = state.unwrap();

    node.with_state(|s| {
        println!(
            "{} block(s), {} unspent output(s)",
            s.blockchain.chain().len(),
            s.blockchain.utxo_pool().len()
        );

        for block in s.blockchain.chain() {
            println!(
                "\t#{} {} ({} txs)",
                block.block_number,
                block.header_hash(),
                block.transactions.len()
            );
        }
    });

    Ok(())
}

fn validate(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    let valid = state.unwrap().with_state(|s| s.blockchain.validate());

    println!("Chain is {}", if valid { "valid" } else { "NOT valid" });

    Ok(())
}

fn exit(_args: &Args, state: Option<&Node>) -> Result<(), Box<dyn Error>> {
    state.unwrap().stop();
    std::process::exit(0);
}

pub fn make_session_command_map<'a>() -> CommandMap<&'a Node> {
    let mut map: CommandMap<&'a Node> = CommandMap::new();

    map.insert(
        String::from("balance"),
        Command::new(balance, "balance", "Show this wallet's balance"),
    );

    map.insert(
        String::from("totals"),
        Command::new(
            totals,
            "totals",
            "Show the totals of every address with unspent outputs",
        ),
    );

    map.insert(
        String::from("send"),
        Command::new(
            send,
            "send <recipient-address> <recipient-pubkeyhash> <amount>",
            "Queue a transfer to one recipient",
        ),
    );

    map.insert(
        String::from("mine"),
        Command::new(mine, "mine", "Mine the pending transactions into a block"),
    );

    map.insert(
        String::from("peers"),
        Command::new(peers, "peers", "Show the peer table and live connections"),
    );

    map.insert(
        String::from("connect"),
        Command::new(connect, "connect <host> <port>", "Connect to another node"),
    );

    map.insert(
        String::from("discover"),
        Command::new(
            discover,
            "discover",
            "Ask connected peers for more peer addresses",
        ),
    );

    map.insert(
        String::from("sync"),
        Command::new(sync, "sync", "Download blocks after our tip from peers"),
    );

    map.insert(
        String::from("resolve"),
        Command::new(resolve, "resolve", "Poll peers for longer chains"),
    );

    map.insert(
        String::from("chain"),
        Command::new(chain_info, "chain", "Show the local chain"),
    );

    map.insert(
        String::from("validate"),
        Command::new(validate, "validate", "Validate the local chain"),
    );

    map.insert(
        String::from("exit"),
        Command::new(exit, "exit", "Stop the node and exit"),
    );

    map
}

/// The interactive session loop: reads commands from stdin until the process
/// exits.
pub fn listen_for_commands(node: &Node) {
    let map = make_session_command_map();
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Err(_) | Ok(0) => break,
            Ok(_) => (),
        };

        let args: Vec<String> = line.split_whitespace().map(|s| s.to_owned()).collect();

        if args.is_empty() {
            continue;
        }

        dispatch_command(&args, &map, Some(node));
    }
}
