use std::error::Error;

use crate::{
    command::{Args, Command, CommandMap},
    obolscript_interpreter::{execute, ExecutionResult, Value},
    v1::blockchain::Blockchain,
    v1::net::Node,
    v1::params::NetParams,
    wallet::Account,
};

use super::session::listen_for_commands;

fn keygen(args: &Args, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let path = args.require(0, "wallet-path")?;
    let account = Account::generate()?;
    account.save(&path)?;

    println!("Created a new wallet and saved it to {path}. Protect this file!");
    println!("Your address is {}", account.address());
    println!("Your public key hash is {}", account.pub_key_hash());

    Ok(())
}

fn show_address(args: &Args, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let path = args.require(0, "wallet-path")?;
    let account = Account::load(&path)?;

    println!("Address: {}", account.address());
    println!("Public key hash: {}", account.pub_key_hash());

    Ok(())
}

fn run_script(args: &Args, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let script = args.rest(0).ok_or("Missing script text")?;
    let tx_hash = args.option("tx-hash").unwrap_or("");
    let show_stack = args.flag("show-stack");

    let ExecutionResult { top, stack } = execute(&script, tx_hash)?;

    match top {
        None => println!("Stack was empty"),
        Some(Value::Bool(val)) => println!("Bool: {}", val),
        Some(Value::Int(val)) => println!("Int: {}", val),
        Some(Value::Text(val)) => println!("Text: {}", val),
    };

    if show_stack {
        println!("Stack: {:?}", stack);
    }

    Ok(())
}

fn start_node(args: &Args, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let listen_port = args.require(0, "listen-port")?.parse::<u16>()?;
    let wallet_path = args.require(1, "wallet-path")?;
    let listen_ip = args.option("ip").unwrap_or("127.0.0.1").to_owned();

    let account = Account::load(&wallet_path)?;
    println!("Loaded wallet for address {}", account.address());

    let params = match args.flag("testnet") {
        true => NetParams::testnet(&listen_ip, listen_port),
        false => NetParams::mainnet(&listen_ip, listen_port),
    };

    let node = Node::new(account, Blockchain::new(), params);
    node.start()?;

    println!("Node listening on {}", node.listen_endpoint());

    if let (Some(seed_ip), Some(seed_port)) = (args.option("seed-ip"), args.option("seed-port")) {
        let seed_port = seed_port.parse::<u16>()?;
        node.connect_to(seed_ip, seed_port)?;
        println!("Opened handshake with seed node {seed_ip}:{seed_port}");
    }

    println!("Type a command, or 'help' for a list of commands");
    listen_for_commands(&node);

    Ok(())
}

pub fn make_command_map() -> CommandMap<()> {
    let mut map: CommandMap<()> = CommandMap::new();

    map.insert(
        String::from("keygen"),
        Command::new(
            keygen,
            "keygen <wallet-path>",
            "Create a new wallet and print its identifiers",
        ),
    );

    map.insert(
        String::from("address"),
        Command::new(
            show_address,
            "address <wallet-path>",
            "Print the address and public key hash of a wallet",
        ),
    );

    map.insert(
        String::from("run-script"),
        Command::new(
            run_script,
            "run-script <script...> [--tx-hash=<hash>] [--show-stack]",
            "Evaluate a script and print the result",
        ),
    );

    map.insert(
        String::from("start-node"),
        Command::new(
            start_node,
            "start-node <listen-port> <wallet-path> [--ip=<ip>] [--seed-ip=<ip> --seed-port=<port>] [--testnet]",
            "Start a node and open an interactive session",
        ),
    );

    map
}
