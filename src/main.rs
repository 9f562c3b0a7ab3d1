use std::{env, error::Error};

use obol_core::command::dispatch_command;
use obol_core::commands::top_level::make_command_map;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let command_map = make_command_map();
    let args: Vec<String> = env::args().collect();

    dispatch_command(&args[1..], &command_map, None);

    Ok(())
}
