use std::collections::HashMap;
use std::error::Error;

/// One CLI command: a handler, the usage line `help` prints, and a short
/// description. Argument validation lives in the handlers, which pull what
/// they need out of the parsed [Args].
pub struct Command<T> {
    pub handler: Handler<T>,
    pub usage: String,
    pub desc: String,
}

/// The function that executes a command, given the parsed arguments and the
/// state/context object.
pub type Handler<T> = fn(args: &Args, state: Option<T>) -> Result<(), Box<dyn Error>>;

pub type CommandMap<T> = HashMap<String, Command<T>>;

impl<T> Command<T> {
    pub fn new(handler: Handler<T>, usage: &str, desc: &str) -> Self {
        Self {
            handler,
            usage: usage.to_owned(),
            desc: desc.to_owned(),
        }
    }
}

/// A parsed invocation: positional words in order, `--flag` switches, and
/// `--name=value` options.
pub struct Args {
    positional: Vec<String>,
    flags: Vec<String>,
    options: HashMap<String, String>,
}

impl Args {
    pub fn parse(raw: &[String]) -> Self {
        let mut positional: Vec<String> = vec![];
        let mut flags: Vec<String> = vec![];
        let mut options: HashMap<String, String> = HashMap::new();

        for word in raw {
            match word.strip_prefix("--") {
                None => positional.push(word.clone()),
                Some(special) => match special.split_once('=') {
                    Some((name, value)) => {
                        options.insert(name.to_owned(), value.to_owned());
                    }
                    None => flags.push(special.to_owned()),
                },
            };
        }

        Self {
            positional,
            flags,
            options,
        }
    }

    pub fn pos(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(|s| s.as_str())
    }

    /// The positional word at `index`, or an error naming the missing
    /// argument.
    pub fn require(&self, index: usize, name: &str) -> Result<String, Box<dyn Error>> {
        self.pos(index)
            .map(|s| s.to_owned())
            .ok_or_else(|| format!("Missing argument <{name}>").into())
    }

    /// All positional words from `index` on, joined by spaces. For commands
    /// that take free text, like a script.
    pub fn rest(&self, index: usize) -> Option<String> {
        if index >= self.positional.len() {
            return None;
        }

        Some(self.positional[index..].join(" "))
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }
}

/// Looks up and runs a command. `help` and `help command_name` are built in;
/// a handler error prints the message along with the command's usage line.
pub fn dispatch_command<T>(raw: &[String], map: &CommandMap<T>, state: Option<T>) {
    if raw.is_empty() {
        println!("Missing command. Try 'help'.");
        return;
    }

    let name = &raw[0];

    if name == "help" {
        match raw.get(1) {
            None => help(map),
            Some(cmd_name) => help_command(map, cmd_name),
        };

        return;
    }

    let command = match map.get(name) {
        Some(command) => command,
        None => {
            println!("Unrecognized command: {name}");
            return;
        }
    };

    let args = Args::parse(&raw[1..]);

    if let Err(err) = (command.handler)(&args, state) {
        println!("Error executing {name}: {err}");
        println!("Usage: {}", command.usage);
    }
}

fn help<T>(map: &CommandMap<T>) {
    println!("Supported commands. Do 'help command_name' to see one in detail.\n");

    let mut names: Vec<&String> = map.keys().collect();
    names.sort();

    for name in names {
        let command = &map[name];
        println!("\t{}\n\t\t{}", command.usage, command.desc);
    }
}

fn help_command<T>(map: &CommandMap<T>, name: &str) {
    match map.get(name) {
        None => println!("Unrecognized command: {name}"),
        Some(command) => {
            println!("{}\n", command.desc);
            println!("Usage: {}", command.usage);
        }
    };
}
