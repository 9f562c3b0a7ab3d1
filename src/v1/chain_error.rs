use std::{
    error::{self, Error as StdError},
    fmt,
};

use serde::{Deserialize, Serialize};

pub type ChainResult<T> = std::result::Result<T, ChainError>;

pub type ChainError = Box<ErrorKind>;

#[derive(Debug, Serialize, Deserialize)]
pub enum ErrorKind {
    BadSignature(String),
    /// (spendable, required)
    InsufficientFunds(u64, u64),
    MissingScriptSig(String),
    ScriptRejected(String, usize),
}

impl StdError for ErrorKind {
    fn description(&self) -> &str {
        match *self {
            ErrorKind::BadSignature(_) => "Transaction signature does not verify",
            ErrorKind::InsufficientFunds(_, _) => "Sender cannot cover the transfer total",
            ErrorKind::MissingScriptSig(_) => "Transaction carries no unlocking script",
            ErrorKind::ScriptRejected(_, _) => "Locking script rejected the spend",
        }
    }

    fn cause(&self) -> Option<&dyn error::Error> {
        None
    }
}

impl fmt::Display for ErrorKind {
    #[allow(deprecated)]
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &*self {
            ErrorKind::BadSignature(tx_hash) => {
                write!(fmt, "{}: tx: {}", self.description(), tx_hash)
            }
            ErrorKind::InsufficientFunds(spendable, required) => write!(
                fmt,
                "{}: spendable: {}, required: {}",
                self.description(),
                spendable,
                required
            ),
            ErrorKind::MissingScriptSig(tx_hash) => {
                write!(fmt, "{}: tx: {}", self.description(), tx_hash)
            }
            ErrorKind::ScriptRejected(tx_hash, input_idx) => write!(
                fmt,
                "{}: tx: {}, input: {}",
                self.description(),
                tx_hash,
                input_idx
            ),
        }
    }
}
