use std::{
    error::{self, Error as StdError},
    fmt,
};

use serde::{Deserialize, Serialize};

pub type NetResult<T> = std::result::Result<T, NetError>;

pub type NetError = Box<ErrorKind>;

#[derive(Debug, Serialize, Deserialize)]
pub enum ErrorKind {
    PortUnavailable(String, u16),
    PeerUnreachable(String),
    MalformedMessage(String),
    NotRunning,
}

impl StdError for ErrorKind {
    fn description(&self) -> &str {
        match *self {
            ErrorKind::PortUnavailable(_, _) => "Listen port is not available",
            ErrorKind::PeerUnreachable(_) => "Peer cannot be reached",
            ErrorKind::MalformedMessage(_) => "Message cannot be decoded",
            ErrorKind::NotRunning => "Node has not been started",
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
            ErrorKind::PortUnavailable(host, port) => {
                write!(fmt, "{}: {}:{}", self.description(), host, port)
            }
            ErrorKind::PeerUnreachable(endpoint) => {
                write!(fmt, "{}: {}", self.description(), endpoint)
            }
            ErrorKind::MalformedMessage(detail) => {
                write!(fmt, "{}: {}", self.description(), detail)
            }
            ErrorKind::NotRunning => write!(fmt, "{}", self.description()),
        }
    }
}
