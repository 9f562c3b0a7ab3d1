use std::{
    error::{self, Error as StdError},
    fmt,
};

use serde::{Deserialize, Serialize};

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

pub type ScriptError = Box<ErrorKind>;

#[derive(Debug, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownToken(String),
    EqualVerifyFailed,
}

impl StdError for ErrorKind {
    fn description(&self) -> &str {
        match *self {
            ErrorKind::UnknownToken(_) => "Unknown token in script",
            ErrorKind::EqualVerifyFailed => "Expected the top two stack items to be equal",
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
            ErrorKind::UnknownToken(token) => {
                write!(fmt, "{}: token: {}", self.description(), token)
            }
            ErrorKind::EqualVerifyFailed => write!(fmt, "{}", self.description()),
        }
    }
}
