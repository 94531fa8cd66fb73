use core::fmt;
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

/// Error for fatal setup paths: config load, bind, fork. Per-connection I/O
/// never becomes a `FatalError`; the state machine absorbs it locally.
pub struct FatalError(pub Box<dyn Error + Send + Sync>);

impl Debug for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR: {}", self.0)
    }
}

impl Error for FatalError {}

#[derive(Debug)]
struct Message(String);

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for Message {}

impl From<std::io::Error> for FatalError {
    fn from(e: std::io::Error) -> Self {
        FatalError(Box::new(e))
    }
}

impl From<serde_yaml::Error> for FatalError {
    fn from(e: serde_yaml::Error) -> Self {
        FatalError(Box::new(e))
    }
}

impl From<std::net::AddrParseError> for FatalError {
    fn from(e: std::net::AddrParseError) -> Self {
        FatalError(Box::new(e))
    }
}

impl From<String> for FatalError {
    fn from(s: String) -> Self {
        FatalError(Box::new(Message(s)))
    }
}

impl From<&str> for FatalError {
    fn from(s: &str) -> Self {
        FatalError(Box::new(Message(s.to_string())))
    }
}

pub type Result<T> = std::result::Result<T, FatalError>;
