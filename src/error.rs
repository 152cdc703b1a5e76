use std::fmt;

/// Errors surfaced by the consensus core and its facades.
///
/// Mirrors the teacher crate's `crate::error::{Error, Result}` split: a single
/// enum, `Display`-formatted for the few places that print it, and `?`-able
/// from the facade crates we depend on.
#[derive(Debug)]
pub enum Error {
    /// A condition that should be impossible under the protocol was hit.
    /// Fatal: the caller is expected to halt and let a supervisor restart.
    Internal(String),
    /// The durable log facade failed.
    Log(String),
    /// The transport facade failed to deliver or decode an RPC.
    Rpc(String),
    Config(config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Log(msg) => write!(f, "log error: {msg}"),
            Error::Rpc(msg) => write!(f, "rpc error: {msg}"),
            Error::Config(err) => write!(f, "config error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc(status.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Rpc(err.to_string())
    }
}
