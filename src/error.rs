use std::io;
use thiserror::Error;

/// Crate-wide error type.
///
/// Every error maps to one of the tool's exit codes: 1 for environmental
/// problems (I/O, missing files, bad invocation), 2 for corrupt or invalid
/// input data, 3 for an internal consistency error (a bug).
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Environmental problem that is not a raw I/O error.
    #[error("{0}")]
    Env(String),
    /// Corrupt or invalid input data.
    #[error("{0}")]
    Data(String),
    /// Invariant violation inside the implementation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn env(msg: impl Into<String>) -> Self { Error::Env(msg.into()) }
    pub fn data(msg: impl Into<String>) -> Self { Error::Data(msg.into()) }
    pub fn internal(msg: impl Into<String>) -> Self { Error::Internal(msg.into()) }

    /// Prefix an error message with the file it refers to.
    pub fn for_file(self, name: &str) -> Self {
        match self {
            Error::Io(e) => Error::Env(format!("{}: {}", name, e)),
            Error::Env(m) => Error::Env(format!("{}: {}", name, m)),
            Error::Data(m) => Error::Data(format!("{}: {}", name, m)),
            e @ Error::Internal(_) => e,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Env(_) => 1,
            Error::Data(_) => 2,
            Error::Internal(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
