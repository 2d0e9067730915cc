//! Error types for server startup and the resource pools.
//!
//! Connection-level I/O failures never surface here; they are handled
//! where they happen and end at most that one connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] mysql::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
