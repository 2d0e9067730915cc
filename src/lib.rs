//! `hearth` — a reactor-style HTTP/1.1 static file server.
//!
//! One thread blocks in epoll and owns the listening socket, the
//! connection table and the idle-timeout heap; parse/respond work runs
//! on a fixed pool of worker threads; static files are served through
//! mmap and vectored writes; form posts to `/login` and `/register`
//! are checked against MySQL through a bounded blocking connection
//! pool.

pub mod buffer;
pub mod config;
pub mod error;
pub mod http;
pub mod pool;
pub mod server;
pub mod timer;

pub use config::{DbConfig, ServerConfig, TriggerMode};
pub use error::ServerError;
pub use pool::{SqlConnPool, SqlUserStore, UserStore};
pub use server::{Server, ServerHandle};
