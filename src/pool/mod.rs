//! Bounded resource pools: worker threads and database connections.

pub mod bounded;
pub mod sql;
pub mod worker;

pub use bounded::{BoundedPool, PoolGuard};
pub use sql::{SqlConnPool, SqlUserStore, UserStore};
pub use worker::WorkerPool;
