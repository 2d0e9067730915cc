//! MySQL connection pool and the user store backed by it.
//!
//! The pool opens a fixed number of persistent connections at startup;
//! workers check one out for the duration of a single verify call.
//! Statements are parameterized, so quoting stays inside the driver.

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use tracing::{error, info, warn};

use crate::config::DbConfig;
use crate::error::ServerError;
use crate::pool::bounded::{BoundedPool, PoolGuard};

pub struct SqlConnPool {
    pool: BoundedPool<Conn>,
}

impl SqlConnPool {
    /// Open `size` persistent connections.
    pub fn connect(cfg: &DbConfig, size: usize) -> Result<Self, ServerError> {
        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(cfg.host.clone()))
            .tcp_port(cfg.port)
            .user(Some(cfg.user.clone()))
            .pass(Some(cfg.password.clone()))
            .db_name(Some(cfg.database.clone()))
            .into();
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            conns.push(Conn::new(opts.clone())?);
        }
        info!(size, host = %cfg.host, db = %cfg.database, "sql connection pool ready");
        Ok(Self {
            pool: BoundedPool::new(conns),
        })
    }

    /// Check a connection out, blocking while the pool is empty.
    pub fn get(&self) -> PoolGuard<Conn> {
        self.pool.get()
    }

    pub fn free_count(&self) -> usize {
        self.pool.available()
    }

    /// Drop every pooled connection.
    pub fn close(&self) {
        let drained = self.pool.drain();
        info!(count = drained.len(), "sql connection pool closed");
    }
}

/// Credential checks for form login and registration. Injected into
/// the server so tests can substitute an in-memory store.
pub trait UserStore: Send + Sync {
    /// Login: true when the stored password matches. Registration:
    /// true when the name was free and the insert succeeded.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

pub struct SqlUserStore {
    pool: SqlConnPool,
}

impl SqlUserStore {
    pub fn new(pool: SqlConnPool) -> Self {
        Self { pool }
    }
}

impl UserStore for SqlUserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        let mut conn = self.pool.get();
        let stored: Option<String> = match conn.exec_first(
            "SELECT password FROM user WHERE username = ? LIMIT 1",
            (username,),
        ) {
            Ok(row) => row,
            Err(err) => {
                error!(%err, "user lookup failed");
                return false;
            }
        };
        match (stored, is_login) {
            (Some(stored), true) => stored == password,
            (Some(_), false) => {
                warn!(username, "registration rejected: name taken");
                false
            }
            (None, true) => false,
            (None, false) => match conn.exec_drop(
                "INSERT INTO user(username, password) VALUES(?, ?)",
                (username, password),
            ) {
                Ok(()) => true,
                Err(err) => {
                    error!(%err, "user insert failed");
                    false
                }
            },
        }
    }
}
