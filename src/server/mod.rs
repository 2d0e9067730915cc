//! The reactor.
//!
//! One thread owns the listening socket, the connection table and the
//! idle-timeout heap, and blocks in epoll between events. Connection
//! fds are registered one-shot: after an event fires the fd stays
//! silent until the worker handling it rearms the interest, so at most
//! one task per connection is ever in flight and read/write phases
//! never overlap.
//!
//! Lock order: the connection table lock is never held while taking a
//! connection's own lock.

pub mod epoll;

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::http::conn::HttpConn;
use crate::pool::sql::UserStore;
use crate::pool::worker::WorkerPool;
use crate::server::epoll::{Epoller, Events};
use crate::timer::TimerHeap;

const LISTEN_BACKLOG: i32 = 6;

/// Shared configuration and counters every connection points back to.
pub struct ServerContext {
    pub src_dir: PathBuf,
    pub is_et: bool,
    pub alive: AtomicUsize,
    pub max_connections: usize,
    pub user_store: Arc<dyn UserStore>,
}

struct Shared {
    poller: Epoller,
    conns: Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>,
    ctx: Arc<ServerContext>,
    conn_event: u32,
}

impl Shared {
    /// Tear a connection down from the reactor side (hangup, timer
    /// expiry, shutdown). Safe to call for an fd that is already gone.
    fn close_conn(&self, fd: RawFd) {
        let conn = self.conns.lock().remove(&fd);
        if let Some(conn) = conn {
            if let Err(err) = self.poller.del(fd) {
                warn!(fd, %err, "epoll deregister failed");
            }
            conn.lock().close();
        }
    }

    // Worker-side teardown for a connection whose lock is already held.
    fn close_locked(&self, conn: &mut HttpConn) {
        let fd = conn.fd();
        self.conns.lock().remove(&fd);
        if let Err(err) = self.poller.del(fd) {
            warn!(fd, %err, "epoll deregister failed");
        }
        conn.close();
    }

    fn rearm(&self, fd: RawFd, interest: u32) {
        if let Err(err) = self.poller.modify(fd, interest | self.conn_event) {
            // the fd was closed out from under us; the table entry is
            // already gone or about to be
            debug!(fd, %err, "rearm failed");
        }
    }

    fn on_read(&self, conn: &Arc<Mutex<HttpConn>>) {
        let mut conn = conn.lock();
        match conn.read() {
            Ok(_) => self.on_process(&mut conn),
            Err(err) => {
                debug!(fd = conn.fd(), %err, "read failed");
                self.close_locked(&mut conn);
            }
        }
    }

    fn on_process(&self, conn: &mut HttpConn) {
        if conn.process() {
            self.rearm(conn.fd(), epoll::WRITABLE);
        } else {
            self.rearm(conn.fd(), epoll::READABLE);
        }
    }

    fn on_write(&self, conn: &Arc<Mutex<HttpConn>>) {
        let mut conn = conn.lock();
        match conn.write() {
            Ok(_) => {
                if conn.is_keep_alive() {
                    conn.recycle();
                    self.on_process(&mut conn);
                } else {
                    self.close_locked(&mut conn);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.rearm(conn.fd(), epoll::WRITABLE);
            }
            Err(err) => {
                debug!(fd = conn.fd(), %err, "write failed");
                self.close_locked(&mut conn);
            }
        }
    }
}

/// Cloneable stop switch for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the reactor to exit after its current poll returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    listen_fd: RawFd,
    listen_event: u32,
    idle_timeout: Option<Duration>,
    timer: TimerHeap,
    workers: WorkerPool,
    shared: Arc<Shared>,
    events: Events,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(cfg: &ServerConfig, user_store: Arc<dyn UserStore>) -> Result<Self, ServerError> {
        if cfg.worker_threads == 0 {
            return Err(ServerError::Config("worker thread count must be positive".into()));
        }
        if cfg.max_connections == 0 {
            return Err(ServerError::Config("connection cap must be positive".into()));
        }

        let listen_et = cfg.trigger_mode.listen_edge();
        let conn_et = cfg.trigger_mode.conn_edge();
        let listen_event = epoll::PEER_HUP | if listen_et { epoll::EDGE } else { 0 };
        let conn_event =
            epoll::ONESHOT | epoll::PEER_HUP | if conn_et { epoll::EDGE } else { 0 };

        let listener = bind_listener(cfg.port, cfg.linger)?;
        let listen_fd = listener.as_raw_fd();
        let poller = Epoller::new()?;
        poller.add(listen_fd, epoll::READABLE | listen_event)?;

        let ctx = Arc::new(ServerContext {
            src_dir: cfg.src_dir.clone(),
            is_et: conn_et,
            alive: AtomicUsize::new(0),
            max_connections: cfg.max_connections,
            user_store,
        });
        let shared = Arc::new(Shared {
            poller,
            conns: Mutex::new(HashMap::new()),
            ctx,
            conn_event,
        });
        let workers = WorkerPool::new(cfg.worker_threads)?;

        info!(
            port = cfg.port,
            listen_mode = if listen_et { "ET" } else { "LT" },
            conn_mode = if conn_et { "ET" } else { "LT" },
            timeout_ms = cfg.timeout_ms,
            workers = cfg.worker_threads,
            src_dir = %cfg.src_dir.display(),
            "server initialized"
        );

        Ok(Self {
            listener,
            listen_fd,
            listen_event,
            idle_timeout: cfg.idle_timeout(),
            timer: TimerHeap::new(),
            workers,
            shared,
            events: Events::with_capacity(1024),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The bound address; useful when the port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn live_connections(&self) -> usize {
        self.shared.ctx.alive.load(Ordering::Relaxed)
    }

    /// Run the reactor until the handle stops it.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!("server started");
        while self.running.load(Ordering::SeqCst) {
            let timeout_ms = match self.idle_timeout {
                Some(_) => self.timer.next_tick_ms(),
                None => -1,
            };
            self.shared.poller.wait(&mut self.events, timeout_ms)?;
            let ready: Vec<(RawFd, u32)> = self.events.iter().collect();
            for (fd, mask) in ready {
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if mask & epoll::ERROR_MASK != 0 {
                    self.shared.close_conn(fd);
                } else if mask & epoll::READABLE != 0 {
                    self.deal_read(fd);
                } else if mask & epoll::WRITABLE != 0 {
                    self.deal_write(fd);
                } else {
                    debug_assert!(false, "unexpected epoll mask {mask:#x}");
                    error!(fd, mask, "unexpected epoll event");
                }
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn deal_listen(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            };
            if self.shared.ctx.alive.load(Ordering::Relaxed) >= self.shared.ctx.max_connections {
                warn!(peer = %addr, "connection table full");
                send_busy(stream);
                return;
            }
            self.add_client(stream, addr);
            if self.listen_event & epoll::EDGE == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(peer = %addr, %err, "set_nonblocking failed");
            return;
        }
        let fd = stream.as_raw_fd();
        let conn = Arc::new(Mutex::new(HttpConn::new(
            stream,
            addr,
            Arc::clone(&self.shared.ctx),
        )));
        self.shared.conns.lock().insert(fd, conn);

        if let Some(timeout) = self.idle_timeout {
            // the callback keeps only the fd; the connection is looked
            // up in the table when it fires, so a slot reused after an
            // early close cannot be hit through a stale pointer
            let shared = Arc::clone(&self.shared);
            self.timer
                .add(fd, timeout, Box::new(move || shared.close_conn(fd)));
        }
        if let Err(err) = self.shared.poller.add(fd, epoll::READABLE | self.shared.conn_event) {
            error!(fd, %err, "epoll register failed");
            if self.idle_timeout.is_some() {
                self.timer.del(fd);
            }
            self.shared.close_conn(fd);
            return;
        }
        debug!(fd, peer = %addr, "client added");
    }

    fn deal_read(&mut self, fd: RawFd) {
        let conn = self.shared.conns.lock().get(&fd).cloned();
        let Some(conn) = conn else {
            debug!(fd, "read event for unknown connection");
            return;
        };
        self.extend_time(fd);
        let shared = Arc::clone(&self.shared);
        self.workers.submit(move || shared.on_read(&conn));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let conn = self.shared.conns.lock().get(&fd).cloned();
        let Some(conn) = conn else {
            debug!(fd, "write event for unknown connection");
            return;
        };
        self.extend_time(fd);
        let shared = Arc::clone(&self.shared);
        self.workers.submit(move || shared.on_write(&conn));
    }

    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.idle_timeout {
            if self.timer.contains(fd) {
                self.timer.adjust(fd, timeout);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.timer.clear();
        let conns: Vec<_> = self.shared.conns.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.lock().close();
        }
    }
}

fn bind_listener(port: u16, linger: bool) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn send_busy(mut stream: TcpStream) {
    if let Err(err) = stream.write_all(b"Server busy!") {
        warn!(%err, "busy notice failed");
    }
    // dropping the stream closes it immediately
}
