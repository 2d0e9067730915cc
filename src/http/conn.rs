//! One accepted client connection.
//!
//! Owns the non-blocking stream, staging buffers, parser and response.
//! A read phase drains the socket into the input buffer; `process`
//! turns a complete request into header bytes plus a mapped body; a
//! write phase pushes both regions with vectored writes, tracking
//! partial progress in each.

use std::io::{self, IoSlice, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::http::request::{HttpRequest, ParseResult};
use crate::http::response::HttpResponse;
use crate::server::ServerContext;

pub struct HttpConn {
    stream: TcpStream,
    fd: RawFd,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    input: Buffer,
    output: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    body_written: usize,
    closed: bool,
}

impl HttpConn {
    pub fn new(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        let fd = stream.as_raw_fd();
        ctx.alive.fetch_add(1, Ordering::Relaxed);
        debug!(fd, peer = %addr, "connection open");
        Self {
            stream,
            fd,
            addr,
            ctx,
            input: Buffer::new(),
            output: Buffer::new(),
            request: HttpRequest::default(),
            response: HttpResponse::new(),
            body_written: 0,
            closed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain the socket into the input buffer: until EAGAIN under
    /// edge triggering, one scatter read otherwise. An orderly peer
    /// shutdown with nothing read surfaces as `UnexpectedEof`.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.input.read_from(&mut self.stream) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Push header bytes and the mapped body with vectored writes
    /// until everything is out (`Ok`) or the socket is full again
    /// (`WouldBlock`). Partial progress advances both regions.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.pending_write_bytes() == 0 {
                break;
            }
            let result = {
                let header = self.output.peek();
                let body = self
                    .response
                    .file()
                    .map(|f| &f[self.body_written..])
                    .unwrap_or(&[]);
                (&self.stream).write_vectored(&[IoSlice::new(header), IoSlice::new(body)])
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    total += n;
                    let from_header = self.output.readable().min(n);
                    self.output.retrieve(from_header);
                    self.body_written += n - from_header;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Parse whatever is buffered. `false` asks the reactor to wait
    /// for more input; `true` means a response is staged and the
    /// connection wants write readiness.
    pub fn process(&mut self) -> bool {
        if self.input.readable() == 0 {
            return false;
        }
        match self.request.parse(&mut self.input, self.ctx.user_store.as_ref()) {
            ParseResult::NeedMore => return false,
            ParseResult::Good => {
                debug!(
                    fd = self.fd,
                    method = %self.request.method(),
                    path = %self.request.path(),
                    "request parsed"
                );
                self.response.init(
                    &self.ctx.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    None,
                );
            }
            ParseResult::BadRequest => {
                self.response
                    .init(&self.ctx.src_dir, self.request.path(), false, Some(400));
            }
        }
        self.output.clear();
        self.body_written = 0;
        self.response.make_response(&mut self.output);
        true
    }

    /// Ready the connection for the next keep-alive exchange. Input
    /// stays, so a request that arrived behind the previous one is
    /// picked up by the following `process`.
    pub fn recycle(&mut self) {
        self.request.reset();
        self.response.release();
        self.output.clear();
        self.body_written = 0;
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.output.readable() + self.response.file_len().saturating_sub(self.body_written)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    /// Idempotent teardown: releases the mapping, shuts the socket
    /// down and drops the connection from the live count. The fd
    /// itself closes when the last reference drops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.release();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.ctx.alive.fetch_sub(1, Ordering::Relaxed);
        debug!(fd = self.fd, peer = %self.addr, "connection closed");
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
