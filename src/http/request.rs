//! Incremental HTTP/1.1 request parsing.
//!
//! The parser walks CRLF-delimited lines out of the connection's input
//! buffer through a small state machine (request line, headers, body)
//! and keeps its progress across calls, so a request split over any
//! number of reads parses the same as one delivered whole. Only GET
//! and POST are accepted; POST bodies must carry a Content-Length and
//! are held until every byte has arrived.

use std::collections::HashMap;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, space0, space1};
use nom::combinator::rest;
use nom::sequence::{pair, separated_pair};
use nom::IResult;
use tracing::debug;

use crate::buffer::Buffer;
use crate::pool::sql::UserStore;

/// Pages addressable by their bare tag, e.g. `GET /login`.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState::RequestLine
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// The buffered bytes do not hold a complete request yet.
    NeedMore,
    /// A full request was parsed.
    Good,
    /// The request is malformed; answer 400 and close after flushing.
    BadRequest,
}

#[derive(Default)]
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
}

impl HttpRequest {
    /// Consume as much of `buf` as possible. State is retained, so the
    /// caller simply re-invokes once more bytes arrive.
    pub fn parse(&mut self, buf: &mut Buffer, users: &dyn UserStore) -> ParseResult {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = buf.read_line() else {
                        return ParseResult::NeedMore;
                    };
                    if !self.parse_request_line(&line) {
                        return ParseResult::BadRequest;
                    }
                    self.resolve_path();
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = buf.read_line() else {
                        return ParseResult::NeedMore;
                    };
                    if line.is_empty() {
                        if self.method == "POST" {
                            if self.content_length().is_none() {
                                debug!("POST without a usable Content-Length");
                                return ParseResult::BadRequest;
                            }
                            self.state = ParseState::Body;
                        } else {
                            self.state = ParseState::Finish;
                        }
                    } else if !self.parse_header(&line) {
                        return ParseResult::BadRequest;
                    }
                }
                ParseState::Body => {
                    let expected = self.content_length().unwrap_or(0);
                    let missing = expected.saturating_sub(self.body.len());
                    if missing > 0 {
                        let take = missing.min(buf.readable());
                        self.body.extend_from_slice(&buf.peek()[..take]);
                        buf.retrieve(take);
                    }
                    if self.body.len() < expected {
                        return ParseResult::NeedMore;
                    }
                    self.parse_post(users);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return ParseResult::Good,
            }
        }
    }

    pub fn reset(&mut self) {
        *self = HttpRequest::default();
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1" && self.header("Connection") == Some("keep-alive")
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        match request_line(line) {
            Ok((remaining, (method, path, version))) if remaining.is_empty() => {
                self.method = method.to_owned();
                self.path = path.to_owned();
                self.version = version.to_owned();
                true
            }
            _ => {
                debug!(line, "malformed request line");
                false
            }
        }
    }

    fn parse_header(&mut self, line: &str) -> bool {
        match header_line(line) {
            Ok((_, (name, value))) => {
                self.headers.insert(name.to_owned(), value.to_owned());
                true
            }
            Err(_) => {
                debug!(line, "malformed header line");
                false
            }
        }
    }

    fn resolve_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    // Form posts to the login and register pages route through the
    // user store; the path is rewritten to reflect the outcome.
    fn parse_post(&mut self, users: &dyn UserStore) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.parse_urlencoded();
        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let username = self.form_value("username").unwrap_or_default().to_owned();
        let password = self.form_value("password").unwrap_or_default().to_owned();
        if users.verify(&username, &password, is_login) {
            self.path = "/welcome.html".to_owned();
        } else {
            self.path = "/error.html".to_owned();
        }
    }

    fn parse_urlencoded(&mut self) {
        let body = String::from_utf8_lossy(&self.body).into_owned();
        for item in body.split('&') {
            if item.is_empty() {
                continue;
            }
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            self.form.insert(url_decode(key), url_decode(value));
        }
    }
}

fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, method) = alt((tag("GET"), tag("POST")))(input)?;
    let (input, _) = space1(input)?;
    let (input, path) = take_while1(|c: char| !c.is_ascii_whitespace())(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("HTTP/")(input)?;
    let (input, version) = alt((tag("1.1"), tag("1.0")))(input)?;
    Ok((input, (method, path, version)))
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c != ':'),
        pair(char(':'), space0),
        rest,
    )(input)
}

/// Decode one `application/x-www-form-urlencoded` token: `+` is space,
/// `%HH` takes hex digits of either case. A malformed escape is kept
/// literally.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
