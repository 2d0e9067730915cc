//! HTTP response assembly.
//!
//! The status code falls out of a stat of the requested file: absent
//! or a directory is 404, not world-readable is 403, otherwise 200
//! (unless the parser already forced 400). Error statuses are served
//! from their `<code>.html` page when present. Header bytes go into
//! the caller's buffer; the body stays a separate memory-mapped region
//! so the connection can push both with one vectored write.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::buffer::Buffer;

pub struct HttpResponse {
    code: Option<u16>,
    path: String,
    src_dir: PathBuf,
    keep_alive: bool,
    file: Option<Mmap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: None,
            path: String::new(),
            src_dir: PathBuf::new(),
            keep_alive: false,
            file: None,
        }
    }

    /// Start a fresh response; any previous file mapping is released.
    /// `code` is `None` unless the parser already decided the status.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) {
        self.code = code;
        self.path = path.to_owned();
        self.src_dir = src_dir.to_owned();
        self.keep_alive = keep_alive;
        self.file = None;
    }

    /// Resolve the status, then write status line and headers into
    /// `buf` and map the body file. Every failure path degrades to an
    /// error page or an inline error body; nothing propagates.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        // a parse failure already fixed the status at 400
        if self.code != Some(400) {
            match std::fs::metadata(self.resolved_path()) {
                Err(_) => self.code = Some(404),
                Ok(meta) if meta.is_dir() => self.code = Some(404),
                Ok(meta) if meta.permissions().mode() & 0o004 == 0 => self.code = Some(403),
                Ok(_) => {
                    if self.code.is_none() {
                        self.code = Some(200);
                    }
                }
            }
        }
        if let Some(code @ (400 | 403 | 404)) = self.code {
            self.path = format!("/{code}.html");
        }
        self.append_status_line(buf);
        self.append_headers(buf);
        self.append_content(buf);
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The mapped body, if the response carries one.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.file.as_deref().map_or(0, <[u8]>::len)
    }

    /// Drop the body mapping.
    pub fn release(&mut self) {
        self.file = None;
    }

    fn resolved_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn status(&self) -> (u16, &'static str) {
        match self.code {
            Some(200) => (200, "OK"),
            Some(403) => (403, "Forbidden"),
            Some(404) => (404, "Not Found"),
            _ => (400, "Bad Request"),
        }
    }

    fn append_status_line(&mut self, buf: &mut Buffer) {
        let (code, reason) = self.status();
        self.code = Some(code);
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
    }

    fn append_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", self.mime_type()).as_bytes());
    }

    fn append_content(&mut self, buf: &mut Buffer) {
        let path = self.resolved_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %path.display(), %err, "open failed");
                self.error_body(buf, "File NotFound!");
                return;
            }
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                debug!(path = %path.display(), %err, "stat failed");
                self.error_body(buf, "File NotFound!");
                return;
            }
        };
        if len == 0 {
            self.file = None;
            buf.append(b"Content-length: 0\r\n\r\n");
            return;
        }
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                debug!(path = %path.display(), len, "mapped response body");
                self.file = Some(map);
                buf.append(format!("Content-length: {len}\r\n\r\n").as_bytes());
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "mmap failed");
                self.error_body(buf, "File NotFound!");
            }
        }
    }

    // Fallback body when even the error page cannot be served.
    fn error_body(&mut self, buf: &mut Buffer, message: &str) {
        let (code, reason) = self.status();
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {reason}\n<p>{message}</p><hr><em>hearth</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
        self.file = None;
    }

    fn mime_type(&self) -> &'static str {
        let ext = Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        match ext {
            "html" => "text/html",
            "xml" => "text/xml",
            "xhtml" => "application/xhtml+xml",
            "txt" => "text/plain",
            "rtf" => "application/rtf",
            "pdf" => "application/pdf",
            "word" => "application/nsword",
            "png" => "image/png",
            "gif" => "image/gif",
            "jpg" | "jpeg" => "image/jpeg",
            "au" => "audio/basic",
            "mpeg" | "mpg" => "video/mpeg",
            "avi" => "video/x-msvideo",
            "gz" => "application/x-gzip",
            "tar" => "application/x-tar",
            "css" => "text/css",
            "js" => "text/javascript",
            _ => "text/plain",
        }
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::OpenOptionsExt;

    fn build(dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> (HttpResponse, Vec<u8>) {
        let mut response = HttpResponse::new();
        response.init(dir, path, keep_alive, code);
        let mut buf = Buffer::new();
        response.make_response(&mut buf);
        (response, buf.peek().to_vec())
    }

    fn head(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn readable_file_is_200_with_mapped_body() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html>hi</html>").unwrap();

        let (response, bytes) = build(dir.path(), "/index.html", true, None);
        let head = head(&bytes);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.ends_with("Content-length: 15\r\n\r\n"));
        assert_eq!(response.file(), Some("<html>hi</html>".as_bytes()));
    }

    #[test]
    fn missing_file_serves_the_404_page() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("404.html"), "gone").unwrap();

        let (response, bytes) = build(dir.path(), "/nope.html", false, None);
        assert!(head(&bytes).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head(&bytes).contains("Connection: close\r\n"));
        assert_eq!(response.file(), Some("gone".as_bytes()));
    }

    #[test]
    fn directory_is_404() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let (_, bytes) = build(dir.path(), "/sub", false, None);
        assert!(head(&bytes).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn unreadable_file_is_403() {
        let dir = tempfile::tempdir().unwrap();
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o200)
            .open(dir.path().join("secret"))
            .unwrap();
        fs::write(dir.path().join("403.html"), "no entry").unwrap();

        let (response, bytes) = build(dir.path(), "/secret", false, None);
        assert!(head(&bytes).starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(response.file(), Some("no entry".as_bytes()));
    }

    #[test]
    fn parser_forced_400_wins_over_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "x").unwrap();

        let (_, bytes) = build(dir.path(), "/index.html", false, Some(400));
        assert!(head(&bytes).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn inline_error_body_when_the_error_page_is_missing() {
        let dir = tempfile::tempdir().unwrap();

        let (response, bytes) = build(dir.path(), "/nope.html", false, None);
        let text = head(&bytes);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("File NotFound!"));
        assert!(response.file().is_none());
    }

    #[test]
    fn empty_file_sends_content_length_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();

        let (response, bytes) = build(dir.path(), "/empty.txt", false, None);
        let text = head(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Content-length: 0\r\n\r\n"));
        assert!(response.file().is_none());
    }

    #[test]
    fn mime_types_follow_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        for (name, mime) in [
            ("a.css", "text/css"),
            ("a.js", "text/javascript"),
            ("a.png", "image/png"),
            ("a.tar", "application/x-tar"),
            ("noext", "text/plain"),
            ("a.weird", "text/plain"),
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
            let (_, bytes) = build(dir.path(), &format!("/{name}"), false, None);
            assert!(
                head(&bytes).contains(&format!("Content-type: {mime}\r\n")),
                "wrong mime for {name}"
            );
        }
    }
}
