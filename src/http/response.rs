use crate::prelude::*;

pub const SERVER_NAME: &str = concat!("origin_server/", env!("CARGO_PKG_VERSION"));

/// In-memory or file-backed response payload. File bodies carry the open
/// descriptor plus the send offset the state machine advances.
#[derive(Debug)]
pub struct FileBody {
    pub file: File,
    pub size: u64,
    pub offset: u64,
}

/// Everything needed to serialize a response header block in canonical
/// order: status line, Server, Date, Last-Modified (file bodies only),
/// Content-Type, Content-Length, Connection, Keep-Alive parameters.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: String,
    pub content_length: u64,
    pub last_modified: Option<SystemTime>,
    pub keep_alive: bool,
    pub keepalive_timeout: u64,
    pub keepalive_max: u32,
}

impl ResponseHead {
    pub fn new(status: u16, content_type: &str, content_length: u64) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            content_length,
            last_modified: None,
            keep_alive: false,
            keepalive_timeout: 0,
            keepalive_max: 0,
        }
    }

    pub fn with_keep_alive(mut self, timeout_seconds: u64, max_requests: u32) -> Self {
        self.keep_alive = true;
        self.keepalive_timeout = timeout_seconds;
        self.keepalive_max = max_requests;
        self
    }

    pub fn with_last_modified(mut self, mtime: SystemTime) -> Self {
        self.last_modified = Some(mtime);
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.1 ");
        head.push_str(&self.status.to_string());
        head.push(' ');
        head.push_str(status_text(self.status));
        head.push_str("\r\n");
        head.push_str("Server: ");
        head.push_str(SERVER_NAME);
        head.push_str("\r\n");
        head.push_str("Date: ");
        head.push_str(&origin_log::http_date(SystemTime::now()));
        head.push_str("\r\n");
        if let Some(mtime) = self.last_modified {
            head.push_str("Last-Modified: ");
            head.push_str(&origin_log::http_date(mtime));
            head.push_str("\r\n");
        }
        head.push_str("Content-Type: ");
        head.push_str(&self.content_type);
        head.push_str("\r\n");
        head.push_str("Content-Length: ");
        head.push_str(&self.content_length.to_string());
        head.push_str("\r\n");
        if self.keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            head.push_str(&format!(
                "Keep-Alive: timeout={}, max={}\r\n",
                self.keepalive_timeout, self.keepalive_max
            ));
        } else {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Built-in error response: text/plain reason body, `Connection: close`.
/// A configured `error_pages` entry replaces the body with the file's
/// content when readable.
pub fn error_response(status: u16, server: Option<&ServerConfig>) -> Vec<u8> {
    let mut body: Vec<u8> = status_text(status).as_bytes().to_vec();
    let mut content_type = "text/plain";

    if let Some(cfg) = server {
        if let Some(page) = cfg.error_pages.get(&status) {
            let path = cfg.root.join(page.trim_start_matches('/'));
            if let Ok(content) = fs::read(&path) {
                body = content;
                content_type = "text/html";
            }
        }
    }

    let mut out = ResponseHead::new(status, content_type, body.len() as u64).serialize();
    out.extend_from_slice(&body);
    out
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown Status",
    }
}
