pub use crate::config::{
    AliasRule, AppConfig, ProxyRule, ProxyTarget, ServerConfig, select_server,
};
pub use crate::error::{FatalError, Result};
pub use crate::http::*;
pub use crate::mime::MimeTable;

pub use mio::{
    Events, Interest, Poll, Registry, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};
pub use origin_log::{access, debug, errors, info, trace, warn};

pub use std::collections::HashMap;
pub use std::fmt::{self, Display};
pub use std::fs::{self, File};
pub use std::io::{self, ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::path::{Path, PathBuf};
pub use std::sync::Arc;
pub use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
pub use std::time::{Duration, Instant, SystemTime};

pub const READ_BUF_SIZE: usize = 4096;

// 4xx client errors
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_HEADER_FIELDS_TOO_LARGE: u16 = 431;

// 5xx server errors
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;
pub const HTTP_BAD_GATEWAY: u16 = 502;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;

pub const HTTP_OK: u16 = 200;
