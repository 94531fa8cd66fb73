use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_PID_FILE: &str = "/tmp/origin_server.pid";

const DEFAULT_TYPE: &str = "application/octet-stream";
const DEFAULT_ROOT: &str = "./www";
const DEFAULT_INDEX: &str = "index.html";
const DEFAULT_MAX_HEADER_BYTES: usize = 8_192;
const DEFAULT_MAX_BODY_BYTES: usize = 1_048_576; // 1MB
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_KEEPALIVE_MAX_REQUESTS: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_worker_processes")]
    pub worker_processes: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub mime_types: Option<PathBuf>,
    #[serde(default = "default_type")]
    pub default_type: String,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default)]
    pub error_log: Option<PathBuf>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: u16,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub default_server: bool,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    #[serde(default)]
    pub try_files: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<AliasRule>,
    #[serde(default)]
    pub proxies: Vec<ProxyRule>,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max_requests: u32,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasRule {
    pub prefix: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRule {
    pub prefix: String,
    pub upstream: String,
    #[serde(default)]
    pub strip_prefix: bool,
    // Filled in by resolve_upstreams() after deserialization.
    #[serde(skip)]
    pub target: Option<ProxyTarget>,
}

/// Upstream authority with its address resolved once at config load.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    pub authority: String,
    pub addr: SocketAddr,
}

fn default_worker_processes() -> u32 {
    1
}
fn default_max_connections() -> usize {
    1024
}
fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}
fn default_type() -> String {
    DEFAULT_TYPE.to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}
fn default_index() -> Vec<String> {
    vec![DEFAULT_INDEX.to_string()]
}
fn default_allowed_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}
fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECONDS
}
fn default_keepalive_max() -> u32 {
    DEFAULT_KEEPALIVE_MAX_REQUESTS
}
fn default_max_header_bytes() -> usize {
    DEFAULT_MAX_HEADER_BYTES
}
fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_processes: default_worker_processes(),
            max_connections: default_max_connections(),
            pid_file: default_pid_file(),
            mime_types: None,
            default_type: default_type(),
            access_log: None,
            error_log: None,
            servers: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: 8080,
            server_names: Vec::new(),
            default_server: false,
            root: default_root(),
            index: default_index(),
            try_files: Vec::new(),
            aliases: Vec::new(),
            proxies: Vec::new(),
            error_pages: HashMap::new(),
            allowed_methods: default_allowed_methods(),
            idle_timeout_seconds: default_idle_timeout(),
            keepalive_max_requests: default_keepalive_max(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &std::path::Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<AppConfig> {
        let mut config: AppConfig = serde_yaml::from_str(content)?;
        config.resolve_upstreams()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and resolve every proxy rule's upstream once, so the event loop
    /// never does name resolution.
    pub fn resolve_upstreams(&mut self) -> Result<()> {
        for server in &mut self.servers {
            for rule in &mut server.proxies {
                rule.target = Some(parse_upstream(&rule.upstream)?);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err("config has no server blocks".into());
        }
        for server in &self.servers {
            if server.listen == 0 {
                return Err("listen port must be nonzero".into());
            }
            if !server.allowed_methods.iter().any(|m| m == "GET") {
                return Err(format!(
                    "server on port {} must allow GET",
                    server.listen
                )
                .into());
            }
            for method in &server.allowed_methods {
                if !matches!(
                    method.as_str(),
                    "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "OPTIONS"
                ) {
                    return Err(format!("unknown method in allowed_methods: {}", method).into());
                }
            }
            for alias in &server.aliases {
                if !alias.prefix.starts_with('/') {
                    return Err(format!("alias prefix must start with '/': {}", alias.prefix).into());
                }
            }
            for rule in &server.proxies {
                if !rule.prefix.starts_with('/') {
                    return Err(format!("proxy prefix must start with '/': {}", rule.prefix).into());
                }
            }
        }
        Ok(())
    }

    pub fn listen_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.iter().map(|s| s.listen).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

fn parse_upstream(url: &str) -> Result<ProxyTarget> {
    if url.starts_with("https://") {
        return Err(format!("https upstreams are not supported: {}", url).into());
    }
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| format!("bad upstream port in {}", url))?,
        ),
        None => (rest.to_string(), 80),
    };
    if host.is_empty() {
        return Err(format!("bad upstream url: {}", url).into());
    }
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve upstream {}: {}", url, e))?
        .next()
        .ok_or_else(|| format!("upstream {} resolved to no addresses", url))?;
    let authority = if port == 80 {
        host.clone()
    } else {
        format!("{}:{}", host, port)
    };
    Ok(ProxyTarget {
        host,
        port,
        authority,
        addr,
    })
}

/// Pick the server block for a request: exact `server_names` match on the
/// Host header (port stripped), else the block marked `default_server`,
/// else the first block bound to the port.
pub fn select_server<'a>(
    candidates: &'a [std::sync::Arc<ServerConfig>],
    host: Option<&str>,
) -> &'a std::sync::Arc<ServerConfig> {
    if let Some(host_header) = host {
        let hostname = host_header.split(':').next().unwrap_or("");
        for config in candidates {
            if config.server_names.iter().any(|n| n == hostname) {
                return config;
            }
        }
    }
    for config in candidates {
        if config.default_server {
            return config;
        }
    }
    &candidates[0]
}
