use crate::prelude::*;

/// Longest-prefix proxy rule for a normalized path, if any.
pub fn match_rule<'a>(server: &'a ServerConfig, path: &str) -> Option<&'a ProxyRule> {
    server
        .proxies
        .iter()
        .filter(|rule| rule.target.is_some() && path.starts_with(rule.prefix.as_str()))
        .max_by_key(|rule| rule.prefix.len())
}

/// Serialize the client's request for the upstream: method, path and
/// version preserved, `Host` replaced with the upstream authority, and
/// `Connection: close` forced so EOF frames the response.
pub fn rewrite_request(req: &HttpRequest, rule: &ProxyRule, target: &ProxyTarget) -> Vec<u8> {
    let mut path = if rule.strip_prefix {
        match req.path.strip_prefix(rule.prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{}", rest),
            None => req.path.clone(),
        }
    } else {
        req.path.clone()
    };
    if let Some(query) = &req.query {
        path.push('?');
        path.push_str(query);
    }

    let mut out = Vec::with_capacity(256 + req.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", req.method.as_str(), path, req.version.as_str()).as_bytes(),
    );
    out.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());
    for (key, value) in req.headers.iter() {
        if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// Kick off a non-blocking connect; "in progress" is the normal return.
pub fn connect(target: &ProxyTarget) -> io::Result<TcpStream> {
    TcpStream::connect(target.addr)
}

/// After write-readiness on a connecting socket: `Ok(true)` connected,
/// `Ok(false)` still in flight, `Err` the pending socket error.
pub fn connect_result(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

/// What a minimal scan of the upstream response yields: the size of the
/// header block and the Content-Length when the upstream sent one. Beyond
/// this the response is opaque bytes.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamHead {
    pub header_len: usize,
    pub status: u16,
    pub content_length: Option<u64>,
}

/// Scan buffered upstream bytes for the status line and header terminator.
/// Returns `None` until the whole header block has arrived.
pub fn scan_upstream_head(buf: &[u8]) -> Option<UpstreamHead> {
    let terminator = find_subsequence(buf, b"\r\n\r\n")?;
    let status = buf
        .split(|&b| b == b' ')
        .nth(1)
        .and_then(|tok| std::str::from_utf8(tok).ok())
        .and_then(|tok| tok.trim().parse::<u16>().ok())
        .unwrap_or(0);
    let mut content_length = None;
    for line in buf[..terminator].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(sep) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let key = &line[..sep];
        if key.eq_ignore_ascii_case(b"content-length") {
            let value = String::from_utf8_lossy(&line[sep + 1..]);
            content_length = value.trim().parse::<u64>().ok();
            break;
        }
    }
    Some(UpstreamHead {
        header_len: terminator + 4,
        status,
        content_length,
    })
}
