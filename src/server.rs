use crate::handlers;
use crate::handlers::Resolved;
use crate::prelude::*;
use crate::sendfile::send_file;
use crate::timeouts::TimeoutHeap;
use crate::workers;

const MAX_EVENTS: usize = 1024;
// Upper bound on the poll wait so the loop periodically wakes for
// bookkeeping (eviction, shutdown flag) even with an empty heap.
const MAX_POLL_WAIT_MS: u64 = 1_000;

struct Listener {
    socket: TcpListener,
    servers: Vec<Arc<ServerConfig>>,
}

enum Flush {
    Done,
    Blocked,
    Error,
}

/// One worker's event engine: the readiness loop, the connection registry,
/// the timeout heap, and the per-connection state machine driver.
pub struct Server {
    pub config: Arc<AppConfig>,
    pub mime: Arc<MimeTable>,
    listeners: HashMap<Token, Listener>,
    pub connections: HashMap<Token, Connection>,
    timeouts: TimeoutHeap,
    next_token: usize,
    accepted_total: Option<&'static AtomicU32>,
    draining: bool,
}

impl Server {
    pub fn new(config: AppConfig, poll: &Poll) -> Result<Server> {
        let mut std_listeners = Vec::new();
        for port in config.listen_ports() {
            std_listeners.push((port, workers::bind_listener(port)?));
        }
        Self::from_std_listeners(config, poll, std_listeners)
    }

    /// Build a worker over listeners bound elsewhere (the master binds
    /// before forking; each worker registers the inherited sockets with its
    /// own poll instance).
    pub fn from_std_listeners(
        config: AppConfig,
        poll: &Poll,
        std_listeners: Vec<(u16, std::net::TcpListener)>,
    ) -> Result<Server> {
        let mime = MimeTable::load(config.mime_types.as_deref(), &config.default_type)?;
        let config = Arc::new(config);
        let mut server = Server {
            config: Arc::clone(&config),
            mime: Arc::new(mime),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            timeouts: TimeoutHeap::new(),
            next_token: 0,
            accepted_total: None,
            draining: false,
        };
        for (port, std_listener) in std_listeners {
            std_listener.set_nonblocking(true)?;
            let mut socket = TcpListener::from_std(std_listener);
            let servers: Vec<Arc<ServerConfig>> = config
                .servers
                .iter()
                .filter(|s| s.listen == port)
                .cloned()
                .map(Arc::new)
                .collect();
            if servers.is_empty() {
                continue;
            }
            let token = Token(server.next_token);
            server.next_token += 1;
            poll.registry()
                .register(&mut socket, token, Interest::READABLE)?;
            server.listeners.insert(token, Listener { socket, servers });
            info!("listening on port {}", port);
        }
        if server.listeners.is_empty() {
            return Err("no listening sockets could be set up".into());
        }
        Ok(server)
    }

    pub fn set_counter(&mut self, counter: Option<&'static AtomicU32>) {
        self.accepted_total = counter;
    }

    /// The readiness loop. One iteration: wait with the heap's deadline,
    /// dispatch events, evict expired connections, observe the shutdown
    /// flag. Exits once draining finishes.
    pub fn run(&mut self, mut poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            let now = Instant::now();
            let wait = self
                .timeouts
                .next_deadline_millis(now)
                .unwrap_or(MAX_POLL_WAIT_MS)
                .min(MAX_POLL_WAIT_MS);
            if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(wait))) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();
                if self.listeners.contains_key(&token) {
                    self.accept_connections(token, poll.registry());
                } else {
                    self.handle_event(token, event, poll.registry());
                }
            }

            self.evict_expired(poll.registry());

            if workers::shutdown_requested() {
                if !self.draining {
                    self.begin_drain(poll.registry());
                }
                if self.connections.is_empty() {
                    break;
                }
            }
        }
        info!("worker {} drained, exiting", std::process::id());
        Ok(())
    }

    /// Accept until the listener reports would-block. New sockets get
    /// TCP_NODELAY, read interest, a registry record, and a heap slot.
    fn accept_connections(&mut self, token: Token, registry: &Registry) {
        loop {
            let accepted = match self.listeners.get_mut(&token) {
                Some(listener) => listener.socket.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, _addr)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!("connection limit reached, rejecting new connection");
                        drop(stream);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let tok = Token(self.next_token);
                    self.next_token += 1;
                    if registry
                        .register(&mut stream, tok, Interest::READABLE)
                        .is_err()
                    {
                        continue;
                    }
                    let servers = self
                        .listeners
                        .get(&token)
                        .map(|l| l.servers.clone())
                        .unwrap_or_default();
                    self.connections
                        .insert(tok, Connection::new_client(stream, servers));
                    self.arm_idle(tok);
                    if let Some(counter) = self.accepted_total {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!("accepted connection {:?}", tok);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    errors!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_event(&mut self, token: Token, event: &Event, registry: &Registry) {
        let Some(conn) = self.connections.get(&token) else {
            return;
        };
        let role = conn.role;
        let state = conn.state;

        if event.is_error() {
            match role {
                Role::Client => self.close_connection(token, registry),
                Role::Upstream => self.upstream_failed(token, registry),
            }
            return;
        }

        match role {
            Role::Client => {
                if event.is_readable() {
                    match state {
                        ConnState::ReadingRequest | ConnState::ReadingBody => {
                            self.client_read(token, registry)
                        }
                        _ => self.probe_client_close(token, registry),
                    }
                }
                if event.is_writable() {
                    self.drive_client(token, registry);
                }
            }
            Role::Upstream => self.handle_upstream_event(token, event, registry),
        }
    }

    /// Drain the client socket into the read buffer (edge-triggered reads
    /// loop until would-block), then let the state machine consume it.
    fn client_read(&mut self, token: Token, registry: &Registry) {
        let mut closed = false;
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            conn.touch();
            let mut chunk = [0u8; READ_BUF_SIZE];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.request.buffer.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            self.close_connection(token, registry);
            return;
        }
        self.drive_client(token, registry);
    }

    /// A readable client socket outside the reading states either carries
    /// early pipelined bytes (kept for the next exchange) or a peer close.
    fn probe_client_close(&mut self, token: Token, registry: &Registry) {
        let mut closed = false;
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let mut chunk = [0u8; READ_BUF_SIZE];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.request.buffer.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            self.close_connection(token, registry);
        }
    }

    /// Advance a client through the state machine as far as buffered bytes
    /// and socket readiness allow. Pipelined requests are consumed without
    /// returning to the readiness loop.
    fn drive_client(&mut self, token: Token, registry: &Registry) {
        loop {
            let state = match self.connections.get(&token) {
                Some(conn) => conn.state,
                None => return,
            };
            match state {
                ConnState::ReadingRequest => {
                    let parse_result = {
                        let Some(conn) = self.connections.get_mut(&token) else {
                            return;
                        };
                        let max_header = conn.server_config().max_header_bytes;
                        conn.request.advance_headers(max_header)
                    };
                    match parse_result {
                        Ok(ParsingState::HeadersDone) => {
                            if !self.route_after_headers(token, registry) {
                                return;
                            }
                        }
                        Ok(_) => {
                            self.arm_idle(token);
                            return;
                        }
                        Err(e) => {
                            info!("rejecting request: {}", e);
                            self.queue_error(token, e.status(), registry);
                        }
                    }
                }
                ConnState::ReadingBody => {
                    let done = match self.connections.get_mut(&token) {
                        Some(conn) => conn.request.drain_body_bytes(),
                        None => return,
                    };
                    if !done {
                        self.arm_idle(token);
                        return;
                    }
                    if !self.resolve_and_respond(token, registry) {
                        return;
                    }
                }
                ConnState::WritingResponse => match self.flush_client(token) {
                    Flush::Blocked => return,
                    Flush::Error => {
                        self.close_connection(token, registry);
                        return;
                    }
                    Flush::Done => {
                        let more_expected = self
                            .connections
                            .get(&token)
                            .is_some_and(|c| c.peer.is_some());
                        if more_expected {
                            self.transition(token, ConnState::ReadingUpstream, registry);
                            return;
                        }
                        if !self.finish_exchange(token, registry) {
                            return;
                        }
                    }
                },
                _ => return,
            }
        }
    }

    /// Headers are in: pin the server block by Host, enforce the method
    /// allow-list and body ceiling, then read the body or resolve directly.
    /// Returns false when the exchange left the client-driven states.
    fn route_after_headers(&mut self, token: Token, registry: &Registry) -> bool {
        let (method_allowed, body_too_large, has_body) = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return false;
            };
            let host = conn.request.headers.get("host").map(|h| h.to_string());
            let server = Arc::clone(select_server(&conn.candidates, host.as_deref()));
            conn.server = Some(Arc::clone(&server));
            (
                conn.request.method.is_allowed(&server.allowed_methods),
                conn.request.content_length > server.max_body_bytes,
                conn.request.method.may_have_body() && conn.request.content_length > 0,
            )
        };

        if !method_allowed {
            self.queue_error(token, HTTP_METHOD_NOT_ALLOWED, registry);
            return true;
        }
        if body_too_large {
            // Rejected before a single body byte is accepted.
            self.queue_error(token, HTTP_PAYLOAD_TOO_LARGE, registry);
            return true;
        }
        if has_body {
            let complete = {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return false;
                };
                conn.request.begin_body();
                conn.request.state == ParsingState::Complete
            };
            if complete {
                return self.resolve_and_respond(token, registry);
            }
            self.transition(token, ConnState::ReadingBody, registry);
            return true;
        }
        self.resolve_and_respond(token, registry)
    }

    /// Request is fully parsed: match a proxy rule or hit the filesystem.
    /// Returns false when an upstream connection now owns the exchange.
    fn resolve_and_respond(&mut self, token: Token, registry: &Registry) -> bool {
        let (server, path) = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return false;
            };
            conn.request.finish();
            (Arc::clone(conn.server_config()), conn.request.path.clone())
        };

        if let Some(rule) = handlers::match_rule(&server, &path).cloned() {
            return self.start_proxy(token, rule, &server, registry);
        }

        match handlers::resolve(&server, &self.mime, &path) {
            Resolved::File(file) => {
                self.build_static_response(token, file, &server, registry);
                true
            }
            Resolved::Status(code) => {
                self.queue_error(token, code, registry);
                true
            }
        }
    }

    fn build_static_response(
        &mut self,
        token: Token,
        file: handlers::StaticFile,
        server: &Arc<ServerConfig>,
        registry: &Registry,
    ) {
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let keep_alive = conn.request.keep_alive
                && conn.requests_served + 1 < server.keepalive_max_requests;
            let mut head = ResponseHead::new(HTTP_OK, &file.content_type, file.size)
                .with_last_modified(file.mtime);
            if keep_alive {
                head = head.with_keep_alive(
                    server.idle_timeout_seconds,
                    server.keepalive_max_requests,
                );
            }
            conn.write_buffer = head.serialize();
            conn.bytes_sent = 0;
            conn.keep_alive = keep_alive;
            conn.response_status = HTTP_OK;
            if conn.request.method == Method::HEAD {
                conn.suppress_body = true;
            } else {
                conn.file = Some(FileBody {
                    file: file.file,
                    size: file.size,
                    offset: 0,
                });
            }
        }
        self.transition(token, ConnState::WritingResponse, registry);
    }

    /// Queue a canned error response and mark the connection for close once
    /// it is flushed. Any in-flight upstream is torn down.
    fn queue_error(&mut self, token: Token, status: u16, registry: &Registry) {
        let peer = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let bytes = error_response(status, conn.server.as_deref());
            conn.write_buffer = bytes;
            conn.bytes_sent = 0;
            conn.file = None;
            conn.suppress_body = false;
            conn.keep_alive = false;
            conn.closing = true;
            conn.response_status = status;
            conn.peer.take()
        };
        if let Some(upstream) = peer {
            self.detach_upstream(upstream, registry);
        }
        self.transition(token, ConnState::WritingResponse, registry);
    }

    /// Write queued bytes, then the file body, until done or would-block.
    /// Write interest is already registered by the transition into
    /// `WritingResponse`, so a blocked flush just waits for the next event.
    fn flush_client(&mut self, token: Token) -> Flush {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Flush::Error;
        };
        while conn.bytes_sent < conn.write_buffer.len() {
            match conn.stream.write(&conn.write_buffer[conn.bytes_sent..]) {
                Ok(0) => return Flush::Error,
                Ok(n) => {
                    conn.bytes_sent += n;
                    conn.touch();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Flush::Blocked,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Flush::Error,
            }
        }
        if conn.suppress_body {
            conn.file = None;
        }
        if let Some(body) = conn.file.as_mut() {
            match send_file(&mut conn.stream, body) {
                Ok(true) => {
                    conn.file = None;
                    conn.touch();
                }
                Ok(false) => return Flush::Blocked,
                Err(_) => return Flush::Error,
            }
        }
        Flush::Done
    }

    /// The response is fully on the wire: log it, then either close or
    /// recycle the record for the next keep-alive request. Residual
    /// pipelined bytes keep the drive loop going.
    fn finish_exchange(&mut self, token: Token, registry: &Registry) -> bool {
        let close = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return false;
            };
            conn.requests_served += 1;
            let peer = conn
                .stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "-".to_string());
            access!(
                "{} \"{} {} {}\" {} {}",
                peer,
                conn.request.method,
                conn.request.raw_target,
                conn.request.version.as_str(),
                conn.response_status,
                conn.bytes_sent
            );
            conn.closing || !conn.keep_alive
        };
        if close {
            self.close_connection(token, registry);
            return false;
        }
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.reset_for_next_request();
        }
        self.transition(token, ConnState::ReadingRequest, registry);
        true
    }

    /// Open the upstream side of a proxied exchange. The client record and
    /// the new upstream record are paired; failure before any upstream
    /// byte yields a 502.
    fn start_proxy(
        &mut self,
        token: Token,
        rule: ProxyRule,
        server: &Arc<ServerConfig>,
        registry: &Registry,
    ) -> bool {
        let Some(target) = rule.target.clone() else {
            self.queue_error(token, HTTP_BAD_GATEWAY, registry);
            return true;
        };
        let request_bytes = {
            let Some(conn) = self.connections.get(&token) else {
                return false;
            };
            handlers::rewrite_request(&conn.request, &rule, &target)
        };
        let mut upstream_stream = match handlers::connect(&target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("upstream connect to {} failed: {}", target.authority, e);
                self.queue_error(token, HTTP_BAD_GATEWAY, registry);
                return true;
            }
        };
        let _ = upstream_stream.set_nodelay(true);
        let utoken = Token(self.next_token);
        self.next_token += 1;
        if registry
            .register(
                &mut upstream_stream,
                utoken,
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            self.queue_error(token, HTTP_BAD_GATEWAY, registry);
            return true;
        }
        let mut upstream = Connection::new_upstream(upstream_stream, token);
        upstream.write_buffer = request_bytes;
        self.connections.insert(utoken, upstream);
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return false;
            };
            conn.peer = Some(utoken);
            conn.keep_alive = conn.request.keep_alive
                && conn.requests_served + 1 < server.keepalive_max_requests;
        }
        self.transition(token, ConnState::ConnectingUpstream, registry);
        false
    }

    fn handle_upstream_event(&mut self, utoken: Token, event: &Event, registry: &Registry) {
        let state = match self.connections.get(&utoken) {
            Some(upstream) => upstream.state,
            None => return,
        };

        if state == ConnState::ConnectingUpstream
            && (event.is_writable() || event.is_readable())
        {
            let result = match self.connections.get(&utoken) {
                Some(upstream) => handlers::connect_result(&upstream.stream),
                None => return,
            };
            match result {
                Ok(true) => {
                    self.transition(utoken, ConnState::WritingUpstream, registry);
                    if let Some(client) = self.peer_of(utoken) {
                        self.transition(client, ConnState::WritingUpstream, registry);
                    }
                }
                Ok(false) => return,
                Err(e) => {
                    warn!("upstream connect failed: {}", e);
                    self.upstream_failed(utoken, registry);
                    return;
                }
            }
        }

        self.drive_upstream(utoken, registry);
    }

    fn peer_of(&self, token: Token) -> Option<Token> {
        self.connections.get(&token).and_then(|c| c.peer)
    }

    /// Push the rewritten request at the upstream, then stream its response
    /// back through the paired client record.
    fn drive_upstream(&mut self, utoken: Token, registry: &Registry) {
        loop {
            let state = match self.connections.get(&utoken) {
                Some(upstream) => upstream.state,
                None => return,
            };
            match state {
                ConnState::WritingUpstream => {
                    let mut failed = false;
                    let mut blocked = false;
                    {
                        let Some(upstream) = self.connections.get_mut(&utoken) else {
                            return;
                        };
                        while upstream.bytes_sent < upstream.write_buffer.len() {
                            match upstream
                                .stream
                                .write(&upstream.write_buffer[upstream.bytes_sent..])
                            {
                                Ok(0) => {
                                    failed = true;
                                    break;
                                }
                                Ok(n) => upstream.bytes_sent += n,
                                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                    blocked = true;
                                    break;
                                }
                                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                                Err(_) => {
                                    failed = true;
                                    break;
                                }
                            }
                        }
                    }
                    if failed {
                        self.upstream_failed(utoken, registry);
                        return;
                    }
                    if blocked {
                        return;
                    }
                    self.transition(utoken, ConnState::ReadingUpstream, registry);
                    if let Some(client) = self.peer_of(utoken) {
                        self.transition(client, ConnState::ReadingUpstream, registry);
                    }
                }
                ConnState::ReadingUpstream => {
                    let mut eof = false;
                    let mut failed = false;
                    {
                        let Some(upstream) = self.connections.get_mut(&utoken) else {
                            return;
                        };
                        let mut chunk = [0u8; READ_BUF_SIZE];
                        loop {
                            match upstream.stream.read(&mut chunk) {
                                Ok(0) => {
                                    eof = true;
                                    break;
                                }
                                Ok(n) => upstream.request.buffer.extend_from_slice(&chunk[..n]),
                                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                                Err(_) => {
                                    failed = true;
                                    break;
                                }
                            }
                        }
                    }
                    if failed {
                        self.upstream_failed(utoken, registry);
                        return;
                    }
                    if self.pump_upstream(utoken, registry) {
                        return;
                    }
                    if eof {
                        self.upstream_eof(utoken, registry);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// Forward buffered upstream bytes to the client verbatim. The header
    /// block is scanned once for framing; returns true when the exchange
    /// completed via Content-Length and was finalized here.
    fn pump_upstream(&mut self, utoken: Token, registry: &Registry) -> bool {
        let Some(client_token) = self.peer_of(utoken) else {
            self.detach_upstream(utoken, registry);
            return true;
        };
        let bytes = match self.connections.get_mut(&utoken) {
            Some(upstream) => std::mem::take(&mut upstream.request.buffer),
            None => return true,
        };
        if bytes.is_empty() {
            return false;
        }
        let complete = {
            let Some(client) = self.connections.get_mut(&client_token) else {
                self.detach_upstream(utoken, registry);
                return true;
            };
            client.upstream_started = true;
            client.write_buffer.extend_from_slice(&bytes);
            if !client.upstream_header_done {
                if let Some(head) = handlers::scan_upstream_head(&client.write_buffer) {
                    client.upstream_header_done = true;
                    client.upstream_content_length = head.content_length;
                    client.upstream_forwarded = (client.write_buffer.len() - head.header_len) as u64;
                    client.response_status = head.status;
                }
            } else {
                client.upstream_forwarded += bytes.len() as u64;
            }
            client.upstream_header_done
                && matches!(client.upstream_content_length, Some(cl) if client.upstream_forwarded >= cl)
        };

        self.transition(client_token, ConnState::WritingResponse, registry);
        if complete {
            self.detach_upstream(utoken, registry);
            if let Some(client) = self.connections.get_mut(&client_token) {
                client.peer = None;
            }
            self.drive_client(client_token, registry);
            return true;
        }
        self.drive_client(client_token, registry);
        false
    }

    /// Upstream closed. With no bytes received it is a 502; with framing
    /// unknown or the body truncated the client is flushed and closed.
    fn upstream_eof(&mut self, utoken: Token, registry: &Registry) {
        let Some(client_token) = self.peer_of(utoken) else {
            self.detach_upstream(utoken, registry);
            return;
        };
        self.detach_upstream(utoken, registry);
        let started = {
            let Some(client) = self.connections.get_mut(&client_token) else {
                return;
            };
            client.peer = None;
            client.closing = true;
            client.upstream_started
        };
        if !started {
            self.queue_error(client_token, HTTP_BAD_GATEWAY, registry);
            self.drive_client(client_token, registry);
            return;
        }
        self.transition(client_token, ConnState::WritingResponse, registry);
        self.drive_client(client_token, registry);
    }

    /// Hard upstream failure: 502 when nothing was sent yet, otherwise the
    /// client is closed without further bytes.
    fn upstream_failed(&mut self, utoken: Token, registry: &Registry) {
        let client_token = self.peer_of(utoken);
        self.detach_upstream(utoken, registry);
        let Some(client_token) = client_token else {
            return;
        };
        let started = {
            let Some(client) = self.connections.get_mut(&client_token) else {
                return;
            };
            client.peer = None;
            client.upstream_started
        };
        if !started {
            self.queue_error(client_token, HTTP_BAD_GATEWAY, registry);
            self.drive_client(client_token, registry);
        } else {
            warn!("upstream failed mid-stream, dropping client {:?}", client_token);
            self.close_connection(client_token, registry);
        }
    }

    /// Switch a connection's state, its readiness interest, and its heap
    /// membership in one place.
    fn transition(&mut self, token: Token, new_state: ConnState, registry: &Registry) {
        let (changed, idle) = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.state == new_state {
                (false, Duration::ZERO)
            } else {
                conn.state = new_state;
                let _ = registry.reregister(
                    &mut conn.stream,
                    token,
                    new_state.interest(conn.role),
                );
                // Only client states hold a heap slot, and client records
                // always carry at least one candidate block.
                let idle = if new_state.holds_timeout() {
                    Duration::from_secs(conn.server_config().idle_timeout_seconds)
                } else {
                    Duration::ZERO
                };
                (true, idle)
            }
        };
        if !changed {
            return;
        }
        if new_state.holds_timeout() {
            self.timeouts
                .insert(token, Instant::now() + idle, &mut self.connections);
        } else {
            self.timeouts.remove(token, &mut self.connections);
        }
    }

    /// Re-arm the idle deadline for a connection sitting in a reading
    /// state.
    fn arm_idle(&mut self, token: Token) {
        let idle = {
            let Some(conn) = self.connections.get(&token) else {
                return;
            };
            if !conn.state.holds_timeout() {
                return;
            }
            Duration::from_secs(conn.server_config().idle_timeout_seconds)
        };
        self.timeouts
            .insert(token, Instant::now() + idle, &mut self.connections);
    }

    /// Close every connection past its deadline. Bounded by the number of
    /// expirations per iteration.
    fn evict_expired(&mut self, registry: &Registry) {
        let expired = self.timeouts.pop_expired(Instant::now(), &mut self.connections);
        for token in expired {
            info!("closing connection {:?}: idle timeout", token);
            self.close_connection(token, registry);
        }
    }

    /// Remove a record and its socket together. Closing a client tears its
    /// upstream down with it; closing an upstream only detaches it from
    /// the client.
    fn close_connection(&mut self, token: Token, registry: &Registry) {
        self.timeouts.remove(token, &mut self.connections);
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = registry.deregister(&mut conn.stream);
        match conn.role {
            Role::Client => {
                if let Some(upstream) = conn.peer {
                    self.detach_upstream(upstream, registry);
                }
            }
            Role::Upstream => {
                if let Some(client_token) = conn.peer {
                    if let Some(client) = self.connections.get_mut(&client_token) {
                        client.peer = None;
                    }
                }
            }
        }
        trace!("closed connection {:?}", token);
    }

    fn detach_upstream(&mut self, utoken: Token, registry: &Registry) {
        if let Some(mut upstream) = self.connections.remove(&utoken) {
            let _ = registry.deregister(&mut upstream.stream);
        }
    }

    fn begin_drain(&mut self, registry: &Registry) {
        self.draining = true;
        for listener in self.listeners.values_mut() {
            let _ = registry.deregister(&mut listener.socket);
        }
        self.listeners.clear();
        info!(
            "shutdown requested; draining {} open connections",
            self.connections.len()
        );
    }
}
