use crate::prelude::*;
use crate::timeouts::TimeoutSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Upstream,
}

/// Per-connection state machine variants. A proxied exchange drives the
/// client record through the upstream phases while the paired upstream
/// record mirrors the phase its own socket is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingRequest,
    ReadingBody,
    ConnectingUpstream,
    WritingUpstream,
    ReadingUpstream,
    WritingResponse,
    Closed,
}

impl ConnState {
    /// Readiness interest registered for a socket in this state. A client
    /// socket whose exchange is in an upstream phase stays read-interested
    /// so a peer close is noticed. A connecting upstream registers both:
    /// write signals completion, read surfaces an early connect error.
    pub fn interest(&self, role: Role) -> Interest {
        match (role, self) {
            (Role::Client, ConnState::WritingResponse) => Interest::WRITABLE,
            (Role::Client, _) => Interest::READABLE,
            (Role::Upstream, ConnState::ConnectingUpstream) => {
                Interest::READABLE | Interest::WRITABLE
            }
            (Role::Upstream, ConnState::WritingUpstream) => Interest::WRITABLE,
            (Role::Upstream, _) => Interest::READABLE,
        }
    }

    /// Only idle/reading client states hold a slot in the timeout heap;
    /// active writes and upstream I/O do not.
    pub fn holds_timeout(&self) -> bool {
        matches!(self, ConnState::ReadingRequest | ConnState::ReadingBody)
    }
}

#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub role: Role,
    /// Client being proxied → its upstream's token; upstream → its client's.
    pub peer: Option<Token>,
    pub state: ConnState,
    /// Read buffer and request parser. Upstream records reuse the raw
    /// buffer inside for response bytes.
    pub request: HttpRequest,
    pub write_buffer: Vec<u8>,
    pub bytes_sent: usize,
    pub file: Option<FileBody>,
    /// HEAD requests get full headers but no payload bytes.
    pub suppress_body: bool,
    /// Server blocks bound to the accepting listener, pinned at accept.
    pub candidates: Vec<Arc<ServerConfig>>,
    /// Block selected by the Host header once headers are parsed.
    pub server: Option<Arc<ServerConfig>>,
    pub requests_served: u32,
    pub keep_alive: bool,
    pub response_status: u16,
    pub last_activity: Instant,
    pub heap_slot: Option<usize>,
    /// Close once the write buffer drains instead of recycling.
    pub closing: bool,

    // Proxy bookkeeping, kept on the client record.
    pub upstream_header_done: bool,
    pub upstream_content_length: Option<u64>,
    pub upstream_forwarded: u64,
    pub upstream_started: bool,
}

impl Connection {
    pub fn new_client(stream: TcpStream, candidates: Vec<Arc<ServerConfig>>) -> Self {
        Self {
            stream,
            role: Role::Client,
            peer: None,
            state: ConnState::ReadingRequest,
            request: HttpRequest::new(),
            write_buffer: Vec::new(),
            bytes_sent: 0,
            file: None,
            suppress_body: false,
            candidates,
            server: None,
            requests_served: 0,
            keep_alive: false,
            response_status: 0,
            last_activity: Instant::now(),
            heap_slot: None,
            closing: false,
            upstream_header_done: false,
            upstream_content_length: None,
            upstream_forwarded: 0,
            upstream_started: false,
        }
    }

    pub fn new_upstream(stream: TcpStream, client: Token) -> Self {
        Self {
            stream,
            role: Role::Upstream,
            peer: Some(client),
            state: ConnState::ConnectingUpstream,
            request: HttpRequest::new(),
            write_buffer: Vec::new(),
            bytes_sent: 0,
            file: None,
            suppress_body: false,
            candidates: Vec::new(),
            server: None,
            requests_served: 0,
            keep_alive: false,
            response_status: 0,
            last_activity: Instant::now(),
            heap_slot: None,
            closing: false,
            upstream_header_done: false,
            upstream_content_length: None,
            upstream_forwarded: 0,
            upstream_started: false,
        }
    }

    /// The server block governing this connection. Before Host-based
    /// selection the first listener block stands in, so limits are always
    /// defined.
    pub fn server_config(&self) -> &Arc<ServerConfig> {
        self.server.as_ref().unwrap_or(&self.candidates[0])
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Recycle the record for the next keep-alive request. Buffers and
    /// cursors reset; residual pipelined bytes survive inside the parser.
    pub fn reset_for_next_request(&mut self) {
        self.request.reset();
        self.write_buffer.clear();
        self.bytes_sent = 0;
        self.file = None;
        self.suppress_body = false;
        self.server = None;
        self.response_status = 0;
        self.peer = None;
        self.upstream_header_done = false;
        self.upstream_content_length = None;
        self.upstream_forwarded = 0;
        self.upstream_started = false;
    }
}

impl TimeoutSlot for Connection {
    fn heap_index(&self) -> Option<usize> {
        self.heap_slot
    }

    fn set_heap_index(&mut self, slot: Option<usize>) {
        self.heap_slot = slot;
    }
}
