use std::path::Path;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use http::Method;

use channel::FileBufferedChannel;
use headers::HeaderTable;
use pool::{Pool, Span};
use reactor::Remote;
use server::chunked::ChunkedBodyParser;
use server::error::ParseError;
use server::parser::HeaderParserState;
use server::{Action, ActionQueue, ClientId, RequestRc};

/// Where a request is in its life on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    InFreelist,
    ParsingHeaders,
    ParsingBody,
    ParsingChunkedBody,
    Upgraded,
    Complete,
    FlushingOutput,
    WaitingForReferences,
    Error,
}

impl HttpState {
    pub fn name(&self) -> &'static str {
        use self::HttpState::*;
        match *self {
            InFreelist => "IN_FREELIST",
            ParsingHeaders => "PARSING_HEADERS",
            ParsingBody => "PARSING_BODY",
            ParsingChunkedBody => "PARSING_CHUNKED_BODY",
            Upgraded => "UPGRADED",
            Complete => "COMPLETE",
            FlushingOutput => "FLUSHING_OUTPUT",
            WaitingForReferences => "WAITING_FOR_REFERENCES",
            Error => "ERROR",
        }
    }
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    NoBody,
    ContentLength,
    Chunked,
    Upgrade,
}

impl BodyType {
    pub fn name(&self) -> &'static str {
        use self::BodyType::*;
        match *self {
            NoBody => "NO_BODY",
            ContentLength => "CONTENT_LENGTH",
            Chunked => "CHUNKED",
            Upgrade => "UPGRADE",
        }
    }
}

/// Body metering, tagged by `BodyType`.
#[derive(Debug)]
pub enum BodyInfo {
    None,
    ContentLength(u64),
    Chunked { end_chunk_reached: bool },
}

/// Parser working state. Tagged by `http_state`; the header and chunked
/// states are never live at the same time.
#[derive(Debug)]
pub enum ParserState {
    None,
    Headers(HeaderParserState),
    Chunked(ChunkedBodyParser),
}

/// Per-request state.
///
/// Only the event-loop thread touches any field here; the refcount is the
/// single cross-thread-shared piece and lives behind an `Arc` so detached
/// references can reach it.
#[derive(Debug)]
pub struct Request {
    pub serial: u64,
    pub refcount: Arc<AtomicUsize>,
    /// Owning client, if any. Cleared when the request reaches zero
    /// references.
    pub client: Option<ClientId>,
    pub http_state: HttpState,
    pub body_type: BodyType,
    pub http_major: u8,
    pub http_minor: u8,
    pub method: Method,
    pub want_keep_alive: bool,
    pub response_begun: bool,
    pub parse_error: Option<ParseError>,
    pub path: Span,
    pub headers: HeaderTable,
    pub secure_headers: HeaderTable,
    pub body_already_read: u64,
    pub body_info: BodyInfo,
    pub body_channel: FileBufferedChannel,
    pub parser_state: ParserState,
    pub pool: Option<Pool>,
}

/// Default size of a fresh request pool.
pub const DEFAULT_POOL_SIZE: usize = 1024;

impl Request {
    pub fn new(serial: u64, buffer_threshold: usize, spill_dir: &Path)
        -> Request
    {
        Request {
            serial: serial,
            refcount: Arc::new(AtomicUsize::new(1)),
            client: None,
            http_state: HttpState::InFreelist,
            body_type: BodyType::NoBody,
            http_major: 1,
            http_minor: 0,
            method: Method::GET,
            want_keep_alive: false,
            response_begun: false,
            parse_error: None,
            path: Span::default(),
            headers: HeaderTable::new(),
            secure_headers: HeaderTable::new(),
            body_already_read: 0,
            body_info: BodyInfo::None,
            body_channel: FileBufferedChannel::new(buffer_threshold, spill_dir),
            parser_state: ParserState::None,
            pool: None,
        }
    }

    /// True once the request concluded its body semantics (or was put to
    /// rest); handlers must not write to it any more.
    pub fn ended(&self) -> bool {
        match self.http_state {
            HttpState::FlushingOutput
            | HttpState::WaitingForReferences
            | HttpState::InFreelist => true,
            _ => false,
        }
    }

    /// True once header parsing delivered a verdict.
    pub fn begun(&self) -> bool {
        match self.http_state {
            HttpState::InFreelist | HttpState::ParsingHeaders => false,
            _ => true,
        }
    }

    pub fn body_fully_read(&self) -> bool {
        match self.body_info {
            BodyInfo::None => self.body_type == BodyType::NoBody,
            BodyInfo::ContentLength(n) => self.body_already_read == n,
            BodyInfo::Chunked { end_chunk_reached } => end_chunk_reached,
        }
    }

    pub fn can_keep_alive(&self) -> bool {
        self.want_keep_alive && self.body_fully_read()
    }

    pub fn content_length(&self) -> Option<u64> {
        match self.body_info {
            BodyInfo::ContentLength(n) => Some(n),
            _ => None,
        }
    }

    /// Reset every field for a new request on a connection. The header
    /// parser state comes from the server's state pool.
    pub fn reinitialize(&mut self, parser_state: HeaderParserState) {
        self.http_major = 1;
        self.http_minor = 0;
        self.http_state = HttpState::ParsingHeaders;
        self.body_type = BodyType::NoBody;
        self.method = Method::GET;
        self.want_keep_alive = false;
        self.response_begun = false;
        self.parse_error = None;
        self.path = Span::default();
        self.headers.clear();
        self.secure_headers.clear();
        self.body_already_read = 0;
        self.body_info = BodyInfo::None;
        self.body_channel.reinitialize();
        self.parser_state = ParserState::Headers(parser_state);
        self.pool = Some(Pool::new(DEFAULT_POOL_SIZE));
    }

    /// Tear the request down. Idempotent: the disconnect path can run it
    /// after `end_request` already has. Returns the header parser state,
    /// if still held, so the server can return it to the pool.
    pub fn deinitialize(&mut self) -> Option<HeaderParserState> {
        let parser_state =
            match ::std::mem::replace(&mut self.parser_state, ParserState::None) {
                ParserState::Headers(state) => Some(state),
                _ => None,
            };
        self.path = Span::default();
        self.headers.clear();
        self.secure_headers.clear();
        self.pool = None;
        self.body_channel.deinitialize();
        self.http_state = HttpState::WaitingForReferences;
        parser_state
    }
}

/// Loop-thread smart reference to a request.
///
/// Cloning bumps the shared count; dropping the last one enqueues the
/// zero-refcount action so finalization runs exactly once, on the loop
/// thread, outside whatever call stack dropped the reference.
pub struct RequestRef {
    req: RequestRc,
    refcount: Arc<AtomicUsize>,
    actions: ActionQueue,
}

impl RequestRef {
    /// Take ownership of an existing count (the freelist's resting
    /// reference) without incrementing.
    pub fn adopt(req: RequestRc, actions: ActionQueue) -> RequestRef {
        let refcount = req.borrow().refcount.clone();
        debug_assert!(refcount.load(Ordering::Relaxed) >= 1);
        RequestRef { req: req, refcount: refcount, actions: actions }
    }

    pub fn request(&self) -> &RequestRc {
        &self.req
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }
}

impl Clone for RequestRef {
    fn clone(&self) -> RequestRef {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        RequestRef {
            req: self.req.clone(),
            refcount: self.refcount.clone(),
            actions: self.actions.clone(),
        }
    }
}

impl Drop for RequestRef {
    fn drop(&mut self) {
        let old = self.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(old >= 1);
        if old == 1 {
            fence(Ordering::Acquire);
            self.actions.borrow_mut()
                .push_back(Action::RequestZero(self.req.clone()));
        }
    }
}

/// Send-able reference for work handed to other threads.
///
/// Dropping it posts a release through the reactor; the loop thread then
/// drops the real reference, so the zero transition always happens there.
pub struct RemoteRequestRef {
    id: u64,
    remote: Remote,
}

impl RemoteRequestRef {
    pub fn new(id: u64, remote: Remote) -> RemoteRequestRef {
        RemoteRequestRef { id: id, remote: remote }
    }
}

impl Drop for RemoteRequestRef {
    fn drop(&mut self) {
        self.remote.release_ref(self.id);
    }
}
