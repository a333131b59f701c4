//! The HTTP/1.x connection server core.
//!
//! A single event-loop thread owns every client, request, parser, channel
//! and the request freelist. Socket readiness drives a per-connection
//! dispatch keyed on the current request's HTTP state; handler hooks run
//! on the loop thread and call back into [`ServerCore`]. Transitions that
//! would otherwise reenter the state machine mid-callback (ending a
//! request, disconnecting, zero-refcount finalization) are pushed onto an
//! action queue and run after the current callback unwinds.

pub mod chunked;
pub mod client;
pub mod error;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod response;

use std::cell::RefCell;
use std::cmp::min;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use mio::net::TcpListener;
use mio::{Events, Interest, Token};
use serde_json::Value;
use slab::Slab;

use channel::{ChannelError, Consumed, Fetch};
use mbuf::Mbuf;
use reactor::{Reactor, Remote, Task, WAKER_TOKEN};
use self::chunked::{ChunkStatus, ChunkedBodyParser};
use self::client::{Client, ClientState};
use self::error::ParseError;
use self::parser::HeaderParserStatePool;
use self::protocol::Handler;
use self::request::{BodyInfo, HttpState, ParserState, RemoteRequestRef,
    Request, RequestRef};

/// httparse wants the header array preallocated, so be wise about it.
pub const MAX_HEADERS_NUM: usize = 256;
/// Upper bound on an accumulated request head.
pub const MAX_HEADERS_SIZE: usize = 16384;
/// Maximum length of a chunk size line, extensions included.
pub const MAX_CHUNK_HEAD: usize = 128;

const LISTENER_TOKEN: Token = Token(::std::usize::MAX - 2);

pub type RequestRc = Rc<RefCell<Request>>;
pub type ClientRc = Rc<RefCell<Client>>;
pub type ActionQueue = Rc<RefCell<VecDeque<Action>>>;

/// Stable identity of a client: slab token plus connection number, so a
/// recycled token from a later connection never aliases an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId {
    pub token: usize,
    pub number: u64,
}

/// Deferred work for the loop thread.
pub enum Action {
    ProcessInput(ClientId),
    RequestBodyConsumed(ClientId),
    PumpBody(ClientId),
    EndRequest(ClientId),
    OutputFlushed(ClientId),
    HandleNextRequest(ClientId),
    Disconnect(ClientId),
    RequestZero(RequestRc),
}

/// Embedding context: the reactor plus channel tuning.
pub struct Context {
    pub reactor: Reactor,
    /// Directory for anonymous file-buffer spill files.
    pub spill_dir: PathBuf,
    /// Channel backpressure threshold in bytes.
    pub file_buffer_threshold: usize,
    /// Size of one socket read.
    pub read_buffer_size: usize,
}

impl Context {
    pub fn new<P: Into<PathBuf>>(spill_dir: P) -> io::Result<Context> {
        Ok(Context {
            reactor: Reactor::new()?,
            spill_dir: spill_dir.into(),
            file_buffer_threshold: 128 * 1024,
            read_buffer_size: 16 * 1024,
        })
    }
}

/// Cooperative stop switch usable from any thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    remote: Remote,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.remote.run_later(|| {});
    }
}

/// State owned by the loop thread, minus the handler. This is the surface
/// hooks are allowed to call back into.
pub struct ServerCore {
    ctx: Context,
    listener: Option<TcpListener>,
    clients: Slab<ClientRc>,
    actions: ActionQueue,
    freelist: Vec<RequestRc>,
    request_freelist_limit: usize,
    accept_burst_count: usize,
    parser_pool: HeaderParserStatePool,
    detached: HashMap<u64, RequestRef>,
    next_detach_id: u64,
    next_connection_number: u64,
    next_request_serial: u64,
    total_requests_accepted: u64,
    total_clients_accepted: u64,
    stop: Arc<AtomicBool>,
}

impl ServerCore {
    fn new(ctx: Context) -> ServerCore {
        ServerCore {
            ctx: ctx,
            listener: None,
            clients: Slab::new(),
            actions: Rc::new(RefCell::new(VecDeque::new())),
            freelist: Vec::new(),
            request_freelist_limit: 1024,
            accept_burst_count: 32,
            parser_pool: HeaderParserStatePool::new(256),
            detached: HashMap::new(),
            next_detach_id: 0,
            next_connection_number: 1,
            next_request_serial: 1,
            total_requests_accepted: 0,
            total_clients_accepted: 0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn enqueue(&self, action: Action) {
        self.actions.borrow_mut().push_back(action);
    }

    fn client_rc(&self, id: ClientId) -> Option<ClientRc> {
        match self.clients.get(id.token) {
            Some(rc) if rc.borrow().number == id.number => Some(rc.clone()),
            _ => None,
        }
    }

    fn client_id_for_token(&self, token: usize) -> Option<ClientId> {
        self.clients.get(token)
            .map(|rc| ClientId { token: token, number: rc.borrow().number })
    }

    fn current_request_rc(&self, id: ClientId) -> Option<RequestRc> {
        self.client_rc(id).and_then(|rc| {
            let c = rc.borrow();
            c.current_request.as_ref().map(|r| r.request().clone())
        })
    }

    fn checkout_request_object(&mut self) -> (RequestRc, bool) {
        match self.freelist.pop() {
            Some(rc) => {
                assert_eq!(rc.borrow().http_state, HttpState::InFreelist);
                trace!("checked out request object from freelist ({} left)",
                    self.freelist.len());
                (rc, false)
            }
            None => {
                let serial = self.next_request_serial;
                self.next_request_serial += 1;
                trace!("creating new request object #{}", serial);
                let req = Request::new(serial,
                    self.ctx.file_buffer_threshold, &self.ctx.spill_dir);
                (Rc::new(RefCell::new(req)), true)
            }
        }
    }

    /// Zero-refcount finalization: drop the request from its client's
    /// ended list and recycle it through the bounded freelist.
    fn finalize_request(&mut self, req_rc: RequestRc) {
        let client_id = {
            let mut req = req_rc.borrow_mut();
            assert_eq!(req.http_state, HttpState::WaitingForReferences,
                "request finalized in unexpected state");
            req.client.take()
        };
        if let Some(id) = client_id {
            if let Some(client_rc) = self.client_rc(id) {
                client_rc.borrow_mut().remove_ended(&req_rc);
            }
        }
        if self.freelist.len() < self.request_freelist_limit {
            {
                let mut req = req_rc.borrow_mut();
                req.refcount.store(1, Ordering::Relaxed);
                req.http_state = HttpState::InFreelist;
            }
            self.freelist.push(req_rc);
            trace!("request object added to freelist ({} cached)",
                self.freelist.len());
        } else {
            trace!("request object destroyed; freelist is full ({})",
                self.freelist.len());
            drop(req_rc);
        }
        if let Some(id) = client_id {
            self.maybe_destroy_client(id);
        }
    }

    fn maybe_destroy_client(&mut self, id: ClientId) {
        let destroy = match self.client_rc(id) {
            Some(rc) => {
                let c = rc.borrow();
                c.state == ClientState::Disconnected
                    && c.current_request.is_none()
                    && c.ended_requests.is_empty()
            }
            None => false,
        };
        if destroy {
            debug!("[Client {}] destroyed", id.number);
            self.clients.remove(id.token);
        }
    }

    /// Write raw response bytes. The first call marks the response begun.
    pub fn write_response(&mut self, id: ClientId, data: &[u8]) {
        let client_rc = match self.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let failed = {
            let mut c = client_rc.borrow_mut();
            if let Some(ref req_ref) = c.current_request {
                req_ref.request().borrow_mut().response_begun = true;
            }
            c.output.feed(Mbuf::copy_from(data)).is_err()
        };
        if failed {
            error!("[Client {}] failed to buffer response output", id.number);
            self.disconnect(id);
            return;
        }
        self.flush_output(id);
    }

    /// Render and write a complete simple response. The body is withheld
    /// for HEAD requests, but Content-Length still reflects it.
    pub fn write_simple_response(&mut self, id: ClientId, code: u16,
        headers: &[(&str, &str)], body: &[u8])
    {
        let req_rc = match self.current_request_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let (head, write_body) = {
            let mut req = req_rc.borrow_mut();
            let head = response::render_simple_response(
                &mut req, code, headers, body.len());
            let write_body = !req.ended() && req.method != Method::HEAD;
            (head, write_body)
        };
        self.write_response(id, &head);
        if write_body && !body.is_empty() {
            self.write_response(id, body);
        }
    }

    /// Conclude the current request. If the response output has already
    /// drained the request advances immediately; otherwise it flips to
    /// FLUSHING_OUTPUT and advances when the output channel reports the
    /// data flushed.
    pub fn end_request(&mut self, id: ClientId) {
        self.enqueue(Action::EndRequest(id));
    }

    /// Answer with an error page, force the connection closed, and end
    /// the request.
    pub fn end_with_error_response(&mut self, id: ClientId, code: u16,
        body: &str)
    {
        self.write_simple_response(id, code, &[
            ("connection", "close"),
            ("cache-control", "no-cache, no-store, must-revalidate"),
        ], body.as_bytes());
        self.end_request(id);
    }

    pub fn end_as_bad_request(&mut self, id: ClientId, body: &str) {
        self.end_with_error_response(id, 400, body);
    }

    /// Drop the connection. The current request, if any, is deinitialized
    /// and its reference released.
    pub fn disconnect(&mut self, id: ClientId) {
        self.enqueue(Action::Disconnect(id));
    }

    /// Resume body delivery after a partial consume.
    pub fn resume_request_body(&mut self, id: ClientId) {
        self.enqueue(Action::PumpBody(id));
    }

    /// Turn a loop-thread reference into one that may travel to another
    /// thread. Dropping it anywhere posts the release back to the loop.
    pub fn detach_request(&mut self, req: &RequestRef) -> RemoteRequestRef {
        let id = self.next_detach_id;
        self.next_detach_id += 1;
        self.detached.insert(id, req.clone());
        RemoteRequestRef::new(id, self.ctx.reactor.remote())
    }

    pub fn remote(&self) -> Remote {
        self.ctx.reactor.remote()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            remote: self.ctx.reactor.remote(),
        }
    }

    pub fn free_request_count(&self) -> usize {
        self.freelist.len()
    }

    pub fn total_requests_accepted(&self) -> u64 {
        self.total_requests_accepted
    }

    pub fn active_client_count(&self) -> usize {
        self.clients.len()
    }

    /// Flush pending output to the socket; queue the FLUSHING_OUTPUT
    /// advancement when the stream tail went out.
    fn flush_output(&mut self, id: ClientId) {
        let client_rc = match self.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let (result, flushed) = {
            let mut c = client_rc.borrow_mut();
            let Client { ref mut socket, ref mut output, .. } = *c;
            let result = output.flush(socket);
            (result, output.take_data_flushed_edge())
        };
        if let Err(e) = result {
            debug!("[Client {}] output error: {}", id.number, e);
            self.disconnect(id);
            return;
        }
        if flushed {
            self.enqueue(Action::OutputFlushed(id));
        }
    }

    pub fn configure(&mut self, doc: &Value) {
        if let Some(n) = doc.get("request_freelist_limit")
            .and_then(|v| v.as_u64())
        {
            self.request_freelist_limit = n as usize;
        }
        if let Some(n) = doc.get("accept_burst_count").and_then(|v| v.as_u64()) {
            self.accept_burst_count = n as usize;
        }
        if let Some(n) = doc.get("client_read_buffer_size")
            .and_then(|v| v.as_u64())
        {
            self.ctx.read_buffer_size = n as usize;
        }
        if let Some(n) = doc.get("file_buffer_threshold")
            .and_then(|v| v.as_u64())
        {
            self.ctx.file_buffer_threshold = n as usize;
        }
    }

    pub fn get_config_as_json(&self) -> Value {
        json!({
            "request_freelist_limit": self.request_freelist_limit as u64,
            "accept_burst_count": self.accept_burst_count as u64,
            "client_read_buffer_size": self.ctx.read_buffer_size as u64,
            "file_buffer_threshold": self.ctx.file_buffer_threshold as u64,
        })
    }

    pub fn inspect_state_as_json(&self) -> Value {
        json!({
            "free_request_count": self.freelist.len() as u64,
            "total_requests_accepted": self.total_requests_accepted,
            "active_client_count": self.clients.len() as u64,
            "total_clients_accepted": self.total_clients_accepted,
        })
    }

    pub fn inspect_client_state_as_json(&self, id: ClientId) -> Value {
        let client_rc = match self.client_rc(id) {
            Some(rc) => rc,
            None => return Value::Null,
        };
        let c = client_rc.borrow();
        let mut doc = json!({
            "number": c.number,
            "connection_state": c.state.name(),
            "ended_request_count": c.ended_request_count() as u64,
        });
        if let Some(ref req_ref) = c.current_request {
            doc["current_request"] =
                self.inspect_request_state_as_json(&req_ref.request().borrow());
        }
        doc
    }

    pub fn inspect_request_state_as_json(&self, req: &Request) -> Value {
        assert!(req.http_state != HttpState::InFreelist);
        let mut doc = json!({
            "refcount": req.refcount.load(Ordering::Relaxed) as u64,
            "http_state": req.http_state.name(),
        });
        if !req.begun() {
            return doc;
        }
        doc["http_major"] = json!(req.http_major);
        doc["http_minor"] = json!(req.http_minor);
        doc["want_keep_alive"] = json!(req.want_keep_alive);
        doc["request_body_type"] = json!(req.body_type.name());
        doc["request_body_fully_read"] = json!(req.body_fully_read());
        doc["request_body_already_read"] = json!(req.body_already_read);
        doc["response_begun"] = json!(req.response_begun);
        doc["method"] = json!(req.method.as_str());
        if req.http_state != HttpState::Error {
            match req.body_info {
                BodyInfo::ContentLength(n) => {
                    doc["content_length"] = json!(n);
                }
                BodyInfo::Chunked { end_chunk_reached } => {
                    doc["end_chunk_reached"] = json!(end_chunk_reached);
                }
                BodyInfo::None => {}
            }
        } else if let Some(ref err) = req.parse_error {
            doc["parse_error"] = json!(format!("{}", err));
        }
        if let Some(ref pool) = req.pool {
            doc["path"] = json!(
                String::from_utf8_lossy(pool.get(req.path)).into_owned());
            if let Some(host) = req.headers.lookup(pool, "host") {
                doc["host"] = json!(
                    String::from_utf8_lossy(host).into_owned());
            }
        }
        doc
    }
}

enum ReadOutcome {
    Data,
    WouldBlock,
    Eof,
    Error,
    Gone,
}

/// The server state machine, generic over its application handler.
pub struct HttpServer<H: Handler> {
    core: ServerCore,
    handler: H,
}

impl<H: Handler> HttpServer<H> {
    pub fn new(ctx: Context, handler: H) -> HttpServer<H> {
        HttpServer { core: ServerCore::new(ctx), handler: handler }
    }

    pub fn core(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    pub fn core_ref(&self) -> &ServerCore {
        &self.core
    }

    /// Bind and start accepting. Returns the actual local address, which
    /// matters when binding port 0.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.core.ctx.reactor.register(&mut listener, LISTENER_TOKEN,
            Interest::READABLE)?;
        self.core.listener = Some(listener);
        Ok(local)
    }

    /// Run until the stop handle fires.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.core.stop.load(Ordering::SeqCst) {
            self.poll_once(Some(Duration::from_millis(100)))?;
        }
        Ok(())
    }

    /// One poll-dispatch-drain cycle.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        self.core.ctx.reactor.poll(&mut events, timeout)?;
        let fired: Vec<(Token, bool, bool)> = events.iter()
            .map(|e| (e.token(),
                      e.is_readable() || e.is_read_closed(),
                      e.is_writable()))
            .collect();
        for (token, readable, writable) in fired {
            self.handle_event(token, readable, writable);
        }
        self.drain();
        Ok(())
    }

    fn handle_event(&mut self, token: Token, readable: bool, writable: bool) {
        if token == WAKER_TOKEN {
            return;
        }
        if token == LISTENER_TOKEN {
            self.accept_clients();
            return;
        }
        let id = match self.core.client_id_for_token(token.0) {
            Some(id) => id,
            None => return,
        };
        if writable {
            self.core.flush_output(id);
        }
        if readable {
            self.process_input(id);
        }
    }

    /// Run deferred actions and reactor tasks until both queues are dry.
    fn drain(&mut self) {
        loop {
            let action = self.core.actions.borrow_mut().pop_front();
            if let Some(action) = action {
                self.handle_action(action);
                continue;
            }
            let tasks = self.core.ctx.reactor.take_tasks();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                match task {
                    Task::Run(f) => f(),
                    Task::ReleaseRef(id) => {
                        // dropping the stored reference performs the
                        // release on this thread
                        self.core.detached.remove(&id);
                    }
                }
            }
        }
    }

    fn handle_action(&mut self, action: Action) {
        match action {
            Action::ProcessInput(id) => self.process_input(id),
            Action::RequestBodyConsumed(id) => {
                self.request_body_consumed(id);
                self.pump_body(id);
            }
            Action::PumpBody(id) => self.pump_body(id),
            Action::EndRequest(id) => self.do_end_request(id),
            Action::OutputFlushed(id) => self.output_flushed(id),
            Action::HandleNextRequest(id) => self.handle_next_request(id),
            Action::Disconnect(id) => self.do_disconnect(id),
            Action::RequestZero(rc) => self.core.finalize_request(rc),
        }
    }

    fn accept_clients(&mut self) {
        for _ in 0..self.core.accept_burst_count {
            let accepted = match self.core.listener {
                Some(ref listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((mut sock, _peer)) => {
                    let number = self.core.next_connection_number;
                    self.core.next_connection_number += 1;
                    let entry = self.core.clients.vacant_entry();
                    let token = entry.key();
                    if let Err(e) = self.core.ctx.reactor.register(&mut sock,
                        Token(token), Interest::READABLE | Interest::WRITABLE)
                    {
                        error!("[Client {}] cannot register socket: {}",
                            number, e);
                        continue;
                    }
                    let client = Client::new(number, sock,
                        self.core.ctx.file_buffer_threshold,
                        &self.core.ctx.spill_dir);
                    entry.insert(Rc::new(RefCell::new(client)));
                    self.core.total_clients_accepted += 1;
                    let id = ClientId { token: token, number: number };
                    debug!("[Client {}] accepted", number);
                    self.handler.on_client_object_created(&mut self.core, id);
                    self.handler.on_client_accepted(&mut self.core, id);
                    self.handle_next_request(id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Start serving the next request on this connection: restart input,
    /// reset the output stream, check a request object out and
    /// reinitialize it.
    fn handle_next_request(&mut self, id: ClientId) {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        {
            let mut c = client_rc.borrow_mut();
            if c.state == ClientState::Disconnected {
                return;
            }
            c.input.start();
            c.output.reinitialize();
        }
        let (req_rc, is_new) = self.core.checkout_request_object();
        let req_ref = RequestRef::adopt(req_rc.clone(),
            self.core.actions.clone());
        if is_new {
            self.handler.on_request_object_created(&mut self.core, id,
                &req_ref);
        }
        {
            let mut req = req_rc.borrow_mut();
            req.client = Some(id);
            let parser_state = self.core.parser_pool.construct();
            req.reinitialize(parser_state);
        }
        self.handler.reinitialize_request(&mut self.core, id, &req_ref);
        client_rc.borrow_mut().current_request = Some(req_ref);
        // pick up bytes that arrived with the previous request
        self.core.enqueue(Action::ProcessInput(id));
    }

    /// Pump the input channel: deliver queued chunks to the dispatch,
    /// refill from the socket, and surface EOF or errors in order.
    fn process_input(&mut self, id: ClientId) {
        loop {
            let client_rc = match self.core.client_rc(id) {
                Some(rc) => rc,
                None => return,
            };
            {
                let c = client_rc.borrow();
                if c.state == ClientState::Disconnected || !c.input.is_started() {
                    return;
                }
            }
            let chunk = { client_rc.borrow_mut().input.take() };
            if let Some(buf) = chunk {
                let result = self.dispatch_data(id, &buf);
                if result.bytes < buf.len() {
                    if let Some(rc) = self.core.client_rc(id) {
                        rc.borrow_mut().input
                            .untake(buf.slice(result.bytes..buf.len()));
                    }
                }
                if result.end {
                    return;
                }
                continue;
            }
            match self.read_socket(id) {
                ReadOutcome::Data => {}
                ReadOutcome::WouldBlock | ReadOutcome::Gone => return,
                ReadOutcome::Eof => {
                    let fire = {
                        client_rc.borrow_mut().input.take_eof_event()
                    };
                    if fire {
                        self.dispatch_eof(id);
                    }
                    return;
                }
                ReadOutcome::Error => {
                    let errno = {
                        client_rc.borrow_mut().input.take_error_event()
                    };
                    if let Some(errno) = errno {
                        self.dispatch_input_error(id, errno);
                    }
                    return;
                }
            }
        }
    }

    fn read_socket(&mut self, id: ClientId) -> ReadOutcome {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return ReadOutcome::Gone,
        };
        let mut c = client_rc.borrow_mut();
        let mut buf = vec![0u8; self.core.ctx.read_buffer_size];
        loop {
            match c.socket.read(&mut buf) {
                Ok(0) => {
                    c.input.set_eof();
                    return ReadOutcome::Eof;
                }
                Ok(n) => {
                    buf.truncate(n);
                    c.input.push(Mbuf::from_vec(buf));
                    return ReadOutcome::Data;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::WouldBlock;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    c.input.set_error(e.raw_os_error().unwrap_or(0));
                    return ReadOutcome::Error;
                }
            }
        }
    }

    /// Dispatch one input chunk on the current request's state.
    fn dispatch_data(&mut self, id: ClientId, buf: &Mbuf) -> Consumed {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return Consumed::new(0, true),
        };
        let req_ref = {
            let c = client_rc.borrow();
            match c.current_request {
                Some(ref r) => r.clone(),
                None => panic!("input dispatched with no current request"),
            }
        };
        let state = { req_ref.request().borrow().http_state };
        match state {
            HttpState::ParsingHeaders => self.headers_data(id, &req_ref, buf),
            HttpState::ParsingBody => self.body_data(id, &req_ref, buf),
            HttpState::ParsingChunkedBody => {
                self.chunked_data(id, &req_ref, buf)
            }
            HttpState::Upgraded => self.upgraded_data(id, &req_ref, buf),
            other => panic!("invalid request HTTP state {:?} for input", other),
        }
    }

    fn begin_request(&mut self, id: ClientId, req_ref: &RequestRef) {
        self.core.total_requests_accepted += 1;
        self.handler.on_request_begin(&mut self.core, id, req_ref);
    }

    fn headers_data(&mut self, id: ClientId, req_ref: &RequestRef, buf: &Mbuf)
        -> Consumed
    {
        let req_rc = req_ref.request().clone();
        let consumed = {
            let mut req = req_rc.borrow_mut();
            parser::feed(&mut self.core.parser_pool, &mut req, buf)
        };
        let state = { req_rc.borrow().http_state };
        match state {
            HttpState::ParsingHeaders => Consumed::new(buf.len(), false),
            HttpState::Complete => {
                debug!("[Client {}] new request received", id.number);
                if let Some(rc) = self.core.client_rc(id) {
                    rc.borrow_mut().input.stop();
                }
                self.begin_request(id, req_ref);
                Consumed::new(consumed, false)
            }
            HttpState::ParsingBody => {
                debug!("[Client {}] expecting a request body", id.number);
                self.begin_request(id, req_ref);
                // a zero-length body must see its EOF right away
                self.core.enqueue(Action::RequestBodyConsumed(id));
                Consumed::new(consumed, false)
            }
            HttpState::ParsingChunkedBody => {
                debug!("[Client {}] expecting a chunked request body",
                    id.number);
                req_rc.borrow_mut().parser_state =
                    ParserState::Chunked(ChunkedBodyParser::new());
                self.begin_request(id, req_ref);
                Consumed::new(consumed, false)
            }
            HttpState::Upgraded => {
                if self.handler.supports_upgrade(&mut self.core, id, req_ref) {
                    debug!("[Client {}] expecting connection upgrade",
                        id.number);
                    self.begin_request(id, req_ref);
                    Consumed::new(consumed, false)
                } else {
                    self.core.end_as_bad_request(id,
                        "Bad request (connection upgrading not allowed \
                         for this request)");
                    Consumed::new(0, true)
                }
            }
            HttpState::Error => {
                let version_unsupported;
                let desc;
                {
                    let mut req = req_rc.borrow_mut();
                    // flip the state so the error response body is written
                    req.http_state = HttpState::Complete;
                    match req.parse_error {
                        Some(ParseError::VersionNotSupported) => {
                            version_unsupported = true;
                            desc = String::new();
                        }
                        Some(ref e) => {
                            version_unsupported = false;
                            desc = format!("{}", e);
                        }
                        None => panic!("error state without a parse error"),
                    }
                }
                if version_unsupported {
                    self.core.end_with_error_response(id, 505,
                        "HTTP version not supported\n");
                } else {
                    self.core.end_as_bad_request(id, &desc);
                }
                Consumed::new(0, true)
            }
            other => panic!("invalid post-parse HTTP state {:?}", other),
        }
    }

    fn body_data(&mut self, id: ClientId, req_ref: &RequestRef, buf: &Mbuf)
        -> Consumed
    {
        let req_rc = req_ref.request().clone();
        let mut feed_failed = false;
        let (taken, ended, passed) = {
            let mut req = req_rc.borrow_mut();
            let content_length = match req.body_info {
                BodyInfo::ContentLength(n) => n,
                _ => panic!("body state without a content length"),
            };
            let max_remaining = content_length - req.body_already_read;
            let taken = min(buf.len() as u64, max_remaining) as usize;
            req.body_already_read += taken as u64;
            trace!("[Client {}] request body: {} of {} bytes already read",
                id.number, req.body_already_read, content_length);
            if taken > 0 {
                if req.body_channel.feed(buf.slice(0..taken)).is_err() {
                    feed_failed = true;
                }
            }
            (taken, req.ended(), req.body_channel.passed_threshold())
        };
        if feed_failed {
            error!("[Client {}] cannot buffer request body", id.number);
            self.core.disconnect(id);
            return Consumed::new(0, true);
        }
        if !ended {
            if !passed {
                self.request_body_consumed(id);
            } else if let Some(rc) = self.core.client_rc(id) {
                rc.borrow_mut().input.stop();
            }
        }
        self.pump_body(id);
        Consumed::new(taken, false)
    }

    fn chunked_data(&mut self, id: ClientId, req_ref: &RequestRef, buf: &Mbuf)
        -> Consumed
    {
        let req_rc = req_ref.request().clone();
        let feed_result = {
            let mut req = req_rc.borrow_mut();
            let req = &mut *req;
            let parser = match req.parser_state {
                ParserState::Chunked(ref mut p) => p,
                _ => panic!("chunked body state without its parser"),
            };
            parser.feed(&mut req.body_channel, buf)
        };
        let result = match feed_result {
            Ok(result) => result,
            Err(e) => {
                error!("[Client {}] cannot buffer request body: {}",
                    id.number, e);
                self.core.disconnect(id);
                return Consumed::new(0, true);
            }
        };
        let passed = {
            let mut req = req_rc.borrow_mut();
            req.body_already_read += result.consumed as u64;
            if result.status == ChunkStatus::End {
                req.body_info = BodyInfo::Chunked { end_chunk_reached: true };
            }
            req.body_channel.passed_threshold()
        };
        match result.status {
            ChunkStatus::End | ChunkStatus::Error => {
                if let Some(rc) = self.core.client_rc(id) {
                    rc.borrow_mut().input.stop();
                }
            }
            ChunkStatus::Progress => {
                if passed {
                    if let Some(rc) = self.core.client_rc(id) {
                        rc.borrow_mut().input.stop();
                    }
                }
            }
        }
        self.pump_body(id);
        Consumed::new(result.consumed, result.status == ChunkStatus::Error)
    }

    fn upgraded_data(&mut self, id: ClientId, req_ref: &RequestRef, buf: &Mbuf)
        -> Consumed
    {
        let req_rc = req_ref.request().clone();
        let mut feed_failed = false;
        let (ended, passed) = {
            let mut req = req_rc.borrow_mut();
            req.body_already_read += buf.len() as u64;
            if req.body_channel.feed(buf.clone()).is_err() {
                feed_failed = true;
            }
            (req.ended(), req.body_channel.passed_threshold())
        };
        if feed_failed {
            error!("[Client {}] cannot buffer upgraded input", id.number);
            self.core.disconnect(id);
            return Consumed::new(0, true);
        }
        if !ended && passed {
            if let Some(rc) = self.core.client_rc(id) {
                rc.borrow_mut().input.stop();
            }
        }
        self.pump_body(id);
        Consumed::new(buf.len(), false)
    }

    fn dispatch_eof(&mut self, id: ClientId) {
        let req_rc = match self.core.current_request_rc(id) {
            Some(rc) => rc,
            None => {
                self.core.disconnect(id);
                return;
            }
        };
        let state = { req_rc.borrow().http_state };
        match state {
            HttpState::ParsingHeaders => {
                debug!("[Client {}] EOF while parsing headers", id.number);
                self.do_disconnect(id);
            }
            HttpState::ParsingBody => {
                let fully = { req_rc.borrow().body_fully_read() };
                {
                    let mut req = req_rc.borrow_mut();
                    if fully {
                        if !req.body_channel.ended() {
                            let _ = req.body_channel.feed(Mbuf::empty());
                        }
                    } else {
                        debug!("[Client {}] EOF before finishing request \
                                body ({} bytes read)",
                            id.number, req.body_already_read);
                        if !req.body_channel.ended() {
                            req.body_channel
                                .feed_error(ChannelError::UnexpectedEof);
                        }
                    }
                }
                self.pump_body(id);
            }
            HttpState::ParsingChunkedBody => {
                {
                    let mut req = req_rc.borrow_mut();
                    let req = &mut *req;
                    if let ParserState::Chunked(ref mut p) = req.parser_state {
                        p.feed_unexpected_eof(&mut req.body_channel);
                    }
                }
                self.pump_body(id);
            }
            HttpState::Upgraded => {
                {
                    let mut req = req_rc.borrow_mut();
                    if !req.body_channel.ended() {
                        let _ = req.body_channel.feed(Mbuf::empty());
                    }
                }
                self.pump_body(id);
            }
            _ => self.core.disconnect(id),
        }
    }

    fn dispatch_input_error(&mut self, id: ClientId, errno: i32) {
        let req_rc = match self.core.current_request_rc(id) {
            Some(rc) => rc,
            None => {
                self.core.disconnect(id);
                return;
            }
        };
        let state = { req_rc.borrow().http_state };
        match state {
            HttpState::ParsingHeaders => self.do_disconnect(id),
            HttpState::ParsingBody | HttpState::Upgraded => {
                {
                    let mut req = req_rc.borrow_mut();
                    if !req.body_channel.ended() {
                        req.body_channel.feed_error(ChannelError::Io(errno));
                    }
                }
                self.pump_body(id);
            }
            HttpState::ParsingChunkedBody => {
                {
                    let mut req = req_rc.borrow_mut();
                    let req = &mut *req;
                    if let ParserState::Chunked(ref mut p) = req.parser_state {
                        p.feed_io_error(&mut req.body_channel, errno);
                    }
                }
                self.pump_body(id);
            }
            _ => self.core.disconnect(id),
        }
    }

    /// When the body is fully read: stop reading and feed the body
    /// channel its EOF.
    fn request_body_consumed(&mut self, id: ClientId) {
        let req_rc = match self.core.current_request_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let fully = {
            let req = req_rc.borrow();
            match req.http_state {
                HttpState::ParsingBody | HttpState::Upgraded => {
                    req.body_fully_read()
                }
                _ => return,
            }
        };
        if !fully {
            return;
        }
        if let Some(rc) = self.core.client_rc(id) {
            rc.borrow_mut().input.stop();
        }
        let mut req = req_rc.borrow_mut();
        if !req.body_channel.ended() {
            let _ = req.body_channel.feed(Mbuf::empty());
        }
    }

    /// Deliver whatever the body channel holds to the handler,
    /// acknowledging as it goes; restart input when backpressure lifts.
    fn pump_body(&mut self, id: ClientId) {
        loop {
            let req_ref = {
                let client_rc = match self.core.client_rc(id) {
                    Some(rc) => rc,
                    None => return,
                };
                let c = client_rc.borrow();
                match c.current_request {
                    Some(ref r) => r.clone(),
                    None => return,
                }
            };
            let req_rc = req_ref.request().clone();
            let fetched = { req_rc.borrow_mut().body_channel.fetch() };
            let fetched = match fetched {
                Ok(f) => f,
                Err(e) => {
                    error!("[Client {}] cannot read body buffer: {}",
                        id.number, e);
                    self.core.disconnect(id);
                    return;
                }
            };
            let mut paused = false;
            match fetched {
                Fetch::Data(chunk) => {
                    let result = self.handler.on_request_body(
                        &mut self.core, id, &req_ref, &chunk, None);
                    if result.bytes < chunk.len() {
                        req_rc.borrow_mut().body_channel
                            .unfetch(chunk.slice(result.bytes..chunk.len()));
                        paused = true;
                    }
                }
                Fetch::End => {
                    let _ = self.handler.on_request_body(
                        &mut self.core, id, &req_ref, &Mbuf::empty(), None);
                    req_rc.borrow_mut().body_channel.ack_end();
                }
                Fetch::Error(e) => {
                    let _ = self.handler.on_request_body(
                        &mut self.core, id, &req_ref, &Mbuf::empty(), Some(e));
                }
                Fetch::Idle => return,
            }
            let flushed = {
                req_rc.borrow_mut().body_channel.take_buffers_flushed_edge()
            };
            if flushed {
                if let Some(rc) = self.core.client_rc(id) {
                    rc.borrow_mut().input.start();
                }
                self.request_body_consumed(id);
                self.core.enqueue(Action::ProcessInput(id));
            }
            if paused {
                return;
            }
        }
    }

    /// The `end_request` flow: canned 500 when nothing was written,
    /// teardown that preserves the pool while output flushes, then either
    /// advance immediately or wait for the flush.
    fn do_end_request(&mut self, id: ClientId) {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let req_ref = {
            let c = client_rc.borrow();
            match c.current_request {
                Some(ref r) => r.clone(),
                None => return,
            }
        };
        let req_rc = req_ref.request().clone();
        if req_rc.borrow().ended() {
            return;
        }
        debug!("[Client {}] ending request", id.number);

        let response_begun = { req_rc.borrow().response_begun };
        if !response_begun {
            self.core.write_simple_response(id, 500, &[],
                response::DEFAULT_INTERNAL_SERVER_ERROR_RESPONSE.as_bytes());
        }

        // The response bytes still flushing out may refer to pool-backed
        // storage, so the pool survives teardown until the output drains.
        {
            let mut req = req_rc.borrow_mut();
            let pool = req.pool.take();
            let parser_state = req.deinitialize();
            if let Some(state) = parser_state {
                self.core.parser_pool.destroy(state);
            }
            req.pool = pool;
        }
        self.handler.deinitialize_request(&mut self.core, id, &req_ref);
        {
            let mut c = client_rc.borrow_mut();
            if !c.has_ended_request(&req_rc) {
                c.ended_requests.push(req_rc.clone());
            }
        }

        let feed_failed = {
            let mut c = client_rc.borrow_mut();
            if !c.output.ended() {
                c.output.feed(Mbuf::empty()).is_err()
            } else {
                false
            }
        };
        if feed_failed {
            self.do_disconnect(id);
            return;
        }
        self.core.flush_output(id);
        let acked = match self.core.client_rc(id) {
            Some(rc) => rc.borrow().output.end_acked(),
            None => return,
        };
        if acked {
            self.done_with_current_request(id);
        } else {
            req_rc.borrow_mut().http_state = HttpState::FlushingOutput;
        }
    }

    /// The output channel's data-flushed edge: advance a request parked
    /// in FLUSHING_OUTPUT.
    fn output_flushed(&mut self, id: ClientId) {
        let req_rc = match self.core.current_request_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let flushing = {
            req_rc.borrow().http_state == HttpState::FlushingOutput
        };
        if flushing {
            req_rc.borrow_mut().http_state = HttpState::WaitingForReferences;
            self.done_with_current_request(id);
        }
    }

    fn done_with_current_request(&mut self, id: ClientId) {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        let req_ref = { client_rc.borrow_mut().current_request.take() };
        let req_ref = match req_ref {
            Some(r) => r,
            None => return,
        };
        let req_rc = req_ref.request().clone();
        let keep_alive = {
            let mut req = req_rc.borrow_mut();
            assert_eq!(req.http_state, HttpState::WaitingForReferences);
            let keep_alive = req.can_keep_alive();
            req.pool = None;
            keep_alive
        };
        drop(req_ref);
        if keep_alive {
            // the zero-refcount action, if the drop above queued one, must
            // finalize first so the freelist entry is reusable right away
            self.core.enqueue(Action::HandleNextRequest(id));
        } else {
            self.do_disconnect(id);
        }
    }

    fn do_disconnect(&mut self, id: ClientId) {
        let client_rc = match self.core.client_rc(id) {
            Some(rc) => rc,
            None => return,
        };
        {
            let c = client_rc.borrow();
            if c.state == ClientState::Disconnected {
                return;
            }
        }
        client_rc.borrow_mut().state = ClientState::Disconnected;
        debug!("[Client {}] disconnecting", id.number);
        self.handler.on_client_disconnecting(&mut self.core, id);

        let req_ref = { client_rc.borrow_mut().current_request.take() };
        if let Some(req_ref) = req_ref {
            let req_rc = req_ref.request().clone();
            let was_ended = { req_rc.borrow().ended() };
            if !was_ended {
                {
                    let mut req = req_rc.borrow_mut();
                    let parser_state = req.deinitialize();
                    if let Some(state) = parser_state {
                        self.core.parser_pool.destroy(state);
                    }
                }
                self.handler.deinitialize_request(&mut self.core, id,
                    &req_ref);
            } else {
                let mut req = req_rc.borrow_mut();
                req.http_state = HttpState::WaitingForReferences;
                req.pool = None;
            }
            {
                let mut c = client_rc.borrow_mut();
                if !c.has_ended_request(&req_rc) {
                    c.ended_requests.push(req_rc.clone());
                }
            }
            drop(req_ref);
        }

        {
            let mut c = client_rc.borrow_mut();
            let Client { ref mut socket, ref mut output, .. } = *c;
            let _ = output.flush(socket);
            let _ = self.core.ctx.reactor.deregister(socket);
        }
        self.core.maybe_destroy_client(id);
    }
}
