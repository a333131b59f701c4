use std::path::Path;
use std::rc::Rc;

use mio::net::TcpStream;

use channel::{FdOutputChannel, InputChannel};
use server::request::RequestRef;
use server::RequestRc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Active,
    Disconnected,
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match *self {
            ClientState::Active => "ACTIVE",
            ClientState::Disconnected => "DISCONNECTED",
        }
    }
}

/// One accepted connection.
///
/// Owned by the server; destroyed once it is disconnected and no ended
/// request of it is referenced any more. At most one request is current;
/// requests whose body semantics concluded but whose references have not
/// drained sit on `ended_requests`.
pub struct Client {
    pub number: u64,
    pub socket: TcpStream,
    pub state: ClientState,
    pub input: InputChannel,
    pub output: FdOutputChannel,
    pub current_request: Option<RequestRef>,
    pub ended_requests: Vec<RequestRc>,
}

impl Client {
    pub fn new(number: u64, socket: TcpStream, buffer_threshold: usize,
        spill_dir: &Path) -> Client
    {
        Client {
            number: number,
            socket: socket,
            state: ClientState::Active,
            input: InputChannel::new(),
            output: FdOutputChannel::new(buffer_threshold, spill_dir),
            current_request: None,
            ended_requests: Vec::new(),
        }
    }

    pub fn ended_request_count(&self) -> usize {
        self.ended_requests.len()
    }

    /// Drop `req` from the ended list. Returns whether it was there.
    pub fn remove_ended(&mut self, req: &RequestRc) -> bool {
        match self.ended_requests.iter().position(|r| Rc::ptr_eq(r, req)) {
            Some(idx) => {
                self.ended_requests.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn has_ended_request(&self, req: &RequestRc) -> bool {
        self.ended_requests.iter().any(|r| Rc::ptr_eq(r, req))
    }
}
