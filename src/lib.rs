//! An embeddable event-loop HTTP/1.x connection server core.
//!
//! One thread runs a mio poll loop; every accepted connection is driven
//! through a per-request state machine: incremental header parsing,
//! content-length / chunked / upgraded body streaming through
//! backpressure-aware channels that spill to disk, response writing, and
//! recycling of request objects through a bounded freelist under
//! reference-counted lifetimes.
//!
//! Embedders implement [`server::protocol::Handler`] and plug it into
//! [`server::HttpServer`]. Everything runs on the loop thread; work that
//! must survive on another thread carries a detached request reference
//! whose release bounces back through the reactor.

extern crate http;
extern crate httparse;
extern crate mio;
extern crate netbuf;
extern crate slab;
extern crate tempfile;
extern crate time;
#[macro_use] extern crate log;
#[macro_use] extern crate quick_error;
#[macro_use] extern crate serde_json;

pub mod channel;
pub mod headers;
pub mod mbuf;
pub mod pool;
pub mod reactor;
pub mod server;

pub use channel::{ChannelError, Consumed};
pub use mbuf::Mbuf;
pub use server::protocol::Handler;
pub use server::request::{BodyType, HttpState, Request, RequestRef};
pub use server::{ClientId, Context, HttpServer, ServerCore, StopHandle};
