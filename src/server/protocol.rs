use channel::{ChannelError, Consumed};
use mbuf::Mbuf;
use server::request::RequestRef;
use server::{ClientId, ServerCore};

/// The application side of the server.
///
/// Every hook runs on the event-loop thread. The `core` argument is the
/// server surface a handler may call back into (`write_response`,
/// `write_simple_response`, `end_request`, `disconnect`, ...); heavier
/// transitions it triggers are deferred onto the loop's action queue and
/// run after the hook returns.
///
/// A handler that wants a request to outlive the hook must keep a clone
/// of its `RequestRef` (or a detached reference, for other threads) and
/// call back into the server to write and end it.
pub trait Handler: Sized {
    /// A client object came into existence (once per connection).
    fn on_client_object_created(&mut self, _core: &mut ServerCore,
        _client: ClientId) {}

    /// The connection is accepted and about to serve its first request.
    fn on_client_accepted(&mut self, _core: &mut ServerCore,
        _client: ClientId) {}

    /// The connection is going away; runs before the current request is
    /// torn down.
    fn on_client_disconnecting(&mut self, _core: &mut ServerCore,
        _client: ClientId) {}

    /// A request object was freshly allocated (not freelist reuse).
    fn on_request_object_created(&mut self, _core: &mut ServerCore,
        _client: ClientId, _req: &RequestRef) {}

    /// Headers are parsed; the handler takes over. For bodyless requests
    /// the handler is expected to eventually call `end_request`.
    fn on_request_begin(&mut self, _core: &mut ServerCore,
        _client: ClientId, _req: &RequestRef) {}

    /// A chunk of request body, its EOF (empty chunk, no error), or an
    /// error. The return value acknowledges how much was consumed; an
    /// unconsumed remainder pauses delivery until
    /// `resume_request_body` is called.
    fn on_request_body(&mut self, core: &mut ServerCore, client: ClientId,
        _req: &RequestRef, buf: &Mbuf, errcode: Option<ChannelError>)
        -> Consumed
    {
        if errcode.is_some() || buf.is_empty() {
            core.disconnect(client);
        }
        Consumed::new(buf.len(), false)
    }

    /// Whether `Connection: upgrade` is honored for this request.
    fn supports_upgrade(&mut self, _core: &mut ServerCore,
        _client: ClientId, _req: &RequestRef) -> bool
    {
        false
    }

    /// Extension point next to the request's own reinitialization.
    fn reinitialize_request(&mut self, _core: &mut ServerCore,
        _client: ClientId, _req: &RequestRef) {}

    /// Extension point next to the request's own teardown. Must be
    /// idempotent: the disconnect path may run it after `end_request`
    /// already has.
    fn deinitialize_request(&mut self, _core: &mut ServerCore,
        _client: ClientId, _req: &RequestRef) {}
}

/// Handler that answers nothing and lets the default hooks drive.
pub struct DefaultHandler;

impl Handler for DefaultHandler {}
