//! Incremental request-head parser.
//!
//! Bytes are accumulated until the `\r\n\r\n` terminator shows up (which
//! may arrive split across feeds), then the whole block is handed to
//! httparse and the results are copied into the request's pool. The
//! working state is recycled through a small object pool so steady-state
//! parsing does not allocate.

use std::cmp::min;
use std::fmt;
use std::mem;
use std::str::from_utf8;

use http::Method;
use httparse;
use netbuf::Buf;

use headers::{self, SECURE_HEADER_PREFIX};
use server::error::ParseError;
use server::request::{BodyInfo, BodyType, HttpState, ParserState, Request};
use server::{MAX_HEADERS_NUM, MAX_HEADERS_SIZE};

/// Accumulation state for one request head.
pub struct HeaderParserState {
    buf: Buf,
    /// Bytes already scanned for the terminator; rescanning starts three
    /// bytes earlier so a split `\r\n\r\n` is still found.
    searched: usize,
}

impl HeaderParserState {
    pub fn new() -> HeaderParserState {
        HeaderParserState { buf: Buf::new(), searched: 0 }
    }

    fn reset(&mut self) {
        let len = self.buf.len();
        self.buf.consume(len);
        self.searched = 0;
    }
}

impl fmt::Debug for HeaderParserState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HeaderParserState({} bytes buffered)", self.buf.len())
    }
}

/// Object pool of parser states, amortizing their buffer allocations.
pub struct HeaderParserStatePool {
    free: Vec<HeaderParserState>,
    limit: usize,
}

impl HeaderParserStatePool {
    pub fn new(limit: usize) -> HeaderParserStatePool {
        HeaderParserStatePool { free: Vec::new(), limit: limit }
    }

    pub fn construct(&mut self) -> HeaderParserState {
        match self.free.pop() {
            Some(mut state) => {
                state.reset();
                state
            }
            None => HeaderParserState::new(),
        }
    }

    pub fn destroy(&mut self, state: HeaderParserState) {
        if self.free.len() < self.limit {
            self.free.push(state);
        }
    }
}

/// Feed bytes into the request's header parser. Returns how many bytes
/// were consumed. On completion (or error) the request leaves the
/// `ParsingHeaders` state and the parser state goes back to the pool.
pub fn feed(pool: &mut HeaderParserStatePool, req: &mut Request, data: &[u8])
    -> usize
{
    assert_eq!(req.http_state, HttpState::ParsingHeaders);
    let mut state = match mem::replace(&mut req.parser_state, ParserState::None) {
        ParserState::Headers(state) => state,
        _ => panic!("header parser fed without its state"),
    };

    let old_len = state.buf.len();
    let space = MAX_HEADERS_SIZE.saturating_sub(old_len);
    let take = min(space, data.len());
    state.buf.extend(&data[..take]);

    let found = state.buf[state.searched..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|rel| state.searched + rel);

    match found {
        None => {
            if state.buf.len() >= MAX_HEADERS_SIZE {
                set_error(req, ParseError::HeadersTooLarge);
                pool.destroy(state);
            } else {
                state.searched = state.buf.len().saturating_sub(3);
                req.parser_state = ParserState::Headers(state);
            }
            take
        }
        Some(pos) => {
            let end = pos + 4;
            let consumed = end - old_len;
            let len = state.buf.len();
            if len > end {
                state.buf.remove_range(end..len);
            }
            parse_block(req, &state.buf[..]);
            pool.destroy(state);
            consumed
        }
    }
}

fn set_error(req: &mut Request, err: ParseError) {
    req.http_state = HttpState::Error;
    req.parse_error = Some(err);
}

enum FramingBody {
    NoBody,
    Fixed(u64),
    Chunked,
    Upgrade,
}

struct Framing {
    body: FramingBody,
    close: bool,
    keep_alive_token: bool,
}

/// Implements the body length algorithm for requests:
/// http://httpwg.github.io/specs/rfc7230.html#message.body.length
///
/// The length of a request body is determined by one of the following
/// (in order of precedence):
///
/// 1. A valid `Transfer-Encoding` header with `chunked` as the last
///    encoding makes the request chunked.
/// 2. A valid `Content-Length` header gives the length in octets.
/// 3. A `Connection: upgrade` token hands the stream to the upgraded
///    protocol.
/// 4. Otherwise the request has no body.
///
/// Mixing these framings in one request is an error.
fn scan_headers(raw: &[httparse::Header]) -> Result<Framing, ParseError> {
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut close = false;
    let mut keep_alive_token = false;
    let mut upgrade = false;

    for header in raw {
        if headers::is_transfer_encoding(header.name) {
            if let Some(enc) = header.value.split(|&x| x == b',').last() {
                if headers::is_chunked(enc) {
                    chunked = true;
                }
            }
        } else if headers::is_content_length(header.name) {
            if content_length.is_some() {
                return Err(ParseError::DuplicateContentLength);
            }
            let text = from_utf8(header.value).unwrap_or("");
            let len = text.trim().parse()
                .map_err(ParseError::BadContentLength)?;
            content_length = Some(len);
        } else if headers::is_connection(header.name) {
            for token in header.value.split(|&x| x == b',') {
                if headers::is_close(token) {
                    close = true;
                } else if headers::is_keep_alive(token) {
                    keep_alive_token = true;
                } else if headers::is_upgrade(token) {
                    upgrade = true;
                }
            }
        }
    }

    if chunked && content_length.is_some() {
        return Err(ParseError::InconsistentFraming);
    }
    if upgrade && (chunked || content_length.is_some()) {
        return Err(ParseError::InconsistentFraming);
    }

    let body = if chunked {
        FramingBody::Chunked
    } else if let Some(len) = content_length {
        FramingBody::Fixed(len)
    } else if upgrade {
        FramingBody::Upgrade
    } else {
        FramingBody::NoBody
    };
    Ok(Framing {
        body: body,
        close: close,
        keep_alive_token: keep_alive_token,
    })
}

fn parse_block(req: &mut Request, block: &[u8]) {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
    let mut raw = httparse::Request::new(&mut storage);
    match raw.parse(block) {
        Ok(httparse::Status::Complete(parsed)) => debug_assert_eq!(parsed, block.len()),
        Ok(httparse::Status::Partial) => unreachable!(),
        Err(httparse::Error::Version) => {
            return set_error(req, ParseError::VersionNotSupported);
        }
        Err(e) => return set_error(req, ParseError::BadHeaders(e)),
    }

    let minor = raw.version.expect("complete parse has a version");
    let method = match Method::from_bytes(
        raw.method.expect("complete parse has a method").as_bytes())
    {
        Ok(method) => method,
        Err(_) => return set_error(req, ParseError::BadMethod),
    };
    let framing = match scan_headers(raw.headers) {
        Ok(framing) => framing,
        Err(e) => return set_error(req, e),
    };

    req.http_major = 1;
    req.http_minor = minor;
    req.method = method;

    let mut pool = req.pool.take().expect("request pool");
    req.path = pool.append(raw.path.expect("complete parse has a path").as_bytes());
    for header in raw.headers.iter() {
        let key = pool.append(header.name.as_bytes());
        let val = pool.append(header.value);
        if header.name.starts_with(SECURE_HEADER_PREFIX) {
            req.secure_headers.insert(key, val);
        } else {
            req.headers.insert(key, val);
        }
    }
    req.pool = Some(pool);

    match framing.body {
        FramingBody::NoBody => {
            req.body_type = BodyType::NoBody;
            req.body_info = BodyInfo::None;
            req.http_state = HttpState::Complete;
        }
        FramingBody::Fixed(len) => {
            req.body_type = BodyType::ContentLength;
            req.body_info = BodyInfo::ContentLength(len);
            req.http_state = HttpState::ParsingBody;
        }
        FramingBody::Chunked => {
            req.body_type = BodyType::Chunked;
            req.body_info = BodyInfo::Chunked { end_chunk_reached: false };
            req.http_state = HttpState::ParsingChunkedBody;
        }
        FramingBody::Upgrade => {
            req.body_type = BodyType::Upgrade;
            req.body_info = BodyInfo::None;
            req.http_state = HttpState::Upgraded;
        }
    }

    req.want_keep_alive = if minor == 1 {
        !framing.close
    } else {
        framing.keep_alive_token && !framing.close
    };
}
