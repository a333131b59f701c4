extern crate stoker_http;

use std::env;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stoker_http::server::protocol::Handler;
use stoker_http::server::request::{BodyInfo, HttpState, RequestRef};
use stoker_http::server::{ClientId, Context, HttpServer, ServerCore, StopHandle};
use stoker_http::{ChannelError, Consumed};

#[derive(Default)]
struct Trace {
    body: Vec<u8>,
    eof: bool,
    error: Option<ChannelError>,
    body_already_read: u64,
    end_chunk_reached: bool,
    requests_begun: usize,
    total_requests_accepted: u64,
}

type SharedTrace = Arc<Mutex<Trace>>;

struct TestHandler {
    trace: SharedTrace,
}

impl Handler for TestHandler {
    fn on_request_begin(&mut self, core: &mut ServerCore, client: ClientId,
        req: &RequestRef)
    {
        {
            let mut trace = self.trace.lock().unwrap();
            trace.requests_begun += 1;
            trace.total_requests_accepted = core.total_requests_accepted();
        }
        let state = req.request().borrow().http_state;
        if state == HttpState::Complete {
            core.write_simple_response(client, 200, &[], b"ok");
            core.end_request(client);
        }
    }

    fn on_request_body(&mut self, core: &mut ServerCore, client: ClientId,
        req: &RequestRef, buf: &stoker_http::Mbuf,
        errcode: Option<ChannelError>) -> Consumed
    {
        if let Some(err) = errcode {
            let mut trace = self.trace.lock().unwrap();
            trace.error = Some(err);
            trace.body_already_read = req.request().borrow().body_already_read;
            core.disconnect(client);
            return Consumed::new(0, false);
        }
        if buf.is_empty() {
            {
                let mut trace = self.trace.lock().unwrap();
                trace.eof = true;
                let r = req.request().borrow();
                trace.body_already_read = r.body_already_read;
                if let BodyInfo::Chunked { end_chunk_reached } = r.body_info {
                    trace.end_chunk_reached = end_chunk_reached;
                }
            }
            core.write_simple_response(client, 200, &[], b"got it");
            core.end_request(client);
            return Consumed::new(0, true);
        }
        self.trace.lock().unwrap().body.extend_from_slice(buf);
        Consumed::new(buf.len(), false)
    }
}

fn start_server(trace: SharedTrace)
    -> (SocketAddr, StopHandle, thread::JoinHandle<()>)
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let ctx = Context::new(env::temp_dir()).unwrap();
        let mut server = HttpServer::new(ctx, TestHandler { trace: trace });
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let stop = server.core().stop_handle();
        tx.send((addr, stop)).unwrap();
        server.run().unwrap();
    });
    let (addr, stop) = rx.recv().unwrap();
    (addr, stop, handle)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock
}

/// Read one response: head up to the blank line, then exactly
/// Content-Length body bytes. Usable on keep-alive connections.
fn read_response(sock: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        let n = sock.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed mid-head: {:?}",
            String::from_utf8_lossy(&data));
        data.push(byte[0]);
    }
    let head = String::from_utf8(data).unwrap();
    let content_length = head.lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.splitn(2, ':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    sock.read_exact(&mut body).unwrap();
    (head, body)
}

fn wait_for<F: Fn(&Trace) -> bool>(trace: &SharedTrace, pred: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if pred(&trace.lock().unwrap()) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting on trace");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn minimal_get_keep_alive() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut sock);
    let lines: Vec<&str> = head.split("\r\n").collect();
    assert_eq!(lines[0], "HTTP/1.1 200 OK");
    assert_eq!(lines[1], "Status: 200 OK");
    assert_eq!(lines[2], "Content-Type: text/html; charset=UTF-8");
    assert!(lines[3].starts_with("Date: "));
    assert_eq!(lines[4], "Connection: keep-alive");
    assert_eq!(lines[5], "Content-Length: 2");
    assert_eq!(body, b"ok");
    wait_for(&trace, |t| t.total_requests_accepted == 1);

    // the connection stays open and serves a second request, exercising
    // the freelist recycle path
    sock.write_all(b"GET /b HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut sock);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"ok");
    wait_for(&trace, |t| t.total_requests_accepted == 2);

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn content_length_body() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let (head, body) = read_response(&mut sock);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"got it");
    wait_for(&trace, |t| t.eof);
    {
        let t = trace.lock().unwrap();
        assert_eq!(t.body, b"hello");
        assert_eq!(t.body_already_read, 5);
    }

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn content_length_body_split_writes() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"POST /x HTTP/1.1\r\nHost: h\r\nCont").unwrap();
    sock.flush().unwrap();
    thread::sleep(Duration::from_millis(30));
    sock.write_all(b"ent-Length: 5\r\n\r\nhel").unwrap();
    sock.flush().unwrap();
    thread::sleep(Duration::from_millis(30));
    sock.write_all(b"lo").unwrap();

    let (_, body) = read_response(&mut sock);
    assert_eq!(body, b"got it");
    wait_for(&trace, |t| t.eof);
    assert_eq!(trace.lock().unwrap().body, b"hello");

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn zero_length_body() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"POST /empty HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut sock);
    assert_eq!(body, b"got it");
    wait_for(&trace, |t| t.eof);
    {
        let t = trace.lock().unwrap();
        assert!(t.body.is_empty());
        assert_eq!(t.body_already_read, 0);
    }

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn chunked_body() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
                     3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n").unwrap();
    let (_, body) = read_response(&mut sock);
    assert_eq!(body, b"got it");
    wait_for(&trace, |t| t.eof);
    {
        let t = trace.lock().unwrap();
        assert_eq!(t.body, b"abcde");
        assert!(t.end_chunk_reached);
    }

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn unsupported_version_gets_505() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"GET / HTTP/3.0\r\nHost: h\r\n\r\n").unwrap();
    let mut data = Vec::new();
    sock.read_to_end(&mut data).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.0 505 HTTP Version Not Supported\r\n"),
        "unexpected response: {}", text);
    assert!(text.contains("\r\nConnection: close\r\n"));
    assert!(text.ends_with("HTTP version not supported\n"));

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn upgrade_refused_by_default() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: upgrade\r\n\
                     Upgrade: websocket\r\n\r\n").unwrap();
    let mut data = Vec::new();
    sock.read_to_end(&mut data).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "unexpected response: {}", text);
    assert!(text.contains("\r\nConnection: close\r\n"));
    assert!(text.ends_with(
        "Bad request (connection upgrading not allowed for this request)"));
    // the handler never saw the request
    assert_eq!(trace.lock().unwrap().requests_begun, 0);

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn truncated_content_length_reports_unexpected_eof() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\nabc")
        .unwrap();
    sock.shutdown(Shutdown::Write).unwrap();
    wait_for(&trace, |t| t.error.is_some());
    {
        let t = trace.lock().unwrap();
        assert_eq!(t.body, b"abc");
        assert_eq!(t.error, Some(ChannelError::UnexpectedEof));
        assert!(!t.eof);
    }
    // no response; the connection just closes
    let mut data = Vec::new();
    sock.read_to_end(&mut data).unwrap();
    assert!(data.is_empty());

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn head_suppresses_body_but_not_content_length() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"HEAD /x HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut data = Vec::new();
    sock.read_to_end(&mut data).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("\r\nContent-Length: 2\r\n"));
    // head only, no body bytes after the terminator
    assert!(text.ends_with("\r\n\r\n"));

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn bad_request_line_gets_400() {
    let trace: SharedTrace = Default::default();
    let (addr, stop, handle) = start_server(trace.clone());
    let mut sock = connect(addr);

    sock.write_all(b"G\x01T / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let mut data = Vec::new();
    sock.read_to_end(&mut data).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.0 400 Bad Request\r\n"),
        "unexpected response: {}", text);
    assert!(text.contains("\r\nConnection: close\r\n"));

    stop.stop();
    handle.join().unwrap();
}
