//! Response head rendering for `write_simple_response` and the canned
//! error pages.

use std::io::Write;

use http::StatusCode;
use time::macros::format_description;
use time::OffsetDateTime;

use server::request::Request;

/// Body of the canned response emitted when a handler ends a request
/// without having written anything.
pub const DEFAULT_INTERNAL_SERVER_ERROR_RESPONSE: &'static str =
    "<html><body><h1>500 Internal Server Error</h1>\n\
     The server encountered an internal error and was unable to complete \
     your request.</body></html>\n";

/// `"200 OK"`-style status string; unknown codes get the generic phrase.
pub fn get_status_code_and_reason_phrase(code: u16) -> String {
    match StatusCode::from_u16(code).ok().and_then(|s| s.canonical_reason()) {
        Some(reason) => format!("{} {}", code, reason),
        None => format!("{} Unknown Reason-Phrase", code),
    }
}

fn http_date() -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] \
         [hour]:[minute]:[second] +0000");
    OffsetDateTime::now_utc().format(&format)
        .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 +0000"))
}

fn find<'a>(headers: &'a [(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers.iter()
        .find(|&&(key, _)| key.eq_ignore_ascii_case(name))
        .map(|&(_, val)| val)
}

/// Render the head of a simple response: status line, a `Status:` echo of
/// it, the four canonical headers (caller values win over the defaults),
/// then the remaining caller headers verbatim.
///
/// A caller-supplied `Connection` value other than keep-alive turns the
/// request's keep-alive wish off. The body itself is written by the
/// caller, which also owns the HEAD suppression rule.
pub fn render_simple_response(req: &mut Request, code: u16,
    headers: &[(&str, &str)], body_len: usize) -> Vec<u8>
{
    let status = get_status_code_and_reason_phrase(code);
    let mut head = Vec::with_capacity(300);

    write!(head, "HTTP/{}.{} {}\r\nStatus: {}\r\n",
        req.http_major, req.http_minor, status, status).unwrap();

    match find(headers, "content-type") {
        Some(value) => write!(head, "Content-Type: {}\r\n", value).unwrap(),
        None => head.extend_from_slice(
            b"Content-Type: text/html; charset=UTF-8\r\n"),
    }

    match find(headers, "date") {
        Some(value) => write!(head, "Date: {}\r\n", value).unwrap(),
        None => write!(head, "Date: {}\r\n", http_date()).unwrap(),
    }

    match find(headers, "connection") {
        Some(value) => {
            write!(head, "Connection: {}\r\n", value).unwrap();
            if value != "Keep-Alive" && value != "keep-alive" {
                req.want_keep_alive = false;
            }
        }
        None => {
            if req.can_keep_alive() {
                head.extend_from_slice(b"Connection: keep-alive\r\n");
            } else {
                head.extend_from_slice(b"Connection: close\r\n");
            }
        }
    }

    match find(headers, "content-length") {
        Some(value) => write!(head, "Content-Length: {}\r\n", value).unwrap(),
        None => write!(head, "Content-Length: {}\r\n", body_len).unwrap(),
    }

    for &(key, val) in headers {
        if key.eq_ignore_ascii_case("content-type")
            || key.eq_ignore_ascii_case("date")
            || key.eq_ignore_ascii_case("connection")
            || key.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        write!(head, "{}: {}\r\n", key, val).unwrap();
    }

    head.extend_from_slice(b"\r\n");
    head
}
