//! Incremental decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! Fed wire bytes, it pushes the decoded payload into the request's body
//! channel as cheap sub-slices and reports when the terminating
//! `0\r\n\r\n` was seen. Trailer lines after the last chunk are consumed
//! and dropped. Bytes following the terminator are left unconsumed; on a
//! keep-alive connection they belong to the next request.

use std::io;

use httparse;

use channel::{ChannelError, FileBufferedChannel};
use mbuf::Mbuf;
use server::MAX_CHUNK_HEAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading a chunk-size line (possibly with extensions).
    Size,
    /// Inside chunk data; bytes left in this chunk.
    Data(u64),
    /// Reading the CRLF that closes a chunk; bytes of it left.
    DataCrlf(u8),
    /// After the zero chunk: skipping trailer lines until the empty one.
    Trailer,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// More wire bytes needed.
    Progress,
    /// The end chunk was reached; the EOF mbuf has been fed downstream.
    End,
    /// Framing was malformed; the error has been fed downstream.
    Error,
}

#[derive(Debug)]
pub struct ChunkFeedResult {
    pub consumed: usize,
    pub status: ChunkStatus,
}

#[derive(Debug)]
pub struct ChunkedBodyParser {
    state: State,
    line: Vec<u8>,
}

impl ChunkedBodyParser {
    pub fn new() -> ChunkedBodyParser {
        ChunkedBodyParser { state: State::Size, line: Vec::new() }
    }

    /// Decode as much of `buf` as possible into `out`.
    pub fn feed(&mut self, out: &mut FileBufferedChannel, buf: &Mbuf)
        -> io::Result<ChunkFeedResult>
    {
        let mut pos = 0;
        while pos < buf.len() {
            match self.state {
                State::Size => {
                    match self.take_line(buf, &mut pos) {
                        LineStep::NeedMore => {}
                        LineStep::Overflow => return self.fail(out, pos),
                        LineStep::Line => {
                            match httparse::parse_chunk_size(&self.line) {
                                Ok(httparse::Status::Complete((_, 0))) => {
                                    self.line.clear();
                                    self.state = State::Trailer;
                                }
                                Ok(httparse::Status::Complete((_, size))) => {
                                    self.line.clear();
                                    self.state = State::Data(size);
                                }
                                Ok(httparse::Status::Partial) | Err(_) => {
                                    return self.fail(out, pos);
                                }
                            }
                        }
                    }
                }
                State::Data(left) => {
                    let take = ::std::cmp::min(left,
                        (buf.len() - pos) as u64) as usize;
                    out.feed(buf.slice(pos..pos + take))?;
                    pos += take;
                    if left == take as u64 {
                        self.state = State::DataCrlf(2);
                    } else {
                        self.state = State::Data(left - take as u64);
                    }
                }
                State::DataCrlf(left) => {
                    let byte = buf[pos];
                    pos += 1;
                    match (left, byte) {
                        (2, b'\r') => self.state = State::DataCrlf(1),
                        (1, b'\n') => self.state = State::Size,
                        _ => return self.fail(out, pos),
                    }
                }
                State::Trailer => {
                    match self.take_line(buf, &mut pos) {
                        LineStep::NeedMore => {}
                        LineStep::Overflow => return self.fail(out, pos),
                        LineStep::Line => {
                            let blank = self.line == b"\r\n"
                                || self.line == b"\n";
                            self.line.clear();
                            if blank {
                                self.state = State::Done;
                                out.feed(Mbuf::empty())?;
                                return Ok(ChunkFeedResult {
                                    consumed: pos,
                                    status: ChunkStatus::End,
                                });
                            }
                        }
                    }
                }
                State::Done | State::Failed => break,
            }
        }
        let status = match self.state {
            State::Done => ChunkStatus::End,
            State::Failed => ChunkStatus::Error,
            _ => ChunkStatus::Progress,
        };
        Ok(ChunkFeedResult { consumed: pos, status: status })
    }

    /// The connection ended before the end chunk.
    pub fn feed_unexpected_eof(&mut self, out: &mut FileBufferedChannel) {
        if self.state != State::Done && self.state != State::Failed {
            self.state = State::Failed;
            out.feed_error(ChannelError::UnexpectedEof);
        }
    }

    /// An I/O error interrupted the stream.
    pub fn feed_io_error(&mut self, out: &mut FileBufferedChannel, errno: i32) {
        if self.state != State::Done && self.state != State::Failed {
            self.state = State::Failed;
            out.feed_error(ChannelError::Io(errno));
        }
    }

    pub fn reached_end(&self) -> bool {
        self.state == State::Done
    }

    fn take_line(&mut self, buf: &Mbuf, pos: &mut usize) -> LineStep {
        while *pos < buf.len() {
            let byte = buf[*pos];
            *pos += 1;
            self.line.push(byte);
            if byte == b'\n' {
                return LineStep::Line;
            }
            if self.line.len() > MAX_CHUNK_HEAD {
                return LineStep::Overflow;
            }
        }
        LineStep::NeedMore
    }

    fn fail(&mut self, out: &mut FileBufferedChannel, consumed: usize)
        -> io::Result<ChunkFeedResult>
    {
        self.state = State::Failed;
        out.feed_error(ChannelError::Protocol);
        Ok(ChunkFeedResult { consumed: consumed, status: ChunkStatus::Error })
    }
}

enum LineStep {
    Line,
    NeedMore,
    Overflow,
}
