//! Backpressure-aware conduits of `Mbuf` chunks.
//!
//! A channel is fed by a producer and drained by a consumer that
//! acknowledges what it took. The file-buffered variant spills to an
//! anonymous temp file once the amount of unacknowledged data passes a
//! threshold, so a slow consumer never forces unbounded memory growth.
//!
//! Delivery is pull-based: the owner fetches the next deliverable chunk,
//! hands it to the consumer, and pushes any unconsumed remainder back with
//! `unfetch()`. Level-style callbacks of the original design become edge
//! accessors (`take_buffers_flushed_edge`, `take_data_flushed_edge`) that
//! the owner polls after touching the channel.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile;

use mbuf::Mbuf;

/// How much of a spilled buffer is loaded back into memory per fetch.
const SPILL_READ_CHUNK: usize = 16 * 1024;

/// Consumer acknowledgement: how many bytes of the delivered chunk were
/// taken, and whether the end-of-stream was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub bytes: usize,
    pub end: bool,
}

impl Consumed {
    pub fn new(bytes: usize, end: bool) -> Consumed {
        Consumed { bytes: bytes, end: end }
    }
}

/// Error fed into a channel in place of further data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The stream ended before its framing said it would.
    UnexpectedEof,
    /// The stream's framing itself was malformed (bad chunk header).
    Protocol,
    /// Raw OS error from the source descriptor.
    Io(i32),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ChannelError::UnexpectedEof => write!(f, "unexpected end of stream"),
            ChannelError::Protocol => write!(f, "malformed stream framing"),
            ChannelError::Io(errno) => write!(f, "I/O error (errno {})", errno),
        }
    }
}

/// What the channel has to deliver next.
#[derive(Debug)]
pub enum Fetch {
    Data(Mbuf),
    End,
    Error(ChannelError),
    Idle,
}

#[derive(Debug)]
struct Spill {
    file: File,
    read_pos: u64,
    write_pos: u64,
}

impl Spill {
    fn pending(&self) -> u64 {
        self.write_pos - self.read_pos
    }
}

/// Single-producer single-consumer conduit with disk spillover.
#[derive(Debug)]
pub struct FileBufferedChannel {
    mem: VecDeque<Mbuf>,
    mem_bytes: usize,
    spill: Option<Spill>,
    threshold: usize,
    spill_dir: PathBuf,
    ended: bool,
    end_delivered: bool,
    end_acked: bool,
    error: Option<ChannelError>,
    error_delivered: bool,
    over_threshold: bool,
    buffers_flushed_edge: bool,
    data_flushed_edge: bool,
}

impl FileBufferedChannel {
    pub fn new(threshold: usize, spill_dir: &Path) -> FileBufferedChannel {
        FileBufferedChannel {
            mem: VecDeque::new(),
            mem_bytes: 0,
            spill: None,
            threshold: threshold,
            spill_dir: spill_dir.to_path_buf(),
            ended: false,
            end_delivered: false,
            end_acked: false,
            error: None,
            error_delivered: false,
            over_threshold: false,
            buffers_flushed_edge: false,
            data_flushed_edge: false,
        }
    }

    /// Prepare the channel for a new stream. Any leftover state from the
    /// previous stream is discarded.
    pub fn reinitialize(&mut self) {
        self.deinitialize();
    }

    pub fn deinitialize(&mut self) {
        self.mem.clear();
        self.mem_bytes = 0;
        self.spill = None; // closing the handle deletes the unlinked file
        self.ended = false;
        self.end_delivered = false;
        self.end_acked = false;
        self.error = None;
        self.error_delivered = false;
        self.over_threshold = false;
        self.buffers_flushed_edge = false;
        self.data_flushed_edge = false;
    }

    /// Feed a chunk. The empty mbuf marks end-of-stream.
    pub fn feed(&mut self, buf: Mbuf) -> io::Result<()> {
        assert!(!self.ended, "fed a channel that already ended");
        if buf.is_empty() {
            self.ended = true;
            return Ok(());
        }
        if self.spill.is_some() {
            self.spill_write(&buf)?;
        } else if self.mem_bytes + buf.len() > self.threshold {
            let file = tempfile::tempfile_in(&self.spill_dir)?;
            self.spill = Some(Spill { file: file, read_pos: 0, write_pos: 0 });
            self.spill_write(&buf)?;
        } else {
            self.mem_bytes += buf.len();
            self.mem.push_back(buf);
        }
        if self.buffered() > self.threshold {
            self.over_threshold = true;
        }
        Ok(())
    }

    /// Feed an error instead of data. Delivered to the consumer after
    /// everything fed before it; no more data may follow.
    pub fn feed_error(&mut self, err: ChannelError) {
        assert!(!self.ended, "fed an error into a channel that already ended");
        self.ended = true;
        self.error = Some(err);
    }

    fn spill_write(&mut self, buf: &[u8]) -> io::Result<()> {
        let spill = self.spill.as_mut().expect("spill file present");
        spill.file.seek(SeekFrom::Start(spill.write_pos))?;
        spill.file.write_all(buf)?;
        spill.write_pos += buf.len() as u64;
        Ok(())
    }

    /// Next deliverable item. Memory drains before disk; errors and the
    /// end-of-stream are delivered once, after all data.
    pub fn fetch(&mut self) -> io::Result<Fetch> {
        if let Some(buf) = self.mem.pop_front() {
            self.mem_bytes -= buf.len();
            self.note_drain();
            return Ok(Fetch::Data(buf));
        }
        let drained = match self.spill {
            Some(ref mut spill) if spill.pending() > 0 => {
                let want = ::std::cmp::min(spill.pending(), SPILL_READ_CHUNK as u64);
                let mut data = vec![0u8; want as usize];
                spill.file.seek(SeekFrom::Start(spill.read_pos))?;
                spill.file.read_exact(&mut data)?;
                spill.read_pos += want;
                Some((Mbuf::from_vec(data), spill.pending() == 0))
            }
            _ => None,
        };
        if let Some((buf, exhausted)) = drained {
            if exhausted {
                self.spill = None;
            }
            self.note_drain();
            return Ok(Fetch::Data(buf));
        }
        if let Some(err) = self.error {
            if !self.error_delivered {
                self.error_delivered = true;
                return Ok(Fetch::Error(err));
            }
            return Ok(Fetch::Idle);
        }
        if self.ended && !self.end_delivered {
            self.end_delivered = true;
            return Ok(Fetch::End);
        }
        Ok(Fetch::Idle)
    }

    /// Push back the unconsumed tail of a fetched chunk. It will be the
    /// next data delivered.
    pub fn unfetch(&mut self, buf: Mbuf) {
        if buf.is_empty() {
            return;
        }
        self.mem_bytes += buf.len();
        self.mem.push_front(buf);
        if self.buffered() > self.threshold {
            self.over_threshold = true;
        }
    }

    /// Consumer acknowledged the end-of-stream.
    pub fn ack_end(&mut self) {
        assert!(self.end_delivered, "end acked before it was delivered");
        if !self.end_acked {
            self.end_acked = true;
            self.data_flushed_edge = true;
        }
    }

    fn note_drain(&mut self) {
        if self.over_threshold && self.buffered() <= self.threshold {
            self.over_threshold = false;
            self.buffers_flushed_edge = true;
        }
    }

    /// Unacknowledged bytes currently held (memory plus disk).
    pub fn buffered(&self) -> usize {
        self.mem_bytes
            + self.spill.as_ref().map_or(0, |s| s.pending() as usize)
    }

    pub fn passed_threshold(&self) -> bool {
        self.buffered() > self.threshold
    }

    /// True once the producer fed EOF (or an error).
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// True once the consumer acknowledged the EOF.
    pub fn end_acked(&self) -> bool {
        self.end_acked
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Backpressure relieved since the last call?
    pub fn take_buffers_flushed_edge(&mut self) -> bool {
        ::std::mem::replace(&mut self.buffers_flushed_edge, false)
    }

    /// All fed data consumed and EOF acknowledged since the last call?
    pub fn take_data_flushed_edge(&mut self) -> bool {
        ::std::mem::replace(&mut self.data_flushed_edge, false)
    }
}

/// File-buffered channel whose consumer is a non-blocking socket.
///
/// Fed bytes are written out on `flush()`; whatever the socket will not
/// take stays buffered (spilling to disk past the threshold). Feeding the
/// empty mbuf ends the stream; once the tail is written the data-flushed
/// edge fires.
#[derive(Debug)]
pub struct FdOutputChannel {
    chan: FileBufferedChannel,
}

impl FdOutputChannel {
    pub fn new(threshold: usize, spill_dir: &Path) -> FdOutputChannel {
        FdOutputChannel { chan: FileBufferedChannel::new(threshold, spill_dir) }
    }

    pub fn reinitialize(&mut self) {
        self.chan.reinitialize();
    }

    pub fn deinitialize(&mut self) {
        self.chan.deinitialize();
    }

    pub fn feed(&mut self, buf: Mbuf) -> io::Result<()> {
        self.chan.feed(buf)
    }

    /// Write as much buffered data to `sock` as it will take without
    /// blocking. Returns `Ok` on `WouldBlock`; real I/O errors bubble up.
    pub fn flush<W: Write>(&mut self, sock: &mut W) -> io::Result<()> {
        loop {
            match self.chan.fetch()? {
                Fetch::Data(chunk) => {
                    let mut written = 0;
                    while written < chunk.len() {
                        match sock.write(&chunk[written..]) {
                            Ok(0) => {
                                return Err(io::Error::new(
                                    io::ErrorKind::WriteZero,
                                    "socket accepted zero bytes",
                                ));
                            }
                            Ok(n) => written += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.chan.unfetch(
                                    chunk.slice(written..chunk.len()));
                                return Ok(());
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                Fetch::End => self.chan.ack_end(),
                Fetch::Error(_) => unreachable!("errors are not fed downstream"),
                Fetch::Idle => return Ok(()),
            }
        }
    }

    /// Bytes still waiting for the socket (or an unflushed EOF marker).
    pub fn has_pending(&self) -> bool {
        self.chan.buffered() > 0 || (self.chan.ended() && !self.chan.end_acked())
    }

    pub fn ended(&self) -> bool {
        self.chan.ended()
    }

    pub fn end_acked(&self) -> bool {
        self.chan.end_acked()
    }

    pub fn take_data_flushed_edge(&mut self) -> bool {
        self.chan.take_data_flushed_edge()
    }
}

/// Socket-to-dispatch conduit for one connection.
///
/// The server reads the socket and pushes chunks here; the dispatch loop
/// takes them out and pushes unconsumed remainders back. `stop()` and
/// `start()` gate whether the owner should keep the readability watch
/// armed; queued data survives a stop and is redelivered after the next
/// start, which is how a keep-alive connection carries bytes that arrived
/// past the end of one request into the next.
#[derive(Debug)]
pub struct InputChannel {
    started: bool,
    queue: VecDeque<Mbuf>,
    eof: bool,
    eof_delivered: bool,
    error: Option<i32>,
    error_delivered: bool,
}

impl InputChannel {
    pub fn new() -> InputChannel {
        InputChannel {
            started: false,
            queue: VecDeque::new(),
            eof: false,
            eof_delivered: false,
            error: None,
            error_delivered: false,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn stop(&mut self) {
        self.started = false;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn push(&mut self, buf: Mbuf) {
        assert!(!self.eof, "data pushed after EOF");
        if !buf.is_empty() {
            self.queue.push_back(buf);
        }
    }

    pub fn take(&mut self) -> Option<Mbuf> {
        self.queue.pop_front()
    }

    pub fn untake(&mut self, buf: Mbuf) {
        if !buf.is_empty() {
            self.queue.push_front(buf);
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn set_error(&mut self, errno: i32) {
        self.error = Some(errno);
    }

    /// EOF event, delivered once, after all queued data.
    pub fn take_eof_event(&mut self) -> bool {
        if self.eof && self.queue.is_empty() && !self.eof_delivered {
            self.eof_delivered = true;
            true
        } else {
            false
        }
    }

    /// Error event, delivered once, after all queued data.
    pub fn take_error_event(&mut self) -> Option<i32> {
        match self.error {
            Some(errno) if self.queue.is_empty() && !self.error_delivered => {
                self.error_delivered = true;
                Some(errno)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::env;
    use std::io::{self, Write};

    use mbuf::Mbuf;
    use super::{ChannelError, FdOutputChannel, Fetch, FileBufferedChannel};
    use super::InputChannel;

    fn chan(threshold: usize) -> FileBufferedChannel {
        FileBufferedChannel::new(threshold, &env::temp_dir())
    }

    fn fetch_data(ch: &mut FileBufferedChannel) -> Vec<u8> {
        match ch.fetch().unwrap() {
            Fetch::Data(buf) => buf.to_vec(),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_in_memory() {
        let mut ch = chan(1024);
        ch.feed(Mbuf::copy_from(b"one")).unwrap();
        ch.feed(Mbuf::copy_from(b"two")).unwrap();
        assert_eq!(ch.buffered(), 6);
        assert_eq!(fetch_data(&mut ch), b"one");
        assert_eq!(fetch_data(&mut ch), b"two");
        assert!(matches!(ch.fetch().unwrap(), Fetch::Idle));
    }

    #[test]
    fn test_end_delivery_and_ack() {
        let mut ch = chan(1024);
        ch.feed(Mbuf::copy_from(b"data")).unwrap();
        ch.feed(Mbuf::empty()).unwrap();
        assert!(ch.ended());
        assert!(!ch.end_acked());
        assert_eq!(fetch_data(&mut ch), b"data");
        assert!(matches!(ch.fetch().unwrap(), Fetch::End));
        ch.ack_end();
        assert!(ch.end_acked());
        assert!(ch.take_data_flushed_edge());
        assert!(!ch.take_data_flushed_edge());
        // the end is not delivered twice
        assert!(matches!(ch.fetch().unwrap(), Fetch::Idle));
    }

    #[test]
    fn test_error_delivered_after_data() {
        let mut ch = chan(1024);
        ch.feed(Mbuf::copy_from(b"abc")).unwrap();
        ch.feed_error(ChannelError::UnexpectedEof);
        assert_eq!(fetch_data(&mut ch), b"abc");
        match ch.fetch().unwrap() {
            Fetch::Error(ChannelError::UnexpectedEof) => {}
            other => panic!("expected error, got {:?}", other),
        }
        assert!(matches!(ch.fetch().unwrap(), Fetch::Idle));
    }

    #[test]
    fn test_spill_preserves_order() {
        let mut ch = chan(8);
        ch.feed(Mbuf::copy_from(b"12345678")).unwrap();
        // queue is at the threshold: the next chunk goes to disk
        ch.feed(Mbuf::copy_from(b"abcdefgh")).unwrap();
        ch.feed(Mbuf::copy_from(b"ijkl")).unwrap();
        assert!(ch.passed_threshold());
        assert_eq!(ch.buffered(), 20);

        let mut drained = Vec::new();
        loop {
            match ch.fetch().unwrap() {
                Fetch::Data(buf) => drained.extend_from_slice(&buf),
                Fetch::Idle => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(drained, b"12345678abcdefghijkl");
        assert_eq!(ch.buffered(), 0);
        // once the spill drained, small feeds stay in memory again
        ch.feed(Mbuf::copy_from(b"x")).unwrap();
        assert_eq!(fetch_data(&mut ch), b"x");
    }

    #[test]
    fn test_buffers_flushed_edge() {
        let mut ch = chan(4);
        ch.feed(Mbuf::copy_from(b"123456")).unwrap();
        assert!(ch.passed_threshold());
        assert!(!ch.take_buffers_flushed_edge());
        let buf = fetch_data(&mut ch);
        assert_eq!(buf, b"123456");
        assert!(ch.take_buffers_flushed_edge());
        assert!(!ch.take_buffers_flushed_edge());
    }

    #[test]
    fn test_unfetch_requeues_front() {
        let mut ch = chan(1024);
        ch.feed(Mbuf::copy_from(b"hello")).unwrap();
        ch.feed(Mbuf::copy_from(b"world")).unwrap();
        let chunk = match ch.fetch().unwrap() {
            Fetch::Data(buf) => buf,
            other => panic!("unexpected {:?}", other),
        };
        // consumer took only two bytes
        ch.unfetch(chunk.slice(2..chunk.len()));
        assert_eq!(fetch_data(&mut ch), b"llo");
        assert_eq!(fetch_data(&mut ch), b"world");
    }

    #[test]
    fn test_reinitialize_clears_previous_stream() {
        let mut ch = chan(2);
        ch.feed(Mbuf::copy_from(b"spilled data")).unwrap();
        ch.feed(Mbuf::empty()).unwrap();
        ch.reinitialize();
        assert_eq!(ch.buffered(), 0);
        assert!(!ch.ended());
        ch.feed(Mbuf::copy_from(b"next")).unwrap();
        assert_eq!(fetch_data(&mut ch), b"next");
    }

    struct Throttled {
        taken: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = ::std::cmp::min(self.budget, data.len());
            self.taken.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_channel_partial_writes() {
        let mut out = FdOutputChannel::new(1024, &env::temp_dir());
        out.feed(Mbuf::copy_from(b"response body")).unwrap();
        out.feed(Mbuf::empty()).unwrap();

        let mut sock = Throttled { taken: Vec::new(), budget: 8 };
        out.flush(&mut sock).unwrap();
        assert_eq!(sock.taken, b"response");
        assert!(out.has_pending());
        assert!(!out.end_acked());

        sock.budget = 64;
        out.flush(&mut sock).unwrap();
        assert_eq!(sock.taken, b"response body");
        assert!(!out.has_pending());
        assert!(out.end_acked());
        assert!(out.take_data_flushed_edge());
    }

    #[test]
    fn test_input_channel_redelivery() {
        let mut input = InputChannel::new();
        input.start();
        input.push(Mbuf::copy_from(b"GET / HTTP/1.1\r\n\r\nleftover"));
        let chunk = input.take().unwrap();
        // dispatch consumed only the head; the tail is redelivered
        input.untake(chunk.slice(18..chunk.len()));
        input.stop();
        assert!(input.has_queued());
        input.start();
        assert_eq!(&input.take().unwrap()[..], b"leftover");
    }

    #[test]
    fn test_input_channel_eof_after_data() {
        let mut input = InputChannel::new();
        input.start();
        input.push(Mbuf::copy_from(b"abc"));
        input.set_eof();
        assert!(!input.take_eof_event());
        input.take().unwrap();
        assert!(input.take_eof_event());
        assert!(!input.take_eof_event());
    }
}
