use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;

/// A reference-counted slice over a shared byte arena.
///
/// Cloning and sub-slicing are cheap: both share the underlying arena and
/// only bump an atomic count. The zero-length value returned by `empty()`
/// doubles as the end-of-stream sentinel when fed into a channel.
///
/// The count is atomic so that slices may be held across threads, but the
/// server only ever operates on them from the event-loop thread.
#[derive(Clone)]
pub struct Mbuf {
    data: Arc<[u8]>,
    off: usize,
    len: usize,
}

impl Mbuf {
    /// Wrap an owned region without copying it.
    pub fn from_vec(data: Vec<u8>) -> Mbuf {
        let len = data.len();
        Mbuf { data: data.into(), off: 0, len: len }
    }

    /// One-copy constructor for borrowed data.
    pub fn copy_from(data: &[u8]) -> Mbuf {
        Mbuf::from_vec(data.to_vec())
    }

    /// The length-zero sentinel. Feeding it into a channel signals EOF.
    pub fn empty() -> Mbuf {
        Mbuf { data: Arc::from(&[][..]), off: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-slice sharing this buffer's arena. Panics if the range is out
    /// of bounds, same as slicing a `[u8]`.
    pub fn slice(&self, range: Range<usize>) -> Mbuf {
        assert!(range.start <= range.end && range.end <= self.len);
        Mbuf {
            data: self.data.clone(),
            off: self.off + range.start,
            len: range.end - range.start,
        }
    }
}

impl Deref for Mbuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data[self.off..self.off + self.len]
    }
}

impl AsRef<[u8]> for Mbuf {
    fn as_ref(&self) -> &[u8] {
        &*self
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Mbuf({} bytes at +{})", self.len, self.off)
    }
}
