use std::str;

/// Index into a `Pool`. Stays valid across arena growth because it
/// addresses by offset, not by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    off: u32,
    len: u32,
}

impl Span {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-request append-only arena.
///
/// Everything a request parses out of the wire (path, header names and
/// values) is appended here and addressed by `Span`. Dropping or clearing
/// the pool reclaims all of it at once; nothing hands out references that
/// could outlive it because resolution always goes through `get()`.
#[derive(Debug)]
pub struct Pool {
    data: Vec<u8>,
}

impl Pool {
    pub fn new(default_size: usize) -> Pool {
        Pool { data: Vec::with_capacity(default_size) }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Span {
        let off = self.data.len();
        assert!(off + bytes.len() <= u32::max_value() as usize);
        self.data.extend_from_slice(bytes);
        Span { off: off as u32, len: bytes.len() as u32 }
    }

    pub fn get(&self, span: Span) -> &[u8] {
        &self.data[span.off as usize..(span.off + span.len) as usize]
    }

    /// Resolve a span that was validated as UTF-8 when it was appended
    /// (request paths, header names). Panics on invariant violation.
    pub fn get_str(&self, span: Span) -> &str {
        str::from_utf8(self.get(span)).expect("span holds validated utf-8")
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod test {
    use super::Pool;

    #[test]
    fn test_append_and_get() {
        let mut pool = Pool::new(64);
        let a = pool.append(b"/some/path");
        let b = pool.append(b"value");
        assert_eq!(pool.get(a), b"/some/path");
        assert_eq!(pool.get(b), b"value");
        assert_eq!(pool.get_str(a), "/some/path");
    }

    #[test]
    fn test_spans_survive_growth() {
        let mut pool = Pool::new(8);
        let first = pool.append(b"0123456");
        // force the arena past its default size several times over
        let mut spans = Vec::new();
        for i in 0..100 {
            spans.push((i, pool.append(format!("entry-{}", i).as_bytes())));
        }
        assert_eq!(pool.get(first), b"0123456");
        for (i, span) in spans {
            assert_eq!(pool.get(span), format!("entry-{}", i).as_bytes());
        }
    }

    #[test]
    fn test_empty_span() {
        let mut pool = Pool::new(16);
        let span = pool.append(b"");
        assert!(span.is_empty());
        assert_eq!(pool.get(span), b"");
    }
}
