use pool::{Pool, Span};

/// One header line, stored as spans into the owning request's pool.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub key: Span,
    pub val: Span,
}

/// Case-insensitive ordered multimap of request headers.
///
/// Keys and values live in the request pool; the table itself only stores
/// spans, so clearing it (or dropping the pool) never leaves dangling
/// storage behind.
#[derive(Debug, Default)]
pub struct HeaderTable {
    entries: Vec<Header>,
}

impl HeaderTable {
    pub fn new() -> HeaderTable {
        HeaderTable { entries: Vec::new() }
    }

    pub fn insert(&mut self, key: Span, val: Span) {
        self.entries.push(Header { key: key, val: val });
    }

    /// First value stored under `name`, compared ASCII case-insensitively.
    pub fn lookup<'p>(&self, pool: &'p Pool, name: &str) -> Option<&'p [u8]> {
        for entry in &self.entries {
            if pool.get(entry.key).eq_ignore_ascii_case(name.as_bytes()) {
                return Some(pool.get(entry.val));
            }
        }
        None
    }

    pub fn iter(&self) -> ::std::slice::Iter<Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[inline(always)]
pub fn is_transfer_encoding(val: &str) -> bool {
    val.eq_ignore_ascii_case("transfer-encoding")
}

#[inline(always)]
pub fn is_content_length(val: &str) -> bool {
    val.eq_ignore_ascii_case("content-length")
}

#[inline(always)]
pub fn is_connection(val: &str) -> bool {
    val.eq_ignore_ascii_case("connection")
}

// header value is byte sequence
// we need case insensitive comparison and strip out of the whitespace
#[inline]
fn value_is_token(val: &[u8], token: &[u8]) -> bool {
    let mut start = 0;
    while start < val.len() {
        match val[start] {
            b'\r' | b'\n' | b' ' | b'\t' => start += 1,
            _ => break,
        }
    }
    let mut end = val.len();
    while end > start {
        match val[end - 1] {
            b'\r' | b'\n' | b' ' | b'\t' => end -= 1,
            _ => break,
        }
    }
    val[start..end].eq_ignore_ascii_case(token)
}

#[inline(always)]
pub fn is_close(val: &[u8]) -> bool {
    value_is_token(val, b"close")
}

#[inline(always)]
pub fn is_keep_alive(val: &[u8]) -> bool {
    value_is_token(val, b"keep-alive")
}

#[inline(always)]
pub fn is_upgrade(val: &[u8]) -> bool {
    value_is_token(val, b"upgrade")
}

#[inline(always)]
pub fn is_chunked(val: &[u8]) -> bool {
    value_is_token(val, b"chunked")
}

/// Header names carrying this prefix are routed into the trusted
/// (`secure_headers`) table. Who puts the prefix there is not this
/// crate's concern.
pub const SECURE_HEADER_PREFIX: &'static str = "!~";

#[cfg(test)]
mod test {
    use pool::Pool;
    use super::{HeaderTable, SECURE_HEADER_PREFIX};
    use super::{is_content_length, is_transfer_encoding, is_connection};
    use super::{is_chunked, is_close, is_keep_alive, is_upgrade};

    #[test]
    fn test_content_len() {
        assert!(is_content_length("Content-Length"));
        assert!(is_content_length("content-length"));
        assert!(is_content_length("CONTENT-length"));
        assert!(is_content_length("CONTENT-LENGTH"));
        assert!(!is_content_length("content-lengthx"));
    }

    #[test]
    fn test_transfer_encoding() {
        assert!(is_transfer_encoding("Transfer-Encoding"));
        assert!(is_transfer_encoding("transfer-ENCODING"));
        assert!(is_transfer_encoding("TRANSFER-Encoding"));
        assert!(is_transfer_encoding("TRANSFER-ENCODING"));
    }

    #[test]
    fn test_connection() {
        assert!(is_connection("Connection"));
        assert!(is_connection("CONNECTION"));
        assert!(is_connection("ConneCTION"));
        assert!(is_connection("connection"));
    }

    #[test]
    fn test_chunked() {
        assert!(is_chunked(b"chunked"));
        assert!(is_chunked(b"Chunked"));
        assert!(is_chunked(b"chuNKED"));
        assert!(is_chunked(b"CHUNKED"));
        assert!(is_chunked(b"   CHUNKED"));
        assert!(is_chunked(b"   CHUNKED  "));
        assert!(is_chunked(b"chunked  "));
        assert!(!is_chunked(b"chunky"));
    }

    #[test]
    fn test_close() {
        assert!(is_close(b"close"));
        assert!(is_close(b"Close"));
        assert!(is_close(b"clOSE"));
        assert!(is_close(b"CLOSE"));
        assert!(is_close(b" CLOSE"));
        assert!(is_close(b"   close   "));
        assert!(is_close(b"Close   "));
        assert!(!is_close(b"closed"));
    }

    #[test]
    fn test_keep_alive_and_upgrade() {
        assert!(is_keep_alive(b"keep-alive"));
        assert!(is_keep_alive(b" Keep-Alive "));
        assert!(!is_keep_alive(b"keepalive"));
        assert!(is_upgrade(b"upgrade"));
        assert!(is_upgrade(b"Upgrade"));
        assert!(!is_upgrade(b"upgrades"));
    }

    #[test]
    fn test_table_is_case_insensitive_multimap() {
        let mut pool = Pool::new(64);
        let mut table = HeaderTable::new();
        let k1 = pool.append(b"Host");
        let v1 = pool.append(b"example.org");
        let k2 = pool.append(b"X-Tag");
        let v2 = pool.append(b"one");
        let k3 = pool.append(b"x-tag");
        let v3 = pool.append(b"two");
        table.insert(k1, v1);
        table.insert(k2, v2);
        table.insert(k3, v3);

        assert_eq!(table.lookup(&pool, "host"), Some(&b"example.org"[..]));
        assert_eq!(table.lookup(&pool, "HOST"), Some(&b"example.org"[..]));
        // first insertion wins for lookup, all three stay iterable
        assert_eq!(table.lookup(&pool, "x-tag"), Some(&b"one"[..]));
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(&pool, "missing"), None);

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_secure_prefix() {
        assert!("!~PASSWORD".starts_with(SECURE_HEADER_PREFIX));
        assert!(!"Host".starts_with(SECURE_HEADER_PREFIX));
    }
}
