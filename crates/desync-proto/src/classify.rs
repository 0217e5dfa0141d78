//! Recognizes the application-layer records a censor keys on: a TLS
//! ClientHello's SNI extension, and an HTTP request's `Host:` header.
//!
//! Every walk here is bounds-checked against `payload.len()` at each step;
//! a length field that would read past the end of the buffer aborts the
//! walk with `None` rather than panicking or reading garbage.

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "HEAD ", "PUT ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

/// True iff `payload` begins with a TLS handshake record (content type 0x16)
/// whose handshake message type is ClientHello (0x01).
pub fn is_tls_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 6 && payload[0] == 0x16 && payload[5] == 0x01
}

/// True iff `payload`'s leading bytes look like an HTTP/1.x request line:
/// a known method, a space, and ` HTTP/` somewhere before the first CRLF.
pub fn is_http_request(payload: &[u8]) -> bool {
    let Some(method) = HTTP_METHODS.iter().find(|m| payload.starts_with(m.as_bytes())) else {
        return false;
    };
    let line_end = payload
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(payload.len());
    let line = &payload[method.len().min(line_end)..line_end];
    find_subslice(line, b" HTTP/").is_some()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Walks a TLS ClientHello record to find the SNI (`server_name`) extension
/// and return the first `host_name` entry it carries.
///
/// Bounds per the TLS record/handshake layout:
/// record header(5) + handshake header(4) + version(2) + random(32) = 43,
/// then session_id (1-byte length prefix), cipher_suites (2-byte length
/// prefix), compression_methods (1-byte length prefix), extensions
/// (2-byte length prefix). Returns `None` on any short read or non-UTF8
/// hostname; never panics.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if !is_tls_client_hello(payload) {
        return None;
    }
    if payload.len() <= 43 {
        return None;
    }
    let mut c = Cursor::new(payload);
    c.skip(43)?;

    let session_id_len = c.u8()? as usize;
    c.skip(session_id_len)?;

    let cipher_suites_len = c.u16()? as usize;
    c.skip(cipher_suites_len)?;

    let compression_len = c.u8()? as usize;
    c.skip(compression_len)?;

    let extensions_len = c.u16()? as usize;
    let extensions = c.take(extensions_len)?;

    let mut ec = Cursor::new(extensions);
    while ec.remaining() >= 4 {
        let ext_type = ec.u16()?;
        let ext_len = ec.u16()? as usize;
        let ext_body = ec.take(ext_len)?;
        if ext_type != 0x0000 {
            continue;
        }
        // server_name extension: name_list length(2), then entries of
        // name_type(1) + name(2-byte length prefix).
        let mut sc = Cursor::new(ext_body);
        let _name_list_len = sc.u16()?;
        let name_type = sc.u8()?;
        let name_len = sc.u16()? as usize;
        let name_bytes = sc.take(name_len)?;
        if name_type != 0x00 {
            return None;
        }
        return std::str::from_utf8(name_bytes).ok().map(|s| s.to_string());
    }
    None
}

/// Case-insensitive scan for an HTTP `Host:` header, bounded by `payload`.
/// Returns the trimmed value up to the first CR or LF.
pub fn extract_http_host(payload: &[u8]) -> Option<String> {
    let header_pos = find_header(payload, b"host:")?;
    let mut start = header_pos + "host:".len();
    while start < payload.len() && payload[start] == b' ' {
        start += 1;
    }
    let mut end = start;
    while end < payload.len() && payload[end] != b'\r' && payload[end] != b'\n' {
        end += 1;
    }
    std::str::from_utf8(&payload[start..end])
        .ok()
        .map(|s| s.to_string())
}

/// Case-insensitive search for `needle` anywhere in `haystack`.
fn find_header(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Finds the byte offset of the literal `Host:` header name within
/// `payload`, used by the fragment builder to locate which fragment needs
/// case-mixing applied to the hostname that follows.
pub fn host_header_offset(payload: &[u8]) -> Option<usize> {
    find_header(payload, b"host:")
}
