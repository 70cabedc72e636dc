//! Minimal HTTP/1.x framing.
//!
//! Not a general parser: only the first byte of the method, the URL, the
//! `keep-alive` token and `Content-Length` are extracted. Parsed fields are
//! returned as offsets into the caller's buffer.

use std::io::Write;
use std::ops::Range;

pub const TERMINATOR: &[u8] = b"\r\n\r\n";
pub const DEFAULT_SERVER_NAME: &str = concat!("ephttp/", env!("CARGO_PKG_VERSION"));

const KEEP_ALIVE: &[u8] = b"keep-alive";

const LINE_200: &[u8] = b"HTTP/1.1 200 OK\r\n";
const LINE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n";
const LINE_404: &[u8] = b"HTTP/1.1 404 Not Found\r\n";

const BODY_400: &[u8] = b"400 Bad Request\n";
const BODY_404: &[u8] = b"404 Not Found\n";

/// Offsets of one framed request inside the accumulated bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub is_get: bool,
    pub url: Range<usize>,
    pub body: Range<usize>,
    pub keep_alive: bool,
}

impl Head {
    /// Bytes belonging to this request; anything after is the next one.
    pub fn consumed(&self) -> usize {
        self.body.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// No header terminator yet, or the declared body is still arriving.
    Incomplete,
    Complete(Head),
    /// Unusable `Content-Length`.
    Invalid,
}

pub fn try_parse(buf: &[u8]) -> Parse {
    let Some(end) = find(buf, TERMINATOR) else {
        return Parse::Incomplete;
    };
    let headers = &buf[..end];
    let body_start = end + TERMINATOR.len();

    let line_end = headers
        .iter()
        .position(|&b| b == b'\r')
        .unwrap_or(headers.len());
    let line = &headers[..line_end];

    // URL: between the first and second space of the request line.
    let url = match line.iter().position(|&b| b == b' ') {
        Some(sp) => {
            let start = sp + 1;
            let len = line[start..]
                .iter()
                .position(|&b| b == b' ')
                .unwrap_or(line.len() - start);
            start..start + len
        }
        None => line_end..line_end,
    };

    let body_len = match content_length(&headers[line_end..]) {
        Ok(n) => n.unwrap_or(0),
        Err(()) => return Parse::Invalid,
    };
    let Some(body_end) = body_start.checked_add(body_len) else {
        return Parse::Invalid;
    };
    if buf.len() < body_end {
        return Parse::Incomplete;
    }

    Parse::Complete(Head {
        is_get: buf.first() == Some(&b'G'),
        url,
        body: body_start..body_end,
        keep_alive: find(headers, KEEP_ALIVE).is_some(),
    })
}

/// `Ok(None)` when absent; `Err` when present but not a decimal length.
fn content_length(header_block: &[u8]) -> Result<Option<usize>, ()> {
    for line in header_block.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !trim(&line[..colon]).eq_ignore_ascii_case(b"content-length") {
            continue;
        }
        let value = trim(&line[colon + 1..]);
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(());
        }
        return std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or(());
    }
    Ok(None)
}

pub fn status_line(status: u16) -> &'static [u8] {
    match status {
        400 => LINE_400,
        404 => LINE_404,
        _ => LINE_200,
    }
}

/// Append a complete response to `out`.
///
/// 400 and 404 replace `body` with a fixed plain-text error body; every
/// other status is sent as `200 OK` with `body` as JSON.
pub fn serialize_into(out: &mut Vec<u8>, status: u16, body: &[u8], keep_alive: bool, server: &str) {
    let (body, content_type): (&[u8], &str) = match status {
        400 => (BODY_400, "text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff"),
        404 => (BODY_404, "text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff"),
        _ => (body, "application/json"),
    };

    out.reserve(128 + server.len() + body.len());
    out.extend_from_slice(status_line(status));
    // Writes into a Vec cannot fail.
    let _ = write!(
        out,
        "Server: {}\r\nContent-Length: {}\r\nConnection: {}\r\nContent-Type: {}\r\n\r\n",
        server,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
        content_type,
    );
    out.extend_from_slice(body);
}

pub fn serialize(status: u16, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_into(&mut out, status, body, keep_alive, DEFAULT_SERVER_NAME);
    out
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if !first.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    while let [rest @ .., last] = s {
        if !last.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    s
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buf: &[u8]) -> Head {
        match try_parse(buf) {
            Parse::Complete(h) => h,
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_keep_alive() {
        let buf = b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let head = complete(buf);
        assert!(head.is_get);
        assert!(head.keep_alive);
        assert_eq!(&buf[head.url.clone()], b"/ping");
        assert!(head.body.is_empty());
        assert_eq!(head.consumed(), buf.len());
    }

    #[test]
    fn test_incomplete_until_terminator() {
        assert_eq!(try_parse(b""), Parse::Incomplete);
        assert_eq!(try_parse(b"GET / HTTP/1.1\r\nHost: x\r\n"), Parse::Incomplete);
        assert!(matches!(
            try_parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Parse::Complete(_)
        ));
    }

    #[test]
    fn test_post_url_and_body() {
        let buf = b"POST /submit HTTP/1.1\r\ncontent-LENGTH: 5\r\n\r\nhelloGET /next";
        let head = complete(buf);
        assert!(!head.is_get);
        assert!(!head.keep_alive);
        assert_eq!(&buf[head.url.clone()], b"/submit");
        assert_eq!(&buf[head.body.clone()], b"hello");
        assert_eq!(&buf[head.consumed()..], b"GET /next");
    }

    #[test]
    fn test_body_still_arriving() {
        let buf = b"PUT /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345";
        assert_eq!(try_parse(buf), Parse::Incomplete);
    }

    #[test]
    fn test_bad_content_length() {
        assert_eq!(
            try_parse(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Parse::Invalid
        );
        assert_eq!(
            try_parse(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n"),
            Parse::Invalid
        );
        assert_eq!(
            try_parse(b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n"),
            Parse::Invalid
        );
    }

    #[test]
    fn test_keep_alive_only_counts_in_headers() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nkeep-alive";
        assert!(!complete(buf).keep_alive);
    }

    #[test]
    fn test_coarse_method_detection() {
        assert!(complete(b"GOSSIP / HTTP/1.1\r\n\r\n").is_get);
        assert!(!complete(b"DELETE / HTTP/1.1\r\n\r\n").is_get);
    }

    #[test]
    fn test_request_line_without_version() {
        let buf = b"GET /bare\r\n\r\n";
        let head = complete(buf);
        assert_eq!(&buf[head.url.clone()], b"/bare");
    }

    #[test]
    fn test_serialize_ok_template() {
        let body = br#"{"ok":true}"#;
        let out = serialize_into_vec(200, body, true, "test/1");
        let expected = b"HTTP/1.1 200 OK\r\n\
Server: test/1\r\n\
Content-Length: 11\r\n\
Connection: keep-alive\r\n\
Content-Type: application/json\r\n\
\r\n\
{\"ok\":true}";
        assert_eq!(out, expected.to_vec());
    }

    #[test]
    fn test_content_length_matches_body() {
        for len in [0usize, 1, 9, 10, 4096] {
            let body = vec![b'a'; len];
            let out = serialize_into_vec(200, &body, false, "s");
            let prefix = format!(
                "HTTP/1.1 200 OK\r\nServer: s\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: application/json\r\n\r\n",
                len
            );
            assert_eq!(&out[..prefix.len()], prefix.as_bytes());
            assert_eq!(&out[prefix.len()..], &body[..]);
        }
    }

    #[test]
    fn test_serialize_error_replaces_body() {
        let out = serialize(404, b"{\"secret\":1}", false);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.ends_with("\r\n\r\n404 Not Found\n"));
        assert!(!text.contains("secret"));

        let out = serialize(400, b"", false);
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.ends_with(b"400 Bad Request\n"));
    }

    #[test]
    fn test_unknown_status_defaults_to_ok() {
        for status in [201, 302, 500] {
            let out = serialize(status, b"[]", true);
            assert!(out.starts_with(LINE_200));
            assert!(out.ends_with(b"\r\n\r\n[]"));
        }
    }

    fn serialize_into_vec(status: u16, body: &[u8], keep_alive: bool, server: &str) -> Vec<u8> {
        let mut out = Vec::new();
        serialize_into(&mut out, status, body, keep_alive, server);
        out
    }
}
