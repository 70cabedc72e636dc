//! The application handler contract.
//!
//! A handler sees a borrowed view of one parsed request and writes the
//! response body into a sink; it returns the status code. The views borrow
//! the connection's accumulator and cannot escape the call.

use std::io;

/// Parsed request fields handed to a [`Handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub(crate) is_get: bool,
    pub(crate) url: &'a [u8],
    pub(crate) body: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn new(is_get: bool, url: &'a [u8], body: &'a [u8]) -> Self {
        Self { is_get, url, body }
    }

    /// Request line starts with `G`. Every other method is "not GET".
    pub fn is_get(&self) -> bool {
        self.is_get
    }

    pub fn url(&self) -> &'a [u8] {
        self.url
    }

    /// The URL as UTF-8, if it is.
    pub fn url_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.url).ok()
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }
}

/// Response body writer backed by the connection's accumulator.
pub struct BodySink<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> BodySink<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard what has been written so far.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl io::Write for BodySink<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Application callback. Runs on a worker thread, one request at a time per
/// connection, concurrently across connections.
///
/// A panic inside `handle` is caught; the connection is closed without a
/// response and the server keeps running.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request<'_>, body: &mut BodySink<'_>) -> u16;
}

impl<F> Handler for F
where
    F: Fn(&Request<'_>, &mut BodySink<'_>) -> u16 + Send + Sync + 'static,
{
    fn handle(&self, req: &Request<'_>, body: &mut BodySink<'_>) -> u16 {
        self(req, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sink_writes() {
        let mut buf = Vec::new();
        let mut sink = BodySink::new(&mut buf);
        sink.write_str("{\"n\":");
        sink.write_byte(b'1');
        write!(sink, "{}", "}").unwrap();
        assert_eq!(sink.len(), 7);
        assert_eq!(buf, b"{\"n\":1}");
    }

    #[test]
    fn test_closure_is_handler() {
        fn call<H: Handler>(h: &H) -> (u16, Vec<u8>) {
            let mut buf = Vec::new();
            let req = Request::new(true, b"/hello", b"");
            let status = h.handle(&req, &mut BodySink::new(&mut buf));
            (status, buf)
        }

        let (status, body) = call(&|req: &Request<'_>, body: &mut BodySink<'_>| {
            body.write(req.url());
            if req.is_get() {
                200
            } else {
                404
            }
        });
        assert_eq!(status, 200);
        assert_eq!(body, b"/hello");
    }

    #[test]
    fn test_url_str() {
        assert_eq!(Request::new(false, b"/a?b=c", b"").url_str(), Some("/a?b=c"));
        assert_eq!(Request::new(false, &[0xff, 0xfe], b"").url_str(), None);
    }
}
