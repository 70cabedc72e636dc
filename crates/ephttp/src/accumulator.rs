//! Per-connection scratch state and the pool that recycles it.
//!
//! An `Accumulator` is owned by exactly one connection between
//! `AccumulatorPool::acquire()` and `AccumulatorPool::release()`.
//! `release()` takes it by value, so releasing twice does not compile.

use crate::framer::{self, Head};
use crate::handler::{BodySink, Handler, Request};

use ephttp_reactor::socket::{self, ReadOutcome};

use crossbeam_queue::ArrayQueue;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Buffers that grew beyond this are shrunk before going back to the pool,
/// so one oversized request does not pin memory for the pool's lifetime.
pub const RETAIN_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub struct Accumulator {
    /// Fixed-capacity read buffer. Only `[..n]` of a read is ever looked
    /// at, so stale bytes from earlier reads are never observed.
    scratch: Box<[u8]>,
    request: Vec<u8>,
    response: Vec<u8>,
    body: Vec<u8>,
    head: Option<Head>,
    peer_closed: bool,
}

impl Accumulator {
    pub fn new(scratch_size: usize) -> Self {
        Self {
            scratch: vec![0u8; scratch_size.max(1)].into_boxed_slice(),
            request: Vec::new(),
            response: Vec::new(),
            body: Vec::new(),
            head: None,
            peer_closed: false,
        }
    }

    /// Drain `fd` into the request buffer.
    pub fn fill(&mut self, fd: RawFd) -> ReadOutcome {
        let outcome = socket::read_drain(fd, &mut self.scratch, |chunk| {
            self.request.extend_from_slice(chunk)
        });
        if outcome == ReadOutcome::PeerClosed {
            self.peer_closed = true;
        }
        outcome
    }

    #[cfg(test)]
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        self.request.extend_from_slice(bytes);
    }

    pub fn request_bytes(&self) -> &[u8] {
        &self.request
    }

    pub fn pending(&self) -> usize {
        self.request.len()
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn scratch_capacity(&self) -> usize {
        self.scratch.len()
    }

    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    pub fn set_head(&mut self, head: Head) {
        debug_assert!(head.consumed() <= self.request.len());
        self.head = Some(head);
    }

    /// Borrowed view of the framed request, if one is set.
    pub fn request(&self) -> Option<Request<'_>> {
        let head = self.head.as_ref()?;
        Some(Request::new(
            head.is_get,
            &self.request[head.url.clone()],
            &self.request[head.body.clone()],
        ))
    }

    /// Keep the connection open after this exchange?
    pub fn keep_alive(&self) -> bool {
        !self.peer_closed && self.head.as_ref().is_some_and(|h| h.keep_alive)
    }

    /// Run `handler` on the framed request, collecting the body into the
    /// accumulator. `None` if no request is framed.
    pub fn invoke<H: Handler + ?Sized>(&mut self, handler: &H) -> Option<u16> {
        let head = self.head.as_ref()?;
        let req = Request::new(
            head.is_get,
            &self.request[head.url.clone()],
            &self.request[head.body.clone()],
        );
        self.body.clear();
        let mut sink = BodySink::new(&mut self.body);
        Some(handler.handle(&req, &mut sink))
    }

    pub fn response_body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize the response into the accumulator and return the bytes.
    pub fn respond(&mut self, status: u16, keep_alive: bool, server: &str) -> &[u8] {
        self.response.clear();
        framer::serialize_into(&mut self.response, status, &self.body, keep_alive, server);
        &self.response
    }

    /// Reset the per-request fields after a keep-alive exchange. Bytes that
    /// follow the finished request stay buffered for the next one.
    pub fn next_request(&mut self) {
        let consumed = self
            .head
            .take()
            .map_or(0, |h| h.consumed())
            .min(self.request.len());
        self.request.drain(..consumed);
        self.response.clear();
        self.body.clear();
    }

    /// Full reset, as done before re-entering the pool.
    pub fn reset(&mut self) {
        self.request.clear();
        self.response.clear();
        self.body.clear();
        self.head = None;
        self.peer_closed = false;
        for buf in [&mut self.request, &mut self.response, &mut self.body] {
            if buf.capacity() > RETAIN_LIMIT {
                buf.shrink_to(RETAIN_LIMIT);
            }
        }
    }

    pub fn is_reset(&self) -> bool {
        self.request.is_empty()
            && self.response.is_empty()
            && self.body.is_empty()
            && self.head.is_none()
            && !self.peer_closed
    }
}

/// Bounded lock-free free list of accumulators.
pub struct AccumulatorPool {
    free: ArrayQueue<Accumulator>,
    scratch_size: usize,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl AccumulatorPool {
    /// `capacity` idle accumulators are kept at most; extras are dropped on
    /// release.
    pub fn new(capacity: usize, scratch_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            scratch_size,
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> Accumulator {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(acc) => {
                debug_assert!(acc.is_reset());
                acc
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Accumulator::new(self.scratch_size)
            }
        }
    }

    pub fn release(&self, mut acc: Accumulator) {
        acc.reset();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if self.free.push(acc).is_err() {
            // Pool full: let it drop.
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Accumulators alive (idle + in use).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}
