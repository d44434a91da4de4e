use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bus::common::Result;
use crate::bus::watch::{Interest, Watch};

/// A fully serialized outbound message: a header and a body byte range,
/// handed to the transport by the connection's outbound queue (§6's "wire
/// format ... opaque to the transport"). Stands in for the message
/// serializer interface, which is out of scope for this crate (spec.md §1).
pub trait OutboundMessage: Send + Sync {
    fn header(&self) -> &[u8];
    fn body(&self) -> &[u8];

    fn total_len(&self) -> usize {
        self.header().len() + self.body().len()
    }
}

/// The message parser owned by the enclosing connection (§6 "Loader
/// interface (consumed)"). The transport reads bytes directly into the
/// loader's buffer, then asks it to turn complete byte runs into messages.
pub trait Loader: Send {
    /// Lends the tail of the loader's own buffer for the transport to read
    /// into, or decode into (§4.6 reading loop).
    fn get_buffer(&mut self, min_bytes: usize) -> Result<&mut [u8]>;

    /// Commits `n` bytes appended by the last `get_buffer` borrow.
    fn return_buffer(&mut self, n: usize);

    /// Parses any complete messages out of the buffered bytes and hands
    /// them to the connection's inbound queue. Returns `Err` only on
    /// recoverable OOM (§4.6 step 6); a parse error is a connection-layer
    /// concern, not this trait's.
    fn queue_messages(&mut self) -> Result<()>;
}

/// The enclosing connection, as seen by the transport (§6 "Connection
/// interface (consumed)").
pub trait Connection: Send + Sync {
    fn add_watch(&self, watch: Arc<Watch>) -> Result<()>;
    fn remove_watch(&self, watch: &Arc<Watch>);
    fn toggle_watch(&self, watch: &Arc<Watch>, enabled: bool) {
        watch.set_enabled(enabled);
    }

    fn have_messages_to_send(&self) -> bool;
    fn get_message_to_send(&self) -> Option<Arc<dyn OutboundMessage>>;
    /// Notifies the connection that the head of its outbound queue was
    /// fully written to the wire; the connection is expected to pop it.
    fn message_sent(&self, message: &Arc<dyn OutboundMessage>);
}

/// A trivial `OutboundMessage` over two owned byte vectors, used by the
/// loopback harness below and by tests elsewhere in the crate.
pub struct OwnedMessage {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl OutboundMessage for OwnedMessage {
    fn header(&self) -> &[u8] {
        &self.header
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

/// An in-memory `Loader` that simply concatenates bytes and hands back a
/// "message" once a caller-supplied total length has been reached. Real
/// framing (reading a header to learn the body length) lives in the
/// out-of-scope message-parser layer (spec.md §1); this harness only needs
/// to prove the transport's byte accounting is correct.
#[derive(Default)]
pub struct VecLoader {
    buf: crate::bus::common::ByteBuffer,
    expected_len: Option<usize>,
    pub completed: VecDeque<Vec<u8>>,
}

impl VecLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the length at which the next run of bytes becomes one
    /// completed message. Call again after each completion for a new one.
    pub fn expect_message(&mut self, len: usize) {
        self.expected_len = Some(len);
    }

    /// Appends bytes directly, bypassing the borrow_tail/return_tail
    /// protocol. Used by test harnesses that stage reads outside the
    /// buffer (e.g. to share a loader across threads behind a `Mutex`,
    /// where `get_buffer`'s borrowed slice can't outlive the lock guard).
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.append_bytes(bytes)
    }
}

impl Loader for VecLoader {
    fn get_buffer(&mut self, min_bytes: usize) -> Result<&mut [u8]> {
        self.buf.borrow_tail(min_bytes)
    }

    fn return_buffer(&mut self, n: usize) {
        self.buf.return_tail(n);
    }

    fn queue_messages(&mut self) -> Result<()> {
        loop {
            let expected = match self.expected_len {
                Some(n) => n,
                None => return Ok(()),
            };
            if self.buf.len() < expected {
                return Ok(());
            }
            let msg = self.buf.as_slice()[..expected].to_vec();
            let remainder = self.buf.as_slice()[expected..].to_vec();
            self.buf.clear();
            self.buf.append_bytes(&remainder)?;
            self.completed.push_back(msg);
            self.expected_len = None;
        }
    }
}

/// A `Connection` whose watches, outbound queue, and event-loop toggles
/// all live in plain in-process state, for tests and as the worked example
/// `SPEC_FULL.md` §6 calls for ("alternative implementations ... share the
/// same capability set", spec.md §9).
#[derive(Default)]
pub struct LoopbackConnection {
    inner: Mutex<LoopbackConnectionState>,
}

#[derive(Default)]
struct LoopbackConnectionState {
    watches: Vec<Arc<Watch>>,
    outbound: VecDeque<Arc<dyn OutboundMessage>>,
    sent: Vec<Arc<dyn OutboundMessage>>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: Arc<dyn OutboundMessage>) {
        self.inner.lock().unwrap().outbound.push_back(message);
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }

    pub fn watch_count(&self) -> usize {
        self.inner.lock().unwrap().watches.len()
    }

    /// Returns the watch the transport installed for `interest`, for tests
    /// that need to observe `enabled()` flips (e.g. backpressure toggling
    /// the read watch). Real embedders would toggle the event loop's own
    /// registration instead of inspecting the `Watch` directly.
    pub fn watch(&self, interest: Interest) -> Option<Arc<Watch>> {
        self.inner.lock().unwrap().watches.iter().find(|w| w.interest() == interest).cloned()
    }
}

impl Connection for LoopbackConnection {
    fn add_watch(&self, watch: Arc<Watch>) -> Result<()> {
        self.inner.lock().unwrap().watches.push(watch);
        Ok(())
    }

    fn remove_watch(&self, watch: &Arc<Watch>) {
        let mut guard = self.inner.lock().unwrap();
        guard.watches.retain(|w| !Arc::ptr_eq(w, watch));
    }

    fn have_messages_to_send(&self) -> bool {
        !self.inner.lock().unwrap().outbound.is_empty()
    }

    fn get_message_to_send(&self) -> Option<Arc<dyn OutboundMessage>> {
        self.inner.lock().unwrap().outbound.front().cloned()
    }

    fn message_sent(&self, message: &Arc<dyn OutboundMessage>) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(front) = guard.outbound.front() {
            if Arc::ptr_eq(front, message) {
                let m = guard.outbound.pop_front().unwrap();
                guard.sent.push(m);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_loader_emits_completed_message_once_full() {
        let mut loader = VecLoader::new();
        loader.expect_message(5);
        let buf = loader.get_buffer(5).unwrap();
        buf[..5].copy_from_slice(b"hello");
        loader.return_buffer(5);
        loader.queue_messages().unwrap();
        assert_eq!(loader.completed.pop_front().unwrap(), b"hello");
    }

    #[test]
    fn vec_loader_waits_for_full_length_before_completing() {
        let mut loader = VecLoader::new();
        loader.expect_message(5);
        let buf = loader.get_buffer(5).unwrap();
        buf[..2].copy_from_slice(b"he");
        loader.return_buffer(2);
        loader.queue_messages().unwrap();
        assert!(loader.completed.is_empty());
    }

    #[test]
    fn loopback_connection_pops_queue_on_message_sent() {
        let conn = LoopbackConnection::new();
        let msg: Arc<dyn OutboundMessage> = Arc::new(OwnedMessage { header: vec![1], body: vec![2, 3] });
        conn.enqueue(msg.clone());
        assert!(conn.have_messages_to_send());
        conn.message_sent(&msg);
        assert!(!conn.have_messages_to_send());
        assert_eq!(conn.sent_count(), 1);
    }
}
