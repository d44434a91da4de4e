use std::sync::Arc;

use crate::bus::common::Result;
use crate::bus::connection::Connection;
use crate::bus::watch::Watch;

/// The capability set §9's design note asks for: a concrete transport is a
/// value implementing this trait rather than a subclass of an abstract
/// base. [`crate::bus::transport::StreamTransport`] is the one
/// implementation this crate ships; an in-memory transport for tests would
/// share the same trait.
///
/// `do_iteration` is deliberately not part of this trait: like the teacher
/// crate's `read_and_flush_backlog` (see `pg/message_stream.rs`), async
/// trait methods either require nightly or the `async-trait` crate, and the
/// latter boxes every call's future. `do_iteration` is instead an inherent
/// async method on `StreamTransport`.
pub trait TransportOps {
    /// Releases watches, closes the fd if still open, frees buffers.
    /// Idempotent on an already-disconnected transport.
    fn finalize(&mut self);

    /// Drives one I/O step in response to an observed readiness event.
    /// Returns `Err` only for a recoverable OOM; all other failure modes
    /// collapse into `disconnect` as §7 specifies.
    fn handle_watch(&mut self, watch: &Arc<Watch>) -> Result<()>;

    /// Idempotent. Releases watches, closes the fd, flips the disconnected
    /// flag.
    fn disconnect(&mut self);

    /// Installs the transport's watches into `connection`'s event loop,
    /// rolling back the first watch's install if the second fails (§4.5,
    /// §5 supplemented features).
    fn connection_set(&mut self, connection: Arc<dyn Connection>) -> Result<()>;

    /// Notifies the transport that the outbound queue went from empty to
    /// non-empty (or vice versa); triggers a write-watch recompute.
    fn messages_pending(&mut self);

    /// Notifies the transport that the inbound byte counter moved;
    /// triggers a read-watch recompute (backpressure, §4.6).
    fn live_messages_changed(&mut self, live_messages_size: u64);
}
