use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;

use tokio::sync::Notify;

/// The direction a [`Watch`] expresses interest in (§3, §4.3 C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// A handle naming one file descriptor and a desired readiness set.
///
/// The original spec models a watch as a passive registration carrying a
/// callback the event loop fires on readiness. Built on `tokio`, there is no
/// separate event loop to hand a callback to: the task driving the transport
/// already parks on `Socket::readable()`/`writable()` directly. `Watch`
/// instead becomes the thing `check_read_watch`/`check_write_watch` toggle
/// to express "I do/do not currently want readiness on this fd" (§4.3) — the
/// `enabled` flag is the single source of truth, and `Notify` wakes whatever
/// is parked waiting for it to flip back on, so a disabled-then-re-enabled
/// watch doesn't require the waiter to poll.
///
/// Refcounted via `Arc` rather than the teacher's `Ark<T: AtomicRefCounted>`:
/// at most two watches exist per transport and they're never on a hot path
/// that would benefit from the teacher's compact atomic-refcount layout (see
/// DESIGN.md, Open Question #1).
pub struct Watch {
    fd: RawFd,
    interest: Interest,
    enabled: AtomicBool,
    valid: AtomicBool,
    notify: Notify,
}

impl Watch {
    pub fn new(fd: RawFd, interest: Interest, initially_enabled: bool) -> Arc<Self> {
        Arc::new(Watch {
            fd,
            interest,
            enabled: AtomicBool::new(initially_enabled),
            valid: AtomicBool::new(true),
            notify: Notify::new(),
        })
    }

    /// The spec's `get_fd` operation (§4.3). Not called internally — this
    /// crate always goes through `StreamTransport::socket()` for I/O — but
    /// kept as part of `Watch`'s public contract for an embedder's event
    /// loop, which registers watches by fd and has no other way to learn it.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Relaxed)
    }

    /// Sets the enabled flag and wakes any task parked in `wait_for_enabled`.
    /// A no-op on an invalidated watch: a late toggle on a freed fd is
    /// harmless (§9 "Watch refcounting").
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_valid() {
            return;
        }
        self.enabled.store(enabled, Relaxed);
        if enabled {
            self.notify.notify_waiters();
        }
    }

    /// Clears the fd's liveness without freeing the `Watch` object: external
    /// holders (the connection's event loop) may still hold an `Arc` to it.
    pub fn invalidate(&self) {
        self.valid.store(false, Relaxed);
        self.enabled.store(false, Relaxed);
        self.notify.notify_waiters();
    }

    /// Resolves once `enabled` is true, or immediately if it already is.
    /// Used by `do_iteration`'s blocking wait to avoid polling a disabled
    /// direction.
    pub async fn wait_for_enabled(&self) {
        loop {
            if self.enabled() || !self.is_valid() {
                return;
            }
            let notified = self.notify.notified();
            if self.enabled() || !self.is_valid() {
                return;
            }
            notified.await;
        }
    }
}
