use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::auth::{AuthEngine, AuthState};
use crate::bus::common::{ByteBuffer, Error, Result};
use crate::bus::config::Settings;
use crate::bus::connection::{Connection, Loader, OutboundMessage};
use crate::bus::socket::Socket;
use crate::bus::transport::base::TransportOps;
use crate::bus::watch::{Interest, Watch};

enum ReadOutcome {
    Read(usize),
    WouldBlock,
    Eof,
}

fn classify_read(result: Result<usize>) -> Result<ReadOutcome> {
    match result {
        Ok(0) => Ok(ReadOutcome::Eof),
        Ok(n) => Ok(ReadOutcome::Read(n)),
        Err(e) if e.is_would_block() => Ok(ReadOutcome::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Readiness flags accepted by [`StreamTransport::do_iteration`] (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationFlags {
    pub read: bool,
    pub write: bool,
    pub block: bool,
}

/// The concrete transport over one full-duplex fd (§2 C6, §3 "Transport
/// (C5+C6)"). Owns the fd and its two watches, drives the auth engine and
/// the message framing pipeline, and performs bounded per-iteration I/O.
///
/// Per `SPEC_FULL.md` §2, ownership of a `StreamTransport` is exclusive to
/// whatever task is driving it — there is no outer connection mutex to
/// serialize calls the way the teacher's `Transport` assumes (its fields
/// are `Mutex`-guarded because a `Connections` registry may touch them
/// from other threads). That lets every method here take `&mut self`
/// instead of taking a lock on every field access.
pub struct StreamTransport {
    /// `None` once disconnected: dropping the socket here (rather than
    /// waiting for the whole `StreamTransport` to be dropped) is what
    /// actually closes the fd, matching §4.5 `disconnect`'s "closes fd" and
    /// §3 invariant 1 (`disconnected ⇒ fd == −1`).
    socket: Option<Socket>,
    read_watch: Option<Arc<Watch>>,
    write_watch: Option<Arc<Watch>>,
    connection: Option<Arc<dyn Connection>>,
    loader: Option<Box<dyn Loader>>,

    is_server: bool,
    disconnected: bool,
    authenticated: bool,

    send_credentials_pending: bool,
    receive_credentials_pending: bool,
    credentials_given: bool,

    auth: AuthEngine,

    live_messages_size: u64,
    max_live_messages_size: u64,

    current_message: Option<Arc<dyn OutboundMessage>>,
    message_bytes_written: usize,
    encoded_outgoing: ByteBuffer,
    encoded_incoming: ByteBuffer,

    max_bytes_read_per_iteration: usize,
    max_bytes_written_per_iteration: usize,

    address: String,
}

impl StreamTransport {
    pub fn new(
        socket: Socket,
        auth: AuthEngine,
        is_server: bool,
        address: String,
        settings: &Settings,
    ) -> Self {
        let is_unix = socket.is_unix();
        StreamTransport {
            socket: Some(socket),
            read_watch: None,
            write_watch: None,
            connection: None,
            loader: None,
            is_server,
            disconnected: false,
            authenticated: false,
            send_credentials_pending: is_unix,
            receive_credentials_pending: is_unix,
            credentials_given: false,
            auth,
            live_messages_size: 0,
            max_live_messages_size: settings.max_live_messages_size,
            current_message: None,
            message_bytes_written: 0,
            encoded_outgoing: ByteBuffer::new(),
            encoded_incoming: ByteBuffer::new(),
            max_bytes_read_per_iteration: settings.max_bytes_read_per_iteration,
            max_bytes_written_per_iteration: settings.max_bytes_written_per_iteration,
            address,
        }
    }

    pub fn set_loader(&mut self, loader: Box<dyn Loader>) {
        self.loader = Some(loader);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The live socket. Every call site is reachable only while
    /// `disconnected` is false, which is the only time `self.socket` is
    /// `Some` — so a `None` here is a programmer error (§7.6), not a
    /// runtime condition a caller can recover from.
    fn socket(&self) -> &Socket {
        self.socket.as_ref().expect("socket accessed after disconnect")
    }

    fn need_read_watch(&self) -> bool {
        if self.disconnected {
            return false;
        }
        if self.authenticated {
            self.live_messages_size < self.max_live_messages_size
        } else {
            self.receive_credentials_pending || self.auth.do_work_peek() == AuthState::WaitingForInput
        }
    }

    fn need_write_watch(&self) -> bool {
        if self.disconnected {
            return false;
        }
        if self.authenticated {
            self.current_message.is_some() || self.connection.as_ref().map_or(false, |c| c.have_messages_to_send())
        } else {
            self.send_credentials_pending || self.auth.do_work_peek() == AuthState::BytesToSend
        }
    }

    /// Recomputes the read watch's desired enabled state and toggles it via
    /// the connection if it changed (§4.6 "Watch recomputation").
    pub fn check_read_watch(&mut self) {
        let desired = self.need_read_watch();
        if let (Some(watch), Some(conn)) = (&self.read_watch, &self.connection) {
            if watch.enabled() != desired {
                conn.toggle_watch(watch, desired);
            }
        }
    }

    pub fn check_write_watch(&mut self) {
        let desired = self.need_write_watch();
        if let (Some(watch), Some(conn)) = (&self.write_watch, &self.connection) {
            if watch.enabled() != desired {
                conn.toggle_watch(watch, desired);
            }
        }
    }

    /// Sends/receives credentials on local sockets and, once both
    /// directions clear, informs the auth engine exactly once (§4.6 step 1,
    /// §5 supplemented-feature: attempted on every call, not just the
    /// first).
    fn exchange_credentials(&mut self, do_read: bool, do_write: bool) {
        if do_write && self.send_credentials_pending {
            match self.socket().try_write(&[0u8]) {
                Ok(1) => self.send_credentials_pending = false,
                Ok(_) => {}
                Err(e) if e.is_would_block() => {}
                Err(e) => {
                    warn!(error = %e, "failed to send credentials byte");
                    self.disconnect();
                    return;
                }
            }
        }

        if do_read && self.receive_credentials_pending {
            match self.socket().peer_credentials() {
                Ok(creds) => {
                    self.auth.set_credentials(creds);
                    self.receive_credentials_pending = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read peer credentials");
                    self.disconnect();
                    return;
                }
            }
        }

        if !self.send_credentials_pending && !self.receive_credentials_pending && !self.credentials_given {
            self.credentials_given = true;
        }
    }

    fn read_data_into_auth(&mut self) -> Result<bool> {
        let buf = match self.auth.get_buffer(self.max_bytes_read_per_iteration.min(2048)) {
            Ok(b) => b,
            Err(e) => return Err(e),
        };
        let outcome = classify_read(self.socket().try_read(buf))?;
        match outcome {
            ReadOutcome::Eof => {
                self.auth.return_buffer(0);
                info!("EOF reading from socket during authentication");
                self.disconnect();
                Ok(false)
            }
            ReadOutcome::WouldBlock => {
                self.auth.return_buffer(0);
                Ok(false)
            }
            ReadOutcome::Read(n) => {
                self.auth.return_buffer(n);
                Ok(true)
            }
        }
    }

    fn write_data_from_auth(&mut self) -> Result<bool> {
        let bytes = match self.auth.get_bytes_to_send() {
            Some(b) => b.to_vec(),
            None => return Ok(false),
        };
        match self.socket().try_write(&bytes) {
            Ok(n) => {
                self.auth.bytes_sent(n);
                Ok(true)
            }
            Err(e) if e.is_would_block() => Ok(false),
            Err(e) => {
                warn!(error = %e, "error writing auth bytes to remote app");
                self.disconnect();
                Ok(false)
            }
        }
    }

    /// Drives the handshake state machine until authenticated or no
    /// further progress is possible (§4.6 "Authentication drive").
    pub fn do_authentication(&mut self, do_read: bool, do_write: bool) -> Result<()> {
        let mut oom = false;

        while !self.authenticated && !self.disconnected {
            self.exchange_credentials(do_read, do_write);
            if self.disconnected {
                break;
            }
            if self.send_credentials_pending || self.receive_credentials_pending {
                debug!(
                    send_pending = self.send_credentials_pending,
                    receive_pending = self.receive_credentials_pending,
                    "waiting on credential exchange"
                );
                break;
            }

            match self.auth.do_work() {
                AuthState::WaitingForInput => {
                    if !do_read {
                        break;
                    }
                    match self.read_data_into_auth() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            debug_assert!(e.is_oom());
                            oom = true;
                            break;
                        }
                    }
                }
                AuthState::WaitingForMemory => {
                    oom = true;
                    break;
                }
                AuthState::BytesToSend => {
                    if !do_write {
                        break;
                    }
                    match self.write_data_from_auth() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            debug_assert!(e.is_oom());
                            oom = true;
                            break;
                        }
                    }
                }
                AuthState::NeedDisconnect => {
                    self.disconnect();
                    break;
                }
                AuthState::Authenticated => {
                    self.authenticated = true;
                    break;
                }
            }
        }

        self.check_read_watch();
        self.check_write_watch();

        if oom {
            Err(Error::low_mem())
        } else {
            Ok(())
        }
    }

    /// Drains the outbound queue subject to the write-budget and the write
    /// watch being enabled (§4.6 "Writing loop").
    pub fn do_writing(&mut self) -> Result<()> {
        if !self.authenticated || self.disconnected {
            return Ok(());
        }

        let mut written_this_iteration = 0usize;
        loop {
            if written_this_iteration >= self.max_bytes_written_per_iteration {
                break;
            }
            if !self.write_watch.as_ref().map_or(true, |w| w.enabled()) {
                break;
            }

            let message = match &self.current_message {
                Some(m) => m.clone(),
                None => match self.connection.as_ref().and_then(|c| c.get_message_to_send()) {
                    Some(m) => {
                        self.current_message = Some(m.clone());
                        m
                    }
                    None => break,
                },
            };

            let header_len = message.header().len();
            let body_len = message.body().len();
            let total_len = header_len + body_len;

            let write_result = if self.auth.needs_encoding() {
                if self.encoded_outgoing.is_empty() {
                    match self.auth.encode_data(message.header()) {
                        Ok(bytes) => {
                            if let Err(e) = self.encoded_outgoing.append_bytes(&bytes) {
                                self.encoded_outgoing.clear();
                                return Err(e);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                    match self.auth.encode_data(message.body()) {
                        Ok(bytes) => {
                            if let Err(e) = self.encoded_outgoing.append_bytes(&bytes) {
                                self.encoded_outgoing.clear();
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            self.encoded_outgoing.clear();
                            return Err(e);
                        }
                    }
                }
                let offset = self.message_bytes_written;
                self.socket().try_write(&self.encoded_outgoing.as_slice()[offset..])
            } else if self.message_bytes_written < header_len {
                self.socket().try_write_two(&message.header()[self.message_bytes_written..], message.body())
            } else {
                let offset = self.message_bytes_written - header_len;
                self.socket().try_write(&message.body()[offset..])
            };

            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    self.message_bytes_written += n;
                    written_this_iteration += n;
                }
                Err(e) if e.is_would_block() => break,
                Err(e) => {
                    warn!(error = %e, "error writing message to remote app");
                    self.disconnect();
                    break;
                }
            }

            if self.message_bytes_written >= total_len {
                self.message_bytes_written = 0;
                self.encoded_outgoing.clear();
                if let Some(conn) = &self.connection {
                    conn.message_sent(&message);
                }
                self.current_message = None;
            }
        }

        self.check_write_watch();
        Ok(())
    }

    /// Reads from the socket into the loader, draining until `EAGAIN` or
    /// the read budget is exhausted (§4.6 "Reading loop").
    pub fn do_reading(&mut self) -> Result<()> {
        if !self.authenticated {
            return Ok(());
        }

        let mut read_this_iteration = 0usize;
        loop {
            self.check_read_watch();

            if read_this_iteration >= self.max_bytes_read_per_iteration {
                break;
            }
            if self.disconnected || !self.read_watch.as_ref().map_or(false, |w| w.enabled()) {
                break;
            }
            if self.loader.is_none() {
                break;
            }

            let mut should_disconnect = false;
            let mut n_appended = 0usize;

            if self.auth.needs_decoding() {
                if self.encoded_incoming.is_empty() {
                    let chunk = self.max_bytes_read_per_iteration.min(2048);
                    let buf = self.encoded_incoming.borrow_tail(chunk)?;
                    let outcome = classify_read(self.socket().try_read(buf))?;
                    match outcome {
                        ReadOutcome::Eof => {
                            self.encoded_incoming.return_tail(0);
                            should_disconnect = true;
                        }
                        ReadOutcome::WouldBlock => {
                            self.encoded_incoming.return_tail(0);
                            break;
                        }
                        ReadOutcome::Read(n) => {
                            self.encoded_incoming.return_tail(n);
                        }
                    }
                }
                if !should_disconnect {
                    let decoded = self.auth.decode_data(self.encoded_incoming.as_slice())?;
                    let loader = self.loader.as_mut().unwrap();
                    let dst = loader.get_buffer(decoded.len())?;
                    dst[..decoded.len()].copy_from_slice(&decoded);
                    loader.return_buffer(decoded.len());
                    n_appended = decoded.len();
                    self.encoded_incoming.clear();
                }
            } else {
                let chunk = self.max_bytes_read_per_iteration.min(2048);
                let loader = self.loader.as_mut().unwrap();
                let buf = loader.get_buffer(chunk)?;
                let outcome = classify_read(self.socket().try_read(buf))?;
                match outcome {
                    ReadOutcome::Eof => {
                        loader.return_buffer(0);
                        should_disconnect = true;
                    }
                    ReadOutcome::WouldBlock => {
                        loader.return_buffer(0);
                        break;
                    }
                    ReadOutcome::Read(n) => {
                        loader.return_buffer(n);
                        n_appended = n;
                    }
                }
            }

            if should_disconnect {
                info!("EOF reading from socket (remote end is closed)");
                self.disconnect();
                break;
            }

            read_this_iteration += n_appended;

            if let Some(loader) = self.loader.as_mut() {
                loader.queue_messages()?;
            }
        }

        Ok(())
    }

    /// One synchronous pass: waits (optionally blocking up to
    /// `timeout_ms`) for the requested readiness, then drives
    /// authentication and the requested reading/writing (§4.6
    /// "Iteration (synchronous)").
    pub async fn do_iteration(&mut self, flags: IterationFlags, timeout_ms: i64) -> Result<()> {
        let want_read = flags.read || !self.authenticated && self.need_read_watch();
        let want_write = flags.write || !self.authenticated && self.need_write_watch();

        if flags.block && !want_read && !want_write {
            return Ok(());
        }

        if flags.block {
            loop {
                let wait = async {
                    if want_read {
                        if let Some(w) = &self.read_watch {
                            w.wait_for_enabled().await;
                        }
                        self.socket().readable().await?;
                    }
                    if want_write {
                        if let Some(w) = &self.write_watch {
                            w.wait_for_enabled().await;
                        }
                        self.socket().writable().await?;
                    }
                    Ok::<(), Error>(())
                };

                let timed = if timeout_ms < 0 {
                    wait.await.map(Some)
                } else {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), wait).await {
                        Ok(r) => r.map(Some),
                        Err(_) => Ok(None),
                    }
                };

                match timed {
                    Ok(_) => break,
                    Err(e) if e.is_would_block() => continue,
                    Err(e) => {
                        warn!(error = %e, "poll error during do_iteration");
                        self.disconnect();
                        return Ok(());
                    }
                }
            }
        }

        if !self.authenticated {
            self.do_authentication(want_read, want_write)?;
        }
        if flags.read {
            self.do_reading()?;
        }
        if flags.write {
            self.do_writing()?;
        }
        Ok(())
    }
}

impl TransportOps for StreamTransport {
    fn finalize(&mut self) {
        if !self.disconnected {
            self.disconnect();
        }
        self.connection = None;
        self.loader = None;
        self.encoded_outgoing.clear();
        self.encoded_incoming.clear();
    }

    fn handle_watch(&mut self, watch: &Arc<Watch>) -> Result<()> {
        if self.disconnected {
            return Ok(());
        }

        let is_read = self
            .read_watch
            .as_ref()
            .map_or(false, |w| Arc::ptr_eq(w, watch));
        let is_write = self
            .write_watch
            .as_ref()
            .map_or(false, |w| Arc::ptr_eq(w, watch));

        if !is_read && !is_write {
            debug_assert!(false, "handle_watch called with a watch this transport does not own");
            return Ok(());
        }

        if matches!(watch.interest(), Interest::Readable) && is_read {
            if !self.authenticated {
                self.do_authentication(true, false)?;
            }
            if self.authenticated {
                self.do_reading()?;
            }
        }

        if matches!(watch.interest(), Interest::Writable) && is_write {
            if !self.authenticated {
                self.do_authentication(false, true)?;
            }
            if self.authenticated {
                self.do_writing()?;
            }
        }

        Ok(())
    }

    fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        debug!(address = %self.address, "disconnecting transport");

        if let Some(conn) = self.connection.clone() {
            if let Some(w) = self.read_watch.take() {
                conn.remove_watch(&w);
                w.invalidate();
            }
            if let Some(w) = self.write_watch.take() {
                conn.remove_watch(&w);
                w.invalidate();
            }
        } else {
            if let Some(w) = self.read_watch.take() {
                w.invalidate();
            }
            if let Some(w) = self.write_watch.take() {
                w.invalidate();
            }
        }

        // Dropping the socket here, not at struct teardown, is what closes
        // the fd: §4.5 disconnect ("closes fd ... sets fd = -1") and §3
        // invariant 1 (`disconnected ⇒ fd == −1`).
        self.socket = None;
        self.disconnected = true;
    }

    fn connection_set(&mut self, connection: Arc<dyn Connection>) -> Result<()> {
        let fd = self.socket().raw_fd();
        let read_watch = Watch::new(fd, Interest::Readable, self.need_read_watch());
        let write_watch = Watch::new(fd, Interest::Writable, self.need_write_watch());

        if let Err(e) = connection.add_watch(read_watch.clone()) {
            return Err(e);
        }
        if let Err(e) = connection.add_watch(write_watch.clone()) {
            connection.remove_watch(&read_watch);
            read_watch.invalidate();
            return Err(e);
        }

        self.read_watch = Some(read_watch);
        self.write_watch = Some(write_watch);
        self.connection = Some(connection);
        self.check_read_watch();
        self.check_write_watch();
        Ok(())
    }

    fn messages_pending(&mut self) {
        self.check_write_watch();
    }

    fn live_messages_changed(&mut self, live_messages_size: u64) {
        self.live_messages_size = live_messages_size;
        self.check_read_watch();
    }
}
