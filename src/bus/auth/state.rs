use tracing::{debug, warn};

use crate::bus::auth::mechanism::{Mechanism, MechanismStep};
use crate::bus::common::{ByteBuffer, Error, Result};
use crate::bus::socket::PeerCredentials;

/// The auth engine's current state (§3, §4.4 C4), returned by `do_work` and
/// acted on by `StreamTransport::do_authentication`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    WaitingForInput,
    WaitingForMemory,
    BytesToSend,
    NeedDisconnect,
    Authenticated,
}

/// Line-oriented pre-message handshake, driven by the transport feeding it
/// bytes read from the socket and draining bytes it wants written. Owns its
/// own input/output buffers; the transport never parses the handshake lines
/// itself (§4.4: "the transport treats the auth engine as opaque").
///
/// Only a single negotiation round with one mechanism is modeled — real
/// SASL auth in D-Bus lets the client try several mechanisms in sequence;
/// this engine is handed the one mechanism the server is configured to
/// accept (EXTERNAL in the common case) and either authenticates or
/// refuses, which is sufficient for the transport-level contract this
/// crate implements.
pub struct AuthEngine {
    mechanism: Box<dyn Mechanism>,
    incoming: ByteBuffer,
    outgoing: ByteBuffer,
    outgoing_sent: usize,
    credentials: Option<PeerCredentials>,
    state: AuthState,
    is_server: bool,
    needs_encoding: bool,
    needs_decoding: bool,
    /// The transport's credential exchange writes one literal NUL byte onto
    /// the wire ahead of the handshake lines (mirroring
    /// `_dbus_send_credentials_unix_socket`); the peer's engine must
    /// discard that one byte, exactly once, before it starts looking for
    /// `\r\n`-terminated lines. `false` until that byte has been seen and
    /// dropped.
    leading_credential_byte_consumed: bool,
}

impl AuthEngine {
    /// `expect_credential_byte` should be `true` for local-socket transports
    /// (matching `StreamTransport`'s `is_unix`, which is exactly when it
    /// sets `send_credentials_pending`/`receive_credentials_pending`):
    /// those transports each write one literal NUL byte onto the wire
    /// during credential exchange, which this peer's engine must discard
    /// before parsing the first handshake line. TCP transports never send
    /// that byte, so there is nothing to skip.
    pub fn new_server(mechanism: Box<dyn Mechanism>, expect_credential_byte: bool) -> Self {
        AuthEngine {
            mechanism,
            incoming: ByteBuffer::new(),
            outgoing: ByteBuffer::new(),
            outgoing_sent: 0,
            credentials: None,
            state: AuthState::WaitingForInput,
            is_server: true,
            needs_encoding: false,
            needs_decoding: false,
            leading_credential_byte_consumed: !expect_credential_byte,
        }
    }

    pub fn new_client(mechanism: Box<dyn Mechanism>, expect_credential_byte: bool) -> Self {
        let mut outgoing = ByteBuffer::new();
        let line = format!("AUTH {}\r\n", mechanism.name());
        // A fresh client engine has nothing buffered to fail on; panicking
        // here would require an allocation failure on a handful of bytes.
        outgoing.append_bytes(line.as_bytes()).expect("initial AUTH line allocation");
        AuthEngine {
            mechanism,
            incoming: ByteBuffer::new(),
            outgoing,
            outgoing_sent: 0,
            credentials: None,
            state: AuthState::BytesToSend,
            is_server: false,
            needs_encoding: false,
            needs_decoding: false,
            leading_credential_byte_consumed: !expect_credential_byte,
        }
    }

    /// Lends the tail of the input buffer for the transport to read bytes
    /// from the socket into (§4.4 `get_buffer`).
    pub fn get_buffer(&mut self, min_bytes: usize) -> Result<&mut [u8]> {
        self.incoming.borrow_tail(min_bytes)
    }

    /// Commits `n` bytes appended by the transport's last `get_buffer`
    /// borrow (§4.4 `return_buffer`).
    pub fn return_buffer(&mut self, n: usize) {
        self.incoming.return_tail(n);
    }

    /// The remaining unsent bytes of the outgoing buffer, or `None` if
    /// there is nothing left to send (§4.4 `get_bytes_to_send`).
    pub fn get_bytes_to_send(&self) -> Option<&[u8]> {
        let slice = &self.outgoing.as_slice()[self.outgoing_sent..];
        if slice.is_empty() {
            None
        } else {
            Some(slice)
        }
    }

    /// Advances the sent cursor by `n` bytes (§4.4 `bytes_sent`).
    pub fn bytes_sent(&mut self, n: usize) {
        self.outgoing_sent += n;
        if self.outgoing_sent >= self.outgoing.len() {
            self.outgoing.clear();
            self.outgoing_sent = 0;
        }
    }

    pub fn set_credentials(&mut self, creds: PeerCredentials) {
        self.credentials = Some(creds);
    }

    pub fn needs_encoding(&self) -> bool {
        self.needs_encoding
    }

    pub fn needs_decoding(&self) -> bool {
        self.needs_decoding
    }

    /// The state as of the last call to `do_work`, without driving any
    /// further progress. Used by `check_read_watch`/`check_write_watch` to
    /// decide what readiness is currently wanted; unlike `do_work`, this
    /// never consumes buffered input or produces new output, so it is safe
    /// to call as often as a watch recompute needs to.
    pub fn do_work_peek(&self) -> AuthState {
        self.state
    }

    /// Identity transform: neither EXTERNAL nor ANONYMOUS wraps the
    /// post-auth byte stream in a cipher, so this is never reached while
    /// `needs_encoding` is false; kept for the trait-level contract §4.4
    /// describes and as the extension point for a future mechanism that
    /// does negotiate one.
    pub fn encode_data(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve(src.len()).map_err(|_| Error::low_mem())?;
        out.extend_from_slice(src);
        Ok(out)
    }

    pub fn decode_data(&self, src: &[u8]) -> Result<Vec<u8>> {
        self.encode_data(src)
    }

    /// Drives the handshake using whatever input is currently buffered.
    /// Idempotent when no progress is possible: called again with nothing
    /// new in `incoming`, it returns the same state (§4.4 `do_work`).
    pub fn do_work(&mut self) -> AuthState {
        if self.state == AuthState::Authenticated || self.state == AuthState::NeedDisconnect {
            return self.state;
        }

        if !self.leading_credential_byte_consumed {
            if self.incoming.is_empty() {
                self.state = AuthState::WaitingForInput;
                return self.state;
            }
            let rest = self.incoming.as_slice()[1..].to_vec();
            self.incoming.clear();
            // The remainder is never larger than what was already held, so
            // this re-append cannot fail for lack of memory.
            self.incoming.append_bytes(&rest).expect("re-appending buffered remainder after credential byte");
            self.leading_credential_byte_consumed = true;
        }

        if self.is_server {
            self.do_work_server();
        } else {
            self.do_work_client();
        }
        self.state
    }

    fn do_work_server(&mut self) {
        loop {
            let line = match take_line(&mut self.incoming) {
                Some(l) => l,
                None => {
                    self.state = AuthState::WaitingForInput;
                    return;
                }
            };

            let response = parse_auth_line(&line, self.mechanism.name());
            let response = match response {
                Some(r) => r,
                None => {
                    warn!(?line, "malformed or mismatched AUTH line");
                    self.state = AuthState::NeedDisconnect;
                    return;
                }
            };

            let step = match self.mechanism.feed(&response, self.credentials.as_ref()) {
                Ok(s) => s,
                Err(e) if e.is_oom() => {
                    self.state = AuthState::WaitingForMemory;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "mechanism rejected peer");
                    self.state = AuthState::NeedDisconnect;
                    return;
                }
            };

            match step {
                MechanismStep::NeedInput => {
                    self.state = AuthState::WaitingForInput;
                    return;
                }
                MechanismStep::Reply(bytes) => {
                    if let Err(e) = self.queue_outgoing(&bytes) {
                        debug_assert!(e.is_oom());
                        self.state = AuthState::WaitingForMemory;
                        return;
                    }
                    self.state = AuthState::BytesToSend;
                    return;
                }
                MechanismStep::Accepted => {
                    if let Err(e) = self.queue_outgoing(b"OK\r\n") {
                        debug_assert!(e.is_oom());
                        self.state = AuthState::WaitingForMemory;
                        return;
                    }
                    debug!(mechanism = self.mechanism.name(), "peer authenticated");
                    self.state = AuthState::Authenticated;
                    return;
                }
                MechanismStep::Rejected => {
                    let _ = self.queue_outgoing(b"REJECTED\r\n");
                    self.state = AuthState::NeedDisconnect;
                    return;
                }
            }
        }
    }

    fn do_work_client(&mut self) {
        if self.get_bytes_to_send().is_some() {
            self.state = AuthState::BytesToSend;
            return;
        }

        let line = match take_line(&mut self.incoming) {
            Some(l) => l,
            None => {
                self.state = AuthState::WaitingForInput;
                return;
            }
        };

        if line.starts_with(b"OK") {
            debug!("server accepted authentication");
            self.state = AuthState::Authenticated;
        } else {
            warn!(?line, "server rejected authentication");
            self.state = AuthState::NeedDisconnect;
        }
    }

    fn queue_outgoing(&mut self, bytes: &[u8]) -> Result<()> {
        self.outgoing.append_bytes(bytes)
    }
}

/// Pulls one `\r\n`-terminated line out of `buf`, leaving any remainder in
/// place. Returns `None` if no full line has arrived yet.
fn take_line(buf: &mut ByteBuffer) -> Option<Vec<u8>> {
    let data = buf.as_slice();
    let pos = data.windows(2).position(|w| w == b"\r\n")?;
    let line = data[..pos].to_vec();
    let rest = data[pos + 2..].to_vec();
    buf.clear();
    // append_bytes on a fresh, empty ByteBuffer cannot legitimately fail
    // here for any input smaller than what was already held a moment ago.
    buf.append_bytes(&rest).expect("re-appending buffered remainder");
    Some(line)
}

/// Parses a line of the form `AUTH <mechanism> <hex-response>` (or bare
/// `AUTH <mechanism>` with an empty response), returning the decoded
/// response bytes if the mechanism name matches.
fn parse_auth_line(line: &[u8], expected_mechanism: &str) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_ascii_whitespace();
    if parts.next()? != "AUTH" {
        return None;
    }
    if parts.next()? != expected_mechanism {
        return None;
    }
    match parts.next() {
        Some(hex_response) => hex::decode(hex_response).ok(),
        None => Some(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::auth::mechanism::AnonymousMechanism;

    #[test]
    fn server_authenticates_anonymous_peer() {
        let mut engine = AuthEngine::new_server(Box::new(AnonymousMechanism::default()), false);
        assert_eq!(engine.do_work(), AuthState::WaitingForInput);

        let buf = engine.get_buffer(32).unwrap();
        let line = b"AUTH ANONYMOUS\r\n";
        buf[..line.len()].copy_from_slice(line);
        engine.return_buffer(line.len());

        assert_eq!(engine.do_work(), AuthState::Authenticated);
        assert_eq!(engine.get_bytes_to_send(), Some(&b"OK\r\n"[..]));
        engine.bytes_sent(4);
        assert_eq!(engine.get_bytes_to_send(), None);
    }

    #[test]
    fn server_rejects_malformed_auth_line() {
        let mut engine = AuthEngine::new_server(Box::new(AnonymousMechanism::default()), false);
        let buf = engine.get_buffer(16).unwrap();
        let line = b"NOTAUTH\r\n";
        buf[..line.len()].copy_from_slice(line);
        engine.return_buffer(line.len());
        assert_eq!(engine.do_work(), AuthState::NeedDisconnect);
    }

    #[test]
    fn do_work_is_idempotent_with_no_new_input() {
        let mut engine = AuthEngine::new_server(Box::new(AnonymousMechanism::default()), false);
        assert_eq!(engine.do_work(), AuthState::WaitingForInput);
        assert_eq!(engine.do_work(), AuthState::WaitingForInput);
    }

    #[test]
    fn client_sends_initial_auth_line_for_its_mechanism() {
        let engine = AuthEngine::new_client(Box::new(AnonymousMechanism::default()), false);
        assert_eq!(engine.get_bytes_to_send(), Some(&b"AUTH ANONYMOUS\r\n"[..]));
    }

    #[test]
    fn client_reaches_authenticated_on_ok_line() {
        let mut engine = AuthEngine::new_client(Box::new(AnonymousMechanism::default()), false);
        engine.bytes_sent(engine.outgoing.len());
        let buf = engine.get_buffer(16).unwrap();
        let line = b"OK\r\n";
        buf[..line.len()].copy_from_slice(line);
        engine.return_buffer(line.len());
        assert_eq!(engine.do_work(), AuthState::Authenticated);
    }
}
