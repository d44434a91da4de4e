use crate::bus::common::Result;
use crate::bus::socket::PeerCredentials;

/// Outcome of feeding one more line of input to a [`Mechanism`] (§4.4 C4).
pub enum MechanismStep {
    /// The mechanism needs more input before it can proceed.
    NeedInput,
    /// Send `.0` back to the peer, then continue driving the mechanism.
    Reply(Vec<u8>),
    /// The mechanism accepts the peer; authentication succeeds.
    Accepted,
    /// The mechanism rejects the peer; the auth engine refuses and the
    /// transport disconnects.
    Rejected,
}

/// A concrete SASL-style authentication mechanism.
///
/// `AuthEngine` (the C4 state machine) is mechanism-agnostic: it owns the
/// buffering and state transitions, and delegates the actual
/// accept/reject decision for one negotiation round to a `Mechanism`. This
/// is the trait seam `SPEC_FULL.md` §4 reserves for `DBUS_COOKIE_SHA1` —
/// the SHA-1 helper it would need is out of scope (spec.md §1), so no
/// type implementing that mechanism ships here, but anything implementing
/// this trait plugs into the same engine `EXTERNAL` and `ANONYMOUS` use.
pub trait Mechanism: Send + Sync {
    /// The mechanism name as it appears on the wire (e.g. `b"EXTERNAL"`).
    fn name(&self) -> &'static str;

    /// Processes one line of input sent by the peer during negotiation
    /// (the initial response, or a subsequent `DATA` line). `credentials`
    /// is whatever the transport obtained out-of-band (e.g. `SO_PEERCRED`);
    /// mechanisms that don't need it may ignore it.
    fn feed(&mut self, input: &[u8], credentials: Option<&PeerCredentials>) -> Result<MechanismStep>;
}

/// Authenticates the peer using only its already-exchanged unix socket
/// credentials (`SO_PEERCRED`/`SCM_CREDENTIALS`), never asking it to prove
/// anything over the wire beyond naming its uid as hex. This is the
/// dominant mechanism for same-host D-Bus-style transports.
pub struct ExternalMechanism {
    authorized_uids: Option<Vec<u32>>,
}

impl ExternalMechanism {
    /// `authorized_uids = None` accepts any peer the kernel vouches for;
    /// `Some(uids)` restricts acceptance to that allowlist.
    pub fn new(authorized_uids: Option<Vec<u32>>) -> Self {
        ExternalMechanism { authorized_uids }
    }
}

impl Mechanism for ExternalMechanism {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn feed(&mut self, input: &[u8], credentials: Option<&PeerCredentials>) -> Result<MechanismStep> {
        let creds = match credentials {
            Some(c) => c,
            None => return Ok(MechanismStep::Rejected),
        };

        // An EXTERNAL initial response is either empty or the peer's uid
        // hex-encoded; either way the kernel-supplied credentials are the
        // authority, so we only sanity-check the claim if one was made.
        if !input.is_empty() {
            let claimed = hex::decode(input).map_err(|_| crate::bus::common::Error::auth_refused("malformed EXTERNAL response"))?;
            let claimed_str = std::str::from_utf8(&claimed)?;
            let claimed_uid: u32 = claimed_str
                .parse()
                .map_err(|_| crate::bus::common::Error::auth_refused("non-numeric uid in EXTERNAL response"))?;
            if claimed_uid != creds.uid {
                return Ok(MechanismStep::Rejected);
            }
        }

        if let Some(allowed) = &self.authorized_uids {
            if !allowed.contains(&creds.uid) {
                return Ok(MechanismStep::Rejected);
            }
        }

        Ok(MechanismStep::Accepted)
    }
}

/// Accepts any peer unconditionally. Useful for loopback transports and
/// tests; matches the D-Bus `ANONYMOUS` mechanism's contract.
#[derive(Default)]
pub struct AnonymousMechanism;

impl Mechanism for AnonymousMechanism {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn feed(&mut self, _input: &[u8], _credentials: Option<&PeerCredentials>) -> Result<MechanismStep> {
        Ok(MechanismStep::Accepted)
    }
}
