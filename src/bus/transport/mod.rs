mod address;
mod base;
mod stream;

pub use self::address::{parse_address, Address};
pub use self::base::TransportOps;
pub use self::stream::{IterationFlags, StreamTransport};

use crate::bus::auth::{AnonymousMechanism, AuthEngine, ExternalMechanism, Mechanism};
use crate::bus::common::Result;
use crate::bus::config::Settings;
use crate::bus::socket::Socket;

/// Opens a client-side transport to `address`, following the decoded form
/// (§6 "Addresses"). Sets the socket non-blocking and close-on-exec (done
/// by the underlying `tokio::net` constructors / the abstract-socket path
/// in `Socket::connect_unix_abstract`) before wrapping it in a
/// [`StreamTransport`] (§2 C7 "Transport constructors").
///
/// `mechanism` picks the auth mechanism the client offers; `None` defaults
/// to `EXTERNAL` for unix-domain addresses (the dominant same-host
/// mechanism) and `ANONYMOUS` for TCP (which has no peer credentials to
/// offer).
pub async fn connect(address: &str, settings: &Settings, mechanism: Option<Box<dyn Mechanism>>) -> Result<StreamTransport> {
    let parsed = parse_address(address)?;
    let (socket, default_is_unix) = match &parsed {
        Address::UnixPath(path) => (Socket::connect_unix(path).await?, true),
        Address::UnixAbstract(name) => (Socket::connect_unix_abstract(name).await?, true),
        Address::Tcp { host, port } => (Socket::connect_tcp(&format!("{}:{}", host, port)).await?, false),
    };

    let mechanism = mechanism.unwrap_or_else(|| {
        if default_is_unix {
            Box::new(ExternalMechanism::new(None))
        } else {
            Box::new(AnonymousMechanism::default())
        }
    });

    let auth = AuthEngine::new_client(mechanism, default_is_unix);
    Ok(StreamTransport::new(socket, auth, false, address.to_string(), settings))
}

/// Wraps an already-accepted unix-domain stream as a server-side
/// transport. The accept loop itself (binding a listener, calling
/// `accept()` in a loop) is the enclosing daemon's concern, out of scope
/// per spec.md §1 ("multi-peer routing (a daemon)") — this function is
/// the C7 constructor for the one connection just accepted.
pub fn from_accepted_unix(
    stream: tokio::net::UnixStream,
    address: String,
    settings: &Settings,
    mechanism: Option<Box<dyn Mechanism>>,
) -> StreamTransport {
    let mechanism = mechanism.unwrap_or_else(|| Box::new(ExternalMechanism::new(None)));
    let auth = AuthEngine::new_server(mechanism, true);
    StreamTransport::new(Socket::Unix(stream), auth, true, address, settings)
}

/// Wraps an already-accepted TCP stream as a server-side transport. TCP
/// has no peer-credential channel, so the default mechanism is
/// `ANONYMOUS` unless the caller supplies one of its own (e.g. a
/// `DBUS_COOKIE_SHA1`-style mechanism, left as an extension point per
/// `SPEC_FULL.md` §4 C4).
pub fn from_accepted_tcp(
    stream: tokio::net::TcpStream,
    address: String,
    settings: &Settings,
    mechanism: Option<Box<dyn Mechanism>>,
) -> StreamTransport {
    let mechanism = mechanism.unwrap_or_else(|| Box::new(AnonymousMechanism::default()));
    let auth = AuthEngine::new_server(mechanism, false);
    StreamTransport::new(Socket::Tcp(stream), auth, true, address, settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_malformed_address_before_touching_a_socket() {
        let settings = Settings::default();
        let result = tokio_test_block_on(connect("not-an-address", &settings, None));
        assert!(result.is_err());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }
}
