use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::auth::{AnonymousMechanism, AuthEngine};
use crate::bus::common::Result;
use crate::bus::config::Settings;
use crate::bus::connection::{Loader, LoopbackConnection, VecLoader};
use crate::bus::socket::Socket;
use crate::bus::transport::{StreamTransport, TransportOps};

/// Adapts a `VecLoader` behind an `Arc<Mutex<_>>` so a test can keep
/// inspecting it after it's been handed to the transport as a boxed
/// `dyn Loader`. `get_buffer`'s borrowed slice can't outlive the mutex
/// guard, so reads stage into a local `Vec` and only touch the shared
/// loader in `return_buffer`/`queue_messages`.
pub struct SharedLoader {
    inner: Arc<Mutex<VecLoader>>,
    staging: Vec<u8>,
}

impl SharedLoader {
    pub fn new(inner: Arc<Mutex<VecLoader>>) -> Self {
        SharedLoader { inner, staging: Vec::new() }
    }
}

impl Loader for SharedLoader {
    fn get_buffer(&mut self, min_bytes: usize) -> Result<&mut [u8]> {
        let len = min_bytes.max(4096);
        self.staging.clear();
        self.staging.resize(len, 0);
        Ok(&mut self.staging[..])
    }

    fn return_buffer(&mut self, n: usize) {
        let bytes = self.staging[..n].to_vec();
        self.inner.lock().unwrap().append(&bytes).expect("test loader append");
    }

    fn queue_messages(&mut self) -> Result<()> {
        self.inner.lock().unwrap().queue_messages()
    }
}

/// Wires up one end of a loopback unix socket pair as a `StreamTransport`
/// with the `ANONYMOUS` mechanism, a `LoopbackConnection`, and a
/// `SharedLoader` — the worked example `SPEC_FULL.md` §6 describes.
pub fn harness(
    socket: Socket,
    is_server: bool,
    settings: &Settings,
) -> (StreamTransport, Arc<LoopbackConnection>, Arc<Mutex<VecLoader>>) {
    let mechanism = Box::new(AnonymousMechanism::default());
    let auth = if is_server {
        AuthEngine::new_server(mechanism, true)
    } else {
        AuthEngine::new_client(mechanism, true)
    };
    let mut transport = StreamTransport::new(socket, auth, is_server, "unix:pair".to_string(), settings);
    let loader = Arc::new(Mutex::new(VecLoader::new()));
    transport.set_loader(Box::new(SharedLoader::new(loader.clone())));
    let conn: Arc<LoopbackConnection> = Arc::new(LoopbackConnection::new());
    transport.connection_set(conn.clone()).unwrap();
    (transport, conn, loader)
}

/// Drives both ends' authentication and I/O loops in lockstep until a
/// predicate is satisfied or a generous iteration budget is exhausted, so
/// tests don't depend on exact readiness timing of the underlying OS pair.
pub async fn drive_until(
    client: &mut StreamTransport,
    server: &mut StreamTransport,
    mut done: impl FnMut(&StreamTransport, &StreamTransport) -> bool,
) {
    for _ in 0..200 {
        if done(client, server) {
            return;
        }
        if !client.is_authenticated() {
            client.do_authentication(true, true).unwrap();
        } else {
            client.do_reading().unwrap();
            client.do_writing().unwrap();
        }
        if !server.is_authenticated() {
            server.do_authentication(true, true).unwrap();
        } else {
            server.do_reading().unwrap();
            server.do_writing().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("drive_until exceeded its iteration budget");
}
