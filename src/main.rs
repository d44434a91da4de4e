use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tracing::{info, info_span, warn, Level};
use tracing_subscriber::FmtSubscriber;

use linkbus::config::load_config;
use linkbus::connection::{LoopbackConnection, VecLoader};
use linkbus::transport::{from_accepted_tcp, from_accepted_unix, IterationFlags, StreamTransport, TransportOps};

/// Minimal listener binary demonstrating the transport core end to end:
/// accept connections, authenticate them, and drive their I/O loops to
/// completion. There is no message dispatch here — wiring accepted
/// transports to a real `Connection`/`Loader` pair that does something with
/// the decoded bytes is the embedder's job (spec.md §1 non-goal).
fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let _span = info_span!("startup").entered();

    let settings = load_config("linkbus.yaml").expect("could not load config");

    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("could not create tokio runtime");

    tokio_rt.block_on(async move {
        let unix_path = std::env::var("LINKBUS_UNIX_PATH").unwrap_or_else(|_| "/tmp/linkbus.sock".to_string());
        let tcp_addr = std::env::var("LINKBUS_TCP_ADDR").ok();

        let mut handles = Vec::new();

        let _ = std::fs::remove_file(&unix_path);
        match UnixListener::bind(&unix_path) {
            Ok(listener) => {
                info!(path = %unix_path, "listening on unix socket");
                handles.push(tokio::spawn(accept_unix_loop(listener, unix_path.clone(), settings)));
            }
            Err(e) => warn!(%e, path = %unix_path, "could not bind unix listener"),
        }

        if let Some(addr) = tcp_addr {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(%addr, "listening on tcp socket");
                    handles.push(tokio::spawn(accept_tcp_loop(listener, addr, settings)));
                }
                Err(e) => warn!(%e, %addr, "could not bind tcp listener"),
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
    });
}

async fn accept_unix_loop(listener: UnixListener, address: String, settings: &'static linkbus::config::Settings) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%e, "accept error on unix listener");
                continue;
            }
        };
        let transport = from_accepted_unix(stream, address.clone(), settings, None);
        tokio::spawn(run_transport(transport));
    }
}

async fn accept_tcp_loop(listener: TcpListener, address: String, settings: &'static linkbus::config::Settings) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%e, "accept error on tcp listener");
                continue;
            }
        };
        info!(%remote, "accepted tcp connection");
        let transport = from_accepted_tcp(stream, address.clone(), settings, None);
        tokio::spawn(run_transport(transport));
    }
}

async fn run_transport(mut transport: StreamTransport) {
    let conn: Arc<LoopbackConnection> = Arc::new(LoopbackConnection::new());
    if let Err(e) = transport.connection_set(conn) {
        warn!(%e, "failed to register watches for accepted transport");
        return;
    }
    transport.set_loader(Box::new(VecLoader::new()));

    let flags = IterationFlags { read: true, write: true, block: true };
    while !transport.is_disconnected() {
        if let Err(e) = transport.do_iteration(flags, 30_000).await {
            warn!(%e, "transport iteration failed");
            break;
        }
    }
    transport.finalize();
}
