use std::sync::Arc;

use tokio::net::UnixStream;

use crate::bus::config::Settings;
use crate::bus::connection::{OutboundMessage, OwnedMessage};
use crate::bus::socket::Socket;
use crate::bus::watch::Interest;
use crate::tests::common::{drive_until, harness};

/// §8 scenario 3: the read watch goes disabled once the live-message byte
/// counter reaches the ceiling, and re-enables once it drops back down.
#[tokio::test]
async fn backpressure_disables_and_reenables_the_read_watch() {
    let mut settings = Settings::default();
    settings.max_live_messages_size = 4096;

    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, _client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, server_conn, _server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    let read_watch = server_conn.watch(Interest::Readable).expect("server installed a read watch");
    assert!(read_watch.enabled(), "read watch should start enabled once authenticated with no backlog");

    server.live_messages_changed(4000);
    assert!(read_watch.enabled(), "4000 < 4096 ceiling: still enabled");

    server.live_messages_changed(4096);
    assert!(!read_watch.enabled(), "4096 is not < the 4096 ceiling: must disable");

    server.live_messages_changed(0);
    assert!(read_watch.enabled(), "draining the backlog re-enables the read watch");
}

/// §8 scenario 4: a peer that sends a partial message and then closes
/// leaves nothing in the loader and flips the reader to disconnected.
#[tokio::test]
async fn peer_eof_mid_message_disconnects_without_delivering_a_partial_message() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    server_loader.lock().unwrap().expect_message(500);

    let message: Arc<dyn OutboundMessage> =
        Arc::new(OwnedMessage { header: vec![], body: vec![7u8; 200] });
    client_conn.enqueue(message);
    client.messages_pending();

    for _ in 0..50 {
        client.do_writing().unwrap();
        server.do_reading().unwrap();
        if client_conn.sent_count() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert_eq!(client_conn.sent_count(), 1, "the 200-byte message must have reached the wire");

    client.disconnect();

    for _ in 0..50 {
        server.do_reading().unwrap();
        if server.is_disconnected() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    assert!(server.is_disconnected(), "peer EOF mid-message must disconnect the reader");
    assert!(
        server_loader.lock().unwrap().completed.is_empty(),
        "no partial message may reach the inbound queue"
    );
}

/// Large messages force multiple partial writes on a loopback pair (the
/// kernel socket buffer can't hold the whole thing at once); §8 scenario 2
/// is about surviving that without losing or duplicating bytes.
#[tokio::test]
async fn large_message_survives_multiple_partial_writes() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    let header = vec![0xAAu8; 16];
    let body: Vec<u8> = (0..64_000u32).map(|i| (i % 256) as u8).collect();
    let total_len = header.len() + body.len();
    server_loader.lock().unwrap().expect_message(total_len);

    let message: Arc<dyn OutboundMessage> = Arc::new(OwnedMessage { header: header.clone(), body: body.clone() });
    client_conn.enqueue(message);
    client.messages_pending();

    drive_until(&mut client, &mut server, |_, _| client_conn.sent_count() == 1).await;

    for _ in 0..500 {
        server.do_reading().unwrap();
        if server_loader.lock().unwrap().completed.len() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    let mut expected = header;
    expected.extend_from_slice(&body);
    let delivered = server_loader.lock().unwrap().completed.pop_front().expect("large message delivered");
    assert_eq!(delivered.len(), expected.len());
    assert_eq!(delivered, expected);
}
