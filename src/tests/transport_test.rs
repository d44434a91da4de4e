use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::bus::config::Settings;
use crate::bus::connection::{OutboundMessage, OwnedMessage};
use crate::bus::socket::Socket;
use crate::bus::transport::{IterationFlags, TransportOps};
use crate::tests::common::{drive_until, harness};

#[tokio::test]
async fn happy_path_authenticates_and_delivers_one_message() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, server_loader) = harness(Socket::Unix(b), true, &settings);

    let header = b"HDR".to_vec();
    let body = vec![0x42u8; 1024];
    let total_len = header.len() + body.len();
    server_loader.lock().unwrap().expect_message(total_len);

    let message: Arc<dyn OutboundMessage> = Arc::new(OwnedMessage { header: header.clone(), body: body.clone() });
    client_conn.enqueue(message);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;
    client.messages_pending();

    drive_until(&mut client, &mut server, |_, _| client_conn.sent_count() == 1).await;

    for _ in 0..100 {
        server.do_reading().unwrap();
        if server_loader.lock().unwrap().completed.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut expected = header;
    expected.extend_from_slice(&body);
    let delivered = server_loader.lock().unwrap().completed.pop_front().expect("message delivered");
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn messages_are_delivered_in_fifo_order() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    const N: u8 = 5;
    for i in 0..N {
        let message: Arc<dyn OutboundMessage> = Arc::new(OwnedMessage { header: vec![i], body: vec![i; 8] });
        client_conn.enqueue(message);
    }
    client.messages_pending();
    // VecLoader only tracks one `expected_len` at a time; re-arm it after
    // each completion in the drain loop below.
    server_loader.lock().unwrap().expect_message(9);

    drive_until(&mut client, &mut server, |_, _| client_conn.sent_count() as u8 == N).await;

    for _ in 0..200 {
        {
            let mut loader = server_loader.lock().unwrap();
            if loader.completed.len() as u8 == N {
                break;
            }
            if loader.completed.len() < N as usize {
                loader.expect_message(9);
            }
        }
        server.do_reading().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let loader = server_loader.lock().unwrap();
    assert_eq!(loader.completed.len(), N as usize);
    for (i, msg) in loader.completed.iter().enumerate() {
        let mut expected = vec![i as u8];
        expected.extend(std::iter::repeat(i as u8).take(8));
        assert_eq!(msg, &expected, "message {} arrived out of order or corrupted", i);
    }
}

#[tokio::test]
async fn disconnect_is_idempotent_and_finalize_after_disconnect_is_a_no_op() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, _client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, _server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    client.disconnect();
    assert!(client.is_disconnected());
    client.disconnect();
    assert!(client.is_disconnected());
    client.finalize();
    assert!(client.is_disconnected());
}

#[tokio::test]
async fn peer_eof_during_handshake_disconnects_the_other_side() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, _client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    drop(b);

    for _ in 0..20 {
        let _ = client.do_authentication(true, true);
        if client.is_disconnected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(client.is_disconnected());
}

#[tokio::test]
async fn do_authentication_is_a_no_op_once_authenticated() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, _client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, _server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    client.do_authentication(true, true).unwrap();
    assert!(client.is_authenticated());
    assert!(!client.is_disconnected());
}

#[tokio::test]
async fn do_iteration_returns_immediately_when_blocking_but_nothing_is_wanted() {
    let settings = Settings::default();
    let (a, b) = UnixStream::pair().unwrap();
    let (mut client, _client_conn, _client_loader) = harness(Socket::Unix(a), false, &settings);
    let (mut server, _server_conn, _server_loader) = harness(Socket::Unix(b), true, &settings);

    drive_until(&mut client, &mut server, |c, s| c.is_authenticated() && s.is_authenticated()).await;

    let flags = IterationFlags { read: false, write: false, block: true };
    let started = std::time::Instant::now();
    client.do_iteration(flags, 10_000).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}
