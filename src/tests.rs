// ABOUTME: End-to-end tests driving NatsClient against a fake NATS server over a real TCP loopback socket
// ABOUTME: Covers the scenarios from SPEC_FULL.md §8: handshake, PING/PONG, MSG/HMSG dispatch, header fallback

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::client::{ClientOptions, NatsClient};
use crate::codec::Frame;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Reads one CRLF-terminated line (without the CRLF) from the socket.
async fn read_line(stream: &mut BufReader<&mut TcpStream>) -> String {
    let mut line = String::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        line.push(byte[0] as char);
        if line.ends_with("\r\n") {
            line.truncate(line.len() - 2);
            return line;
        }
    }
}

const INFO_NO_AUTH_NO_TLS: &str =
    "INFO {\"server_id\":\"s1\",\"server_name\":\"s1\",\"version\":\"2.10.0\",\"headers\":true,\"max_payload\":1048576,\"proto\":1}\r\n";

#[tokio::test(flavor = "multi_thread")]
async fn handshake_without_auth_or_tls_reaches_ready() {
    let (listener, port) = listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        let connect_line = read_line(&mut reader).await;
        assert!(connect_line.starts_with("CONNECT {"));
        assert!(connect_line.contains("\"verbose\":true"));
        assert!(connect_line.contains("\"tls_required\":false"));
        sock
    });

    let client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .expect("handshake should succeed");
    assert_eq!(client.state(), crate::engine::EngineState::Ready);

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_required_without_credentials_fails_fast() {
    let (listener, port) = listener().await;
    let info = "INFO {\"server_id\":\"s1\",\"server_name\":\"s1\",\"version\":\"2.10.0\",\"headers\":true,\"max_payload\":1048576,\"proto\":1,\"auth_required\":true}\r\n";

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(info.as_bytes()).await.unwrap();
        // Hold the socket open; the client should fail locally without
        // ever sending CONNECT.
        let mut buf = [0u8; 64];
        let _ = sock.read(&mut buf).await;
    });

    let err = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .expect_err("handshake should fail without credentials");
    assert!(matches!(
        err,
        crate::client::ClientError::Handshake(crate::engine::FatalReason::AuthMissing)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_gets_ponged_promptly() {
    let (listener, port) = listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await; // CONNECT

        sock.write_all(b"PING\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG\r\n");
    });

    let mut client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), server)
        .await
        .expect("server task timed out")
        .unwrap();
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_msg_reaches_catchall_callback() {
    let (listener, port) = listener().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await; // CONNECT
        let sub_line = read_line(&mut reader).await;
        assert!(sub_line.starts_with("SUB FOO.BAR "));

        sock.write_all(b"MSG FOO.BAR 9 11\r\nHello World\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let mut client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();
    client.add_callback(
        Arc::new(move |frame: &Frame| {
            let _ = tx.send(frame.clone());
        }),
        "",
    );
    assert!(client.subscribe("FOO.BAR", None).await.unwrap());

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("channel closed");
    match frame {
        Frame::Msg(msg) => {
            assert_eq!(msg.subject, "FOO.BAR");
            assert_eq!(msg.reply_to, None);
            assert_eq!(&msg.payload[..], b"Hello World");
        }
        other => panic!("expected Msg, got {other:?}"),
    }

    server.await.unwrap();
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn msg_with_reply_carries_reply_to() {
    let (listener, port) = listener().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await;
        sock.write_all(b"MSG FOO.BAR 9 GREETING.34 11\r\nHello World\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let mut client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();
    client.add_callback(Arc::new(move |frame: &Frame| { let _ = tx.send(frame.clone()); }), "");

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match frame {
        Frame::Msg(msg) => assert_eq!(msg.reply_to.as_deref(), Some("GREETING.34")),
        other => panic!("expected Msg, got {other:?}"),
    }

    server.await.unwrap();
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hmsg_parses_headers_and_payload() {
    let (listener, port) = listener().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await;
        sock.write_all(b"HMSG FOO.BAR 9 34 45\r\nNATS/1.0\r\nFoodGroup: vegetable\r\n\r\nHello World\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let mut client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();
    client.add_callback(Arc::new(move |frame: &Frame| { let _ = tx.send(frame.clone()); }), "");

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match frame {
        Frame::Hmsg(hmsg) => {
            assert_eq!(hmsg.headers.get("FoodGroup").map(String::as_str), Some("vegetable"));
            assert_eq!(&hmsg.payload[..], b"Hello World");
        }
        other => panic!("expected Hmsg, got {other:?}"),
    }

    server.await.unwrap();
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_drops_headers_when_server_disallows_them() {
    let (listener, port) = listener().await;
    let info = "INFO {\"server_id\":\"s1\",\"server_name\":\"s1\",\"version\":\"2.10.0\",\"headers\":false,\"max_payload\":1048576,\"proto\":1}\r\n";

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(info.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await; // CONNECT
        let pub_line = read_line(&mut reader).await;
        assert_eq!(pub_line, "PUB S 1");
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], b'x');
    });

    let client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();

    let mut headers = crate::codec::Headers::new();
    headers.insert("K".to_string(), "V".to_string());
    client
        .publish("S", b"x", Some(headers), None)
        .await
        .expect("publish should succeed despite dropped headers");

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_larger_than_max_payload_is_rejected() {
    let (listener, port) = listener().await;
    let info = "INFO {\"server_id\":\"s1\",\"server_name\":\"s1\",\"version\":\"2.10.0\",\"headers\":true,\"max_payload\":4,\"proto\":1}\r\n";

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(info.as_bytes()).await.unwrap();
        let mut buf = [0u8; 256];
        let _ = sock.read(&mut buf).await; // CONNECT
    });

    let client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();

    let err = client
        .publish("S", b"too large", None, None)
        .await
        .expect_err("oversized payload should be rejected");
    assert!(matches!(err, crate::client::ClientError::PayloadTooLarge { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_twice_on_same_subject_is_rejected() {
    let (listener, port) = listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let client = NatsClient::start(ClientOptions::new("127.0.0.1", port))
        .await
        .unwrap();

    assert!(client.subscribe("FOO.BAR", None).await.unwrap());
    assert!(!client.subscribe("FOO.BAR", None).await.unwrap());
    assert!(client.unsubscribe("FOO.BAR", None).await.unwrap());
    assert!(client.subscribe("FOO.BAR", None).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn catchall_callback_from_options_receives_every_subject() {
    let (listener, port) = listener().await;
    let count = Arc::new(AtomicUsize::new(0));
    let count_cb = count.clone();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(INFO_NO_AUTH_NO_TLS.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(&mut sock);
        read_line(&mut reader).await;
        sock.write_all(b"MSG A.B 1 2\r\nhi\r\n").await.unwrap();
        sock.write_all(b"MSG C.D 2 2\r\nhi\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let options = ClientOptions::new("127.0.0.1", port)
        .with_catchall_callback(Arc::new(move |_: &Frame| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        }));
    let mut client = NatsClient::start(options).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    server.await.unwrap();
    client.close().await;
}
