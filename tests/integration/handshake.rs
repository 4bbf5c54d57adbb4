//! Handshake admission: secret checks, malformed frames, client slots.

use tokio::io::AsyncWriteExt;
use zerocopy::AsBytes;

use adbx_core::frame::{read_frame, write_frame};
use adbx_core::wire::{HandshakeRequest, HandshakeResponse, HandshakeStatus, HANDSHAKE_RESPONSE_LEN};

use crate::*;

#[tokio::test]
async fn fresh_handshakes_get_distinct_tokens() {
    let root = temp_root("handshake-ok");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();

    let first = broker.connect().await.unwrap();
    assert!(!first.offered_resume());
    assert_eq!(first.idle_ttl_secs(), 1200);
    assert_eq!(first.absolute_ttl_secs(), 28_800);

    let mut raw = broker.raw().await;
    let request = HandshakeRequest::new(&broker.secret(), None);
    write_frame(&mut raw, request.as_bytes()).await.unwrap();
    let reply = read_frame(&mut raw).await.unwrap();
    assert_eq!(reply.len(), HANDSHAKE_RESPONSE_LEN);
    let response = HandshakeResponse::decode(&reply).unwrap();
    assert_eq!(response.status.get(), u16::from(HandshakeStatus::Ok));
    assert_ne!(&response.resume_token, first.resume_token().as_bytes());

    drop(first);
    broker.stop().await;
}

#[tokio::test]
async fn malformed_frames_get_no_reply() {
    let root = temp_root("handshake-malformed");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let secret = broker.secret();

    // Wrong magic, correct secret.
    let mut request = HandshakeRequest::new(&secret, None);
    request.magic.set(0xDEAD_BEEF);
    let mut raw = broker.raw().await;
    write_frame(&mut raw, request.as_bytes()).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "bad magic");

    // Unsupported version.
    let mut request = HandshakeRequest::new(&secret, None);
    request.version.set(2);
    let mut raw = broker.raw().await;
    write_frame(&mut raw, request.as_bytes()).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "bad version");

    // Body shorter than a handshake.
    let mut raw = broker.raw().await;
    write_frame(&mut raw, &[0u8; 40]).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "short body");

    // Declared length larger than any handshake; the body never follows.
    let mut raw = broker.raw().await;
    raw.write_all(&4096u32.to_be_bytes()).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "oversized length");

    // Header promises a full handshake, the stream ends early.
    let mut raw = broker.raw().await;
    raw.write_all(&72u32.to_be_bytes()).await.unwrap();
    raw.write_all(&[0u8; 10]).await.unwrap();
    raw.shutdown().await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "truncated body");

    // Nothing at all.
    let mut raw = broker.raw().await;
    raw.shutdown().await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty(), "empty stream");

    // None of the above disturbed the broker.
    let client = broker.connect().await.unwrap();
    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn silent_peer_is_dropped_after_handshake_timeout() {
    let root = temp_root("handshake-silent");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();

    let mut raw = broker.raw().await;
    let started = std::time::Instant::now();
    assert!(bytes_until_close(&mut raw).await.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));

    broker.stop().await;
}

#[tokio::test]
async fn handshake_timeout_spans_header_and_body() {
    let root = temp_root("handshake-deadline");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let request = HandshakeRequest::new(&broker.secret(), None);

    // Each half arrives within the 1s timeout on its own, but not together.
    let mut raw = broker.raw().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    raw.write_all(&(request.as_bytes().len() as u32).to_be_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let _ = raw.write_all(request.as_bytes()).await;
    assert!(bytes_until_close(&mut raw).await.is_empty());

    // A prompt client is unaffected.
    let client = broker.connect().await.unwrap();
    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn wrong_secret_is_closed_without_a_reply() {
    let root = temp_root("handshake-secret");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();

    let mut wrong = broker.secret();
    wrong[31] ^= 0x01;
    let mut raw = broker.raw().await;
    write_frame(&mut raw, HandshakeRequest::new(&wrong, None).as_bytes()).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty());

    // A resume offer does not help without the secret.
    let mut raw = broker.raw().await;
    write_frame(&mut raw, HandshakeRequest::new(&[0u8; 32], Some(&[9u8; 32])).as_bytes())
        .await
        .unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty());

    let client = broker.connect().await.unwrap();
    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn full_broker_answers_authenticated_clients_only() {
    let root = temp_root("handshake-full");
    let mut config = test_config(&root);
    config.broker.max_clients = 1;
    let broker = TestBroker::start(root.clone(), config).await.unwrap();

    let held = broker.connect().await.unwrap();

    match broker.connect().await {
        Err(ClientError::Rejected(HandshakeStatus::Full)) => {}
        Err(e) => panic!("expected FULL, got {e}"),
        Ok(_) => panic!("expected FULL, got a session"),
    }

    // FULL is never disclosed to a peer that failed authentication.
    let mut raw = broker.raw().await;
    write_frame(&mut raw, HandshakeRequest::new(&[1u8; 32], None).as_bytes()).await.unwrap();
    assert!(bytes_until_close(&mut raw).await.is_empty());

    // Releasing the slot admits the next client.
    drop(held);
    let mut admitted = None;
    for _ in 0..50 {
        match broker.connect().await {
            Ok(client) => {
                admitted = Some(client);
                break;
            }
            Err(ClientError::Rejected(HandshakeStatus::Full)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(admitted.is_some(), "slot was never released");

    drop(admitted);
    broker.stop().await;
}
