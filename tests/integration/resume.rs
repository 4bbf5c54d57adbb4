//! Resume tokens: on-disk rotation, lineage continuation, expiry.

use crate::*;

fn short_ttls(root: &Path, idle_secs: u64, absolute_secs: u64) -> AdbxConfig {
    let mut config = test_config(root);
    config.resume.idle_ttl_secs = idle_secs;
    config.resume.absolute_ttl_secs = absolute_secs;
    config
}

#[tokio::test]
async fn token_rotates_on_disk_every_handshake() {
    let root = temp_root("resume-rotate");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let token_file = broker.store().token_path(&TEST_IDENTITY);

    let first = broker.connect().await.unwrap();
    assert!(!first.offered_resume());
    let on_disk = std::fs::read(&token_file).unwrap();
    assert_eq!(on_disk.as_slice(), first.resume_token().as_bytes());
    let first_token = first.resume_token().clone();
    drop(first);

    let second = broker.connect().await.unwrap();
    assert!(second.offered_resume());
    assert_ne!(second.resume_token(), &first_token);
    let on_disk = std::fs::read(&token_file).unwrap();
    assert_eq!(on_disk.as_slice(), second.resume_token().as_bytes());

    drop(second);
    broker.stop().await;
}

#[tokio::test]
async fn resumed_session_keeps_its_absolute_deadline() {
    let root = temp_root("resume-continue");
    let broker = TestBroker::start(root.clone(), short_ttls(&root, 30, 60)).await.unwrap();

    let first = broker.connect().await.unwrap();
    assert_eq!(first.absolute_ttl_secs(), 60);
    drop(first);

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let second = broker.connect().await.unwrap();
    assert!(second.offered_resume());
    assert!(
        second.absolute_ttl_secs() < 60,
        "resumed lineage should report its remaining lifetime, got {}",
        second.absolute_ttl_secs()
    );

    drop(second);
    broker.stop().await;
}

#[tokio::test]
async fn idle_session_is_closed_and_not_resumable() {
    let root = temp_root("resume-expire");
    let broker = TestBroker::start(root.clone(), short_ttls(&root, 1, 60)).await.unwrap();

    let token_file = broker.store().token_path(&TEST_IDENTITY);

    let mut client = broker.connect().await.unwrap();
    assert_eq!(client.idle_ttl_secs(), 1);
    client.request("tools/list", serde_json::json!({})).await.unwrap();
    let expired_token = std::fs::read(&token_file).unwrap();
    assert_eq!(expired_token.as_slice(), client.resume_token().as_bytes());

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    assert!(client.request("tools/list", serde_json::json!({})).await.is_err());
    drop(client);

    // The on-disk token aged out with the lineage: a fresh session starts.
    let next = broker.connect().await.unwrap();
    assert!(!next.offered_resume());
    assert_eq!(next.absolute_ttl_secs(), 60);

    // ...and it persisted a new token in place of the expired one.
    let on_disk = std::fs::read(&token_file).unwrap();
    assert_ne!(on_disk, expired_token);
    assert_eq!(on_disk.as_slice(), next.resume_token().as_bytes());

    drop(next);
    broker.stop().await;
}

#[tokio::test]
async fn busy_session_longer_than_idle_ttl_still_resumes() {
    let root = temp_root("resume-busy");
    let broker = TestBroker::start(root.clone(), short_ttls(&root, 2, 60)).await.unwrap();

    let mut client = broker.connect().await.unwrap();
    // Stay active for well over the idle TTL.
    for _ in 0..7 {
        client.request("tools/list", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    drop(client);
    // Let the broker notice the disconnect and settle the token file.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let next = broker.connect().await.unwrap();
    assert!(next.offered_resume());
    assert!(
        next.absolute_ttl_secs() < 60,
        "session should continue its lineage, got a fresh {}s deadline",
        next.absolute_ttl_secs()
    );

    drop(next);
    broker.stop().await;
}

#[tokio::test]
async fn unknown_resume_token_starts_fresh() {
    let root = temp_root("resume-unknown");
    let broker = TestBroker::start(root.clone(), short_ttls(&root, 30, 60)).await.unwrap();

    // Plant a token the broker never issued.
    let store = broker.store();
    std::fs::write(store.token_path(&TEST_IDENTITY), [0x42u8; 32]).unwrap();
    let mut perms = std::fs::metadata(store.token_path(&TEST_IDENTITY)).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o600);
    std::fs::set_permissions(store.token_path(&TEST_IDENTITY), perms).unwrap();

    let client = broker.connect().await.unwrap();
    assert!(client.offered_resume());
    assert_eq!(client.absolute_ttl_secs(), 60);
    assert_ne!(client.resume_token().as_bytes(), &[0x42u8; 32]);

    drop(client);
    broker.stop().await;
}
