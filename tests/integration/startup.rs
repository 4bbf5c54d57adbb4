//! Broker lifecycle: private dir, secret loading, generations, shutdown.

use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};

use adbx_core::privdir::PrivateDir;

use crate::*;

fn mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[tokio::test]
async fn startup_provisions_an_owner_only_tree() {
    let root = temp_root("startup-tree");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();

    let dir = &broker.private_dir;
    for path in [dir.base().to_path_buf(), dir.run_dir(), dir.secret_dir(), dir.state_dir()] {
        assert_eq!(mode(&path), 0o700, "{}", path.display());
    }
    assert_eq!(mode(&dir.secret_path()), 0o600);
    assert_eq!(std::fs::read(dir.secret_path()).unwrap().len(), 32);

    let meta = std::fs::symlink_metadata(&broker.socket_path).unwrap();
    assert!(meta.file_type().is_socket());
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);

    broker.stop().await;
}

#[tokio::test]
async fn malformed_secret_is_fatal() {
    let root = temp_root("startup-secret");
    let config = test_config(&root);
    let dir = PrivateDir::new(root.join("priv"));
    dir.ensure().unwrap();
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dir.secret_path())
        .and_then(|mut f| std::io::Write::write_all(&mut f, &[7u8; 10]))
        .unwrap();

    let result = TestBroker::start(root.clone(), config).await;
    assert!(result.is_err(), "a 10-byte secret must not start a broker");
    assert!(!dir.socket_path("broker.sock").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn world_readable_secret_is_fatal() {
    let root = temp_root("startup-perms");
    let config = test_config(&root);
    let dir = PrivateDir::new(root.join("priv"));
    dir.ensure().unwrap();
    std::fs::write(dir.secret_path(), [7u8; 32]).unwrap();
    std::fs::set_permissions(dir.secret_path(), std::fs::Permissions::from_mode(0o644)).unwrap();

    assert!(TestBroker::start(root.clone(), config).await.is_err());
    assert!(!dir.socket_path("broker.sock").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn shutdown_removes_the_socket() {
    let root = temp_root("startup-shutdown");
    let config = test_config(&root);
    let broker = Broker::bind(&config, Arc::new(FixedIdentity(TEST_IDENTITY))).await.unwrap();
    let socket = broker.socket_path().to_path_buf();
    let shutdown = broker.shutdown_handle();
    let task = tokio::spawn(broker.run());

    assert!(socket.exists());
    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("broker stops")
        .unwrap()
        .unwrap();
    assert!(!socket.exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn restart_replaces_stale_socket_and_invalidates_tokens() {
    let root = temp_root("startup-restart");
    let config = test_config(&root);

    let broker = TestBroker::start(root.clone(), config.clone()).await.unwrap();
    let mut client = broker.connect().await.unwrap();
    let reply = client
        .run_sql_query("crm", "SELECT lower(email) FROM customers WHERE id = 1")
        .await
        .unwrap();
    let token = reply["result"]["rows"][0][0].as_str().unwrap().to_string();
    assert!(token.starts_with("tok_crm_1_"), "{token}");
    drop(client);

    let socket = broker.socket_path.clone();
    broker.halt().await;
    assert!(!socket.exists());

    // A crashed broker leaves its socket file behind.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let broker = TestBroker::start(root.clone(), config).await.unwrap();
    let mut client = broker.connect().await.unwrap();
    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email = ?1", &[token])
        .await
        .unwrap();
    assert_eq!(error_data(&reply)["kind"], "invalid_token");

    let reply = client
        .run_sql_query("crm", "SELECT lower(email) FROM customers WHERE id = 1")
        .await
        .unwrap();
    assert!(reply["result"]["rows"][0][0].as_str().unwrap().starts_with("tok_crm_2_"));

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn non_socket_at_socket_path_is_left_alone() {
    let root = temp_root("startup-squat");
    let config = test_config(&root);
    let dir = PrivateDir::new(root.join("priv"));
    dir.ensure().unwrap();
    let squatter = dir.socket_path(&config.broker.socket_name);
    std::fs::write(&squatter, b"not a socket").unwrap();

    assert!(TestBroker::start(root.clone(), config).await.is_err());
    assert_eq!(std::fs::read(&squatter).unwrap(), b"not a socket");

    let _ = std::fs::remove_dir_all(&root);
}
