//! adbx integration test harness.
//!
//! Each test starts a real broker on its own temporary private dir and talks
//! to it over the Unix socket, either through `BrokerClient` or with raw
//! frames. No root or external services are needed:
//!
//!   cargo test --test integration
//!
//! Tests clean up their own directories.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use adbx_core::config::{AdbxConfig, ConnectionConfig, TokenMode};
use adbx_core::identity::{CallerIdentity, FixedIdentity, IdentitySource};
use adbx_core::privdir::PrivateDir;
use adbx_core::resume::ResumeTokenStore;
use adbxd::{Broker, BrokerClient, ClientError, ClientOptions};

mod gateway;
mod handshake;
mod resume;
mod startup;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Identity every test broker resolves its peers to, unless a test says otherwise.
pub const TEST_IDENTITY: CallerIdentity = CallerIdentity { pid: 31337, start_ticks: 424242 };

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A fresh, empty directory for one test.
pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "adbx-it-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(&root).expect("create test root");
    root
}

/// A small CRM database: `customers(id, name, email, ssn)`.
pub fn seed_database(path: &Path) {
    let conn = rusqlite::Connection::open(path).expect("open test db");
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, email TEXT, ssn TEXT);
         INSERT INTO customers VALUES
             (1, 'ada',  'ada@example.com',  '111-11-1111'),
             (2, 'bob',  'bob@example.com',  '222-22-2222'),
             (3, 'cleo', 'ada@example.com',  '333-33-3333');",
    )
    .expect("seed test db");
}

/// Config rooted at `root` with two connections over the same database:
/// `crm` (deterministic) and `crm_rand` (randomized).
pub fn test_config(root: &Path) -> AdbxConfig {
    let db = root.join("crm.db");
    seed_database(&db);

    let connection = |name: &str, mode: TokenMode| ConnectionConfig {
        name: name.to_string(),
        database: db.clone(),
        sensitive_columns: vec!["customers.email".into(), "ssn".into()],
        approved_functions: vec!["lower".into(), "trim".into()],
        unsafe_functions: vec!["load_extension".into(), "randomblob".into()],
        tokenization: mode,
        ..Default::default()
    };

    let mut config = AdbxConfig::default();
    config.broker.private_dir = Some(root.join("priv"));
    config.broker.handshake_timeout_ms = 1_000;
    config.broker.request_timeout_ms = 1_000;
    config.resume.dir = Some(root.join("resume"));
    config.connections = vec![
        connection("crm", TokenMode::Deterministic),
        connection("crm_rand", TokenMode::Randomized),
    ];
    config
}

pub struct TestBroker {
    pub root: PathBuf,
    pub config: AdbxConfig,
    pub private_dir: PrivateDir,
    pub socket_path: PathBuf,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestBroker {
    pub async fn start(root: PathBuf, config: AdbxConfig) -> Result<Self> {
        Self::start_with_identity(root, config, Arc::new(FixedIdentity(TEST_IDENTITY))).await
    }

    pub async fn start_with_identity(
        root: PathBuf,
        config: AdbxConfig,
        identity: Arc<dyn IdentitySource>,
    ) -> Result<Self> {
        let broker = Broker::bind(&config, identity).await.context("bind test broker")?;
        let private_dir = broker.private_dir().clone();
        let socket_path = broker.socket_path().to_path_buf();
        let shutdown = broker.shutdown_handle();
        let task = tokio::spawn(broker.run());
        Ok(Self { root, config, private_dir, socket_path, shutdown, task })
    }

    pub fn store(&self) -> ResumeTokenStore {
        let dir = self.config.resume.dir.clone().expect("resume dir set");
        ResumeTokenStore::open(dir, self.config.resume.idle_ttl()).expect("open resume store")
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::for_private_dir(&self.private_dir, &self.config.broker.socket_name)
            .with_store(self.store())
            .with_identity(TEST_IDENTITY)
    }

    pub async fn connect(&self) -> Result<BrokerClient, ClientError> {
        BrokerClient::connect(&self.client_options()).await
    }

    pub async fn raw(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).await.expect("connect raw")
    }

    pub fn secret(&self) -> [u8; 32] {
        let bytes = std::fs::read(self.private_dir.secret_path()).expect("read secret");
        bytes.try_into().expect("32-byte secret")
    }

    /// Stop the broker, keeping its files.
    pub async fn halt(self) -> PathBuf {
        let _ = self.shutdown.send(());
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        self.root
    }

    /// Stop the broker and remove everything it wrote.
    pub async fn stop(self) {
        let root = self.halt().await;
        let _ = std::fs::remove_dir_all(root);
    }
}

/// Read until the broker closes the connection; return whatever it sent.
/// A reset counts as a close: the broker may hang up with our bytes unread.
pub async fn bytes_until_close(stream: &mut UnixStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Err(_) => panic!("broker kept the connection open"),
        }
    }
}

/// Pull a gateway error's `data` object out of a JSON-RPC response.
pub fn error_data(response: &serde_json::Value) -> &serde_json::Value {
    &response["error"]["data"]
}
