//! Broker startup and lifetime.
//!
//! `bind` does everything that can fail before a socket exists: private dir,
//! shared secret, token generation, resume store, connection profiles. A
//! broker that cannot load its secret never listens.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::UnixListener;
use tokio::sync::broadcast;

use adbx_core::config::AdbxConfig;
use adbx_core::crypto::SecretToken;
use adbx_core::identity::IdentitySource;
use adbx_core::privdir::PrivateDir;
use adbx_core::resume::ResumeTokenStore;
use adbx_gateway::QueryGateway;

use crate::session::{SessionContext, SessionLimits, SessionListener};

pub struct Broker {
    listener: UnixListener,
    socket_path: PathBuf,
    private_dir: PrivateDir,
    ctx: Arc<SessionContext>,
    generation: u32,
    shutdown: broadcast::Sender<()>,
    /// Subscribed at bind time so a shutdown sent before `run` is not lost.
    shutdown_rx: broadcast::Receiver<()>,
}

impl Broker {
    pub async fn bind(config: &AdbxConfig, identity: Arc<dyn IdentitySource>) -> Result<Self> {
        let private_dir = PrivateDir::new(
            config.broker.private_dir.clone().unwrap_or_else(PrivateDir::default_base),
        );
        private_dir
            .ensure()
            .with_context(|| format!("private dir {} is unusable", private_dir.base().display()))?;
        let socket_path = private_dir
            .check_socket_path(&config.broker.socket_name)
            .context("socket path rejected")?;

        let secret_path = private_dir.secret_path();
        if config.broker.provision_secret
            && SecretToken::provision(&secret_path).context("failed to provision shared secret")?
        {
            tracing::info!(path = %secret_path.display(), "shared secret provisioned");
        }
        let secret = SecretToken::load(&secret_path).context("cannot load shared secret")?;

        let generation = private_dir.bump_generation().context("failed to advance token generation")?;

        let store = if config.resume.enabled {
            let dir = config.resume.dir.clone().unwrap_or_else(ResumeTokenStore::default_dir);
            match ResumeTokenStore::open(&dir, config.resume.idle_ttl()) {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "resume store unavailable; resume disabled");
                    None
                }
            }
        } else {
            None
        };

        let gateway = QueryGateway::from_config(config, generation).context("failed to open connections")?;

        remove_stale_socket(&socket_path)?;
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))
            .context("failed to restrict socket permissions")?;

        let ctx = Arc::new(SessionContext::new(
            secret,
            store,
            identity,
            Arc::new(gateway),
            SessionLimits::from_config(config),
            config.broker.max_clients,
            config.broker.max_idle_sessions,
        ));

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let mut connections: Vec<&str> = ctx.gateway.connection_names().collect();
        connections.sort_unstable();
        tracing::info!(
            socket = %socket_path.display(),
            generation,
            resume = ctx.store.is_some(),
            resume_secure = ctx.store.as_ref().is_some_and(ResumeTokenStore::is_secure),
            ?connections,
            "broker listening"
        );
        Ok(Self { listener, socket_path, private_dir, ctx, generation, shutdown, shutdown_rx })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn private_dir(&self) -> &PrivateDir {
        &self.private_dir
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Sending on this stops the listener and every session.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Serve until shutdown, then remove the socket file.
    pub async fn run(self) -> Result<()> {
        let socket_path = self.socket_path.clone();
        let result = SessionListener::new(self.listener, self.ctx, self.shutdown, self.shutdown_rx)
            .run()
            .await;
        match fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %socket_path.display(), error = %e, "failed to remove socket"),
        }
        tracing::info!("broker stopped");
        result
    }
}

/// A socket file left by a previous broker blocks `bind`; anything else at
/// that path is not ours to delete.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).with_context(|| format!("failed to remove stale socket {}", path.display()))
        }
        Ok(_) => bail!("{} exists and is not a socket", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot inspect {}", path.display())),
    }
}
