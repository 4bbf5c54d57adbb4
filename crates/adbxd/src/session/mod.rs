//! Session management: handshake, resume lineage, and per-connection driving.

pub mod handshake;
pub mod lineage;
pub mod listener;
pub mod state;

pub use lineage::LineageRegistry;
pub use listener::SessionListener;
pub use state::{CloseReason, SessionState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use adbx_core::config::AdbxConfig;
use adbx_core::crypto::SecretToken;
use adbx_core::identity::IdentitySource;
use adbx_core::resume::ResumeTokenStore;
use adbx_gateway::QueryGateway;

/// Timeouts and bounds applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_request_bytes: u32,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_ttl: Duration,
    pub absolute_ttl: Duration,
}

impl SessionLimits {
    pub fn from_config(config: &AdbxConfig) -> Self {
        Self {
            max_request_bytes: config.broker.max_request_bytes,
            handshake_timeout: Duration::from_millis(config.broker.handshake_timeout_ms),
            request_timeout: Duration::from_millis(config.broker.request_timeout_ms),
            idle_ttl: config.resume.idle_ttl(),
            absolute_ttl: config.resume.absolute_ttl(),
        }
    }
}

/// Everything a connection task needs, shared across all of them.
pub struct SessionContext {
    pub secret: SecretToken,
    /// `None` when resume is disabled by configuration.
    pub store: Option<ResumeTokenStore>,
    pub identity: Arc<dyn IdentitySource>,
    pub lineage: LineageRegistry,
    /// One permit per authenticated session.
    pub slots: Arc<Semaphore>,
    pub gateway: Arc<QueryGateway>,
    pub limits: SessionLimits,
    next_session_id: AtomicU64,
}

impl SessionContext {
    pub fn new(
        secret: SecretToken,
        store: Option<ResumeTokenStore>,
        identity: Arc<dyn IdentitySource>,
        gateway: Arc<QueryGateway>,
        limits: SessionLimits,
        max_clients: usize,
        max_idle_sessions: usize,
    ) -> Self {
        Self {
            secret,
            store,
            identity,
            lineage: LineageRegistry::new(limits.idle_ttl, limits.absolute_ttl, max_idle_sessions),
            slots: Arc::new(Semaphore::new(match max_clients {
                0 => Semaphore::MAX_PERMITS,
                n => n,
            })),
            gateway,
            limits,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}
