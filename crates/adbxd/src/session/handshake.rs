//! Handshake processing: authenticate, maybe resume, rotate, admit.
//!
//! Anything that fails authentication comes back as `Refused`, and the driver
//! closes the socket without a reply. `Rejected` is reserved for clients that
//! did authenticate but cannot be served.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;

use adbx_core::crypto::ResumeToken;
use adbx_core::identity::{CallerIdentity, IdentityError};
use adbx_core::wire::{HandshakeRequest, HandshakeResponse, HandshakeStatus, HANDSHAKE_MAGIC, HANDSHAKE_VERSION};

use super::lineage::LineageLookup;
use super::SessionContext;

/// An authenticated, admitted session.
pub struct Accepted {
    pub token: ResumeToken,
    pub created_at: Instant,
    pub identity: Option<CallerIdentity>,
    pub resumed: bool,
    /// Held for the life of the session; dropping it frees a client slot.
    pub permit: OwnedSemaphorePermit,
    pub response: HandshakeResponse,
}

pub enum Outcome {
    Accepted(Accepted),
    Refused(&'static str),
    Rejected(HandshakeStatus),
}

/// Result of the blocking part of the handshake.
struct StoreWork {
    identity: Option<CallerIdentity>,
    /// What the store holds for the identity, when it could be consulted.
    stored: Option<Option<ResumeToken>>,
    token: ResumeToken,
}

pub async fn process(ctx: &Arc<SessionContext>, payload: &[u8], peer_pid: Option<u32>) -> Outcome {
    let request = match HandshakeRequest::decode(payload) {
        Ok(r) => r,
        Err(_) => return Outcome::Refused("undecodable handshake"),
    };
    if request.magic.get() != HANDSHAKE_MAGIC {
        return Outcome::Refused("bad magic");
    }
    if request.version.get() != HANDSHAKE_VERSION {
        return Outcome::Refused("unsupported version");
    }
    if !ctx.secret.verify(&request.secret_token) {
        return Outcome::Refused("secret mismatch");
    }

    // Authenticated from here on: failures get a status reply.
    let permit = match ctx.slots.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => return Outcome::Rejected(HandshakeStatus::Full),
    };

    let work_ctx = ctx.clone();
    let work = match tokio::task::spawn_blocking(move || store_work(&work_ctx, peer_pid)).await {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "handshake store task failed");
            return Outcome::Rejected(HandshakeStatus::Internal);
        }
    };

    let now = Instant::now();
    let mut created_at = now;
    let mut resumed = false;
    if request.wants_resume() {
        match ctx.lineage.take(&request.resume_token, now) {
            LineageLookup::Resumed(lineage) => {
                if resume_matches(&request.resume_token, &lineage.identity, &work) {
                    created_at = lineage.created_at;
                    resumed = true;
                } else {
                    tracing::debug!("resume token does not match the store; starting fresh");
                }
            }
            LineageLookup::Expired => tracing::debug!("resume token expired; starting fresh"),
            LineageLookup::Unknown => tracing::debug!("resume token unknown; starting fresh"),
        }
    }

    ctx.lineage.issue(&work.token, created_at, work.identity, now);

    let response = HandshakeResponse::ok(
        *work.token.as_bytes(),
        secs_u32(ctx.limits.idle_ttl),
        secs_u32(ctx.lineage.remaining(created_at, now)),
    );
    Outcome::Accepted(Accepted {
        token: work.token,
        created_at,
        identity: work.identity,
        resumed,
        permit,
        response,
    })
}

/// Resolve the caller, read its stored token, and rotate it.
fn store_work(ctx: &SessionContext, peer_pid: Option<u32>) -> StoreWork {
    let resolved = peer_pid
        .ok_or(IdentityError::NoPeerPid)
        .and_then(|pid| ctx.identity.resolve(pid));
    let identity = match resolved {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::debug!(peer_pid, error = %e, "caller identity unresolved; token will not persist");
            None
        }
    };

    let (Some(store), Some(id)) = (&ctx.store, identity) else {
        return StoreWork { identity, stored: None, token: ResumeToken::generate() };
    };

    let stored = store.lookup(&id);
    let token = match store.rotate(&id) {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(identity = %id, error = %e, "resume token rotation failed; issuing an unpersisted token");
            ResumeToken::generate()
        }
    };
    StoreWork { identity, stored: Some(stored), token }
}

/// A lineage hit still has to agree with the caller and the store.
fn resume_matches(presented: &[u8], lineage_identity: &Option<CallerIdentity>, work: &StoreWork) -> bool {
    if let (Some(a), Some(b)) = (lineage_identity, &work.identity) {
        if a != b {
            return false;
        }
    }
    match &work.stored {
        Some(Some(stored)) => stored.matches(presented),
        Some(None) => false,
        None => true,
    }
}

fn secs_u32(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}
