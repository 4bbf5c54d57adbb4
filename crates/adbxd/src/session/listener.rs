//! Unix socket listener and the per-connection driver.
//!
//! Each accepted connection gets its own task. The task reads the handshake
//! frame, lets `handshake::process` decide, then loops on request frames
//! until the peer leaves, a frame is bad, the session expires, or the broker
//! shuts down. `SessionState` decides every transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::unistd::getuid;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::{self, timeout_at};
use zerocopy::AsBytes;

use adbx_core::frame::{read_frame_body, read_frame_len, write_frame, FrameError};
use adbx_core::resume::ResumeStoreError;
use adbx_core::wire::{HandshakeResponse, HANDSHAKE_REQUEST_LEN};
use adbx_gateway::SessionAuth;

use super::handshake::{self, Accepted, Outcome};
use super::state::{Action, CloseReason, Input, SessionState};
use super::SessionContext;
use crate::dispatch;

/// How often idle lineages are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

pub struct SessionListener {
    listener: UnixListener,
    ctx: Arc<SessionContext>,
    shutdown: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl SessionListener {
    pub fn new(
        listener: UnixListener,
        ctx: Arc<SessionContext>,
        shutdown: broadcast::Sender<()>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self { listener, ctx, shutdown, shutdown_rx }
    }

    pub async fn run(self) -> Result<()> {
        let Self { listener, ctx, shutdown, mut shutdown_rx } = self;
        let mut reap_interval = tokio::time::interval(REAP_INTERVAL);
        let uid = getuid().as_raw();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }

                _ = reap_interval.tick() => {
                    ctx.lineage.reap(Instant::now());
                }

                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let cred = match stream.peer_cred() {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(error = %e, "peer credentials unavailable; closing");
                            continue;
                        }
                    };
                    if cred.uid() != uid {
                        tracing::warn!(peer_uid = cred.uid(), "connection from another uid refused");
                        continue;
                    }
                    let peer_pid = cred.pid().and_then(|p| u32::try_from(p).ok());

                    let ctx = ctx.clone();
                    let session_shutdown = shutdown.subscribe();
                    tokio::spawn(async move {
                        let reason = serve(stream, ctx, peer_pid, session_shutdown).await;
                        tracing::debug!(peer_pid, %reason, "connection closed");
                    });
                }
            }
        }
    }
}

/// Drive one connection to completion and return why it closed.
pub async fn serve(
    mut stream: UnixStream,
    ctx: Arc<SessionContext>,
    peer_pid: Option<u32>,
    mut shutdown: broadcast::Receiver<()>,
) -> CloseReason {
    let mut state = SessionState::AwaitingHandshake;
    let limits = ctx.limits;

    // ── Handshake ─────────────────────────────────────────────────────────────

    // One deadline covers the whole handshake frame, header and body.
    let deadline = time::Instant::now() + limits.handshake_timeout;
    let frame = read_request(&mut stream, HANDSHAKE_REQUEST_LEN as u32, deadline, BodyDeadline::At(deadline))
        .await
        .map_err(ReadFailure::into_reason);
    let payload = match frame {
        Ok(p) => p,
        Err(reason) => {
            state.step(Input::FrameFailed(reason));
            tracing::info!(peer_pid, %reason, "handshake frame rejected");
            return reason;
        }
    };

    let session = match handshake::process(&ctx, &payload, peer_pid).await {
        Outcome::Accepted(session) => {
            state.step(Input::HandshakeAccepted);
            session
        }
        Outcome::Refused(why) => {
            state.step(Input::HandshakeRefused);
            tracing::warn!(peer_pid, reason = why, "handshake refused");
            return CloseReason::AuthFailed;
        }
        Outcome::Rejected(status) => {
            if let Action::ReplyAndClose(status) = state.step(Input::HandshakeRejected(status)) {
                let resp = HandshakeResponse::rejected(status, 0, 0);
                let _ = write_frame(&mut stream, resp.as_bytes()).await;
            }
            tracing::info!(peer_pid, ?status, "authenticated handshake rejected");
            return CloseReason::Rejected(status);
        }
    };

    let session_id = ctx.next_session_id();
    tracing::info!(
        session = session_id,
        peer_pid,
        identity = ?session.identity,
        resumed = session.resumed,
        "session authenticated"
    );

    if let Err(e) = write_frame(&mut stream, session.response.as_bytes()).await {
        tracing::debug!(session = session_id, error = %e, "handshake reply failed");
        state.step(Input::FrameFailed(CloseReason::WriteFailed));
        release(&ctx, &session, CloseReason::WriteFailed).await;
        return CloseReason::WriteFailed;
    }

    let reason = run_session(&mut stream, &ctx, &session, session_id, &mut state, &mut shutdown).await;
    release(&ctx, &session, reason).await;
    tracing::info!(session = session_id, %reason, "session closed");
    reason
}

/// Mark the lineage idle and settle the caller's token file. The file's age
/// gates resume, so it restarts from the disconnect. An expired session's
/// token is dropped instead.
async fn release(ctx: &Arc<SessionContext>, session: &Accepted, reason: CloseReason) {
    ctx.lineage.release(&session.token, Instant::now());

    let (Some(_), Some(identity)) = (&ctx.store, session.identity) else {
        return;
    };
    let work_ctx = ctx.clone();
    let token = session.token.clone();
    let settled = tokio::task::spawn_blocking(move || -> Result<bool, ResumeStoreError> {
        let Some(store) = &work_ctx.store else {
            return Ok(false);
        };
        if reason != CloseReason::Expired {
            return store.refresh(&identity, &token);
        }
        // Only drop the file while it is still ours; a newer session may have rotated it.
        if store.lookup(&identity).is_some_and(|stored| stored == token) {
            store.remove(&identity)?;
        }
        Ok(false)
    })
    .await;

    match settled {
        Ok(Ok(refreshed)) => tracing::debug!(%identity, refreshed, "resume token settled"),
        Ok(Err(e)) => tracing::warn!(%identity, error = %e, "failed to settle resume token"),
        Err(e) => tracing::error!(error = %e, "resume token task failed"),
    }
}

async fn run_session(
    stream: &mut UnixStream,
    ctx: &SessionContext,
    session: &Accepted,
    session_id: u64,
    state: &mut SessionState,
    shutdown: &mut broadcast::Receiver<()>,
) -> CloseReason {
    let limits = ctx.limits;
    let auth = SessionAuth { session_id, authorized: true };

    loop {
        let now = Instant::now();
        let remaining = ctx.lineage.remaining(session.created_at, now);
        let wait = limits.idle_ttl.min(remaining);

        let frame = tokio::select! {
            _ = shutdown.recv() => {
                state.step(Input::Shutdown);
                return CloseReason::Shutdown;
            }
            frame = read_request(
                stream,
                limits.max_request_bytes,
                time::Instant::now() + wait,
                BodyDeadline::After(limits.request_timeout),
            ) => frame,
        };

        let payload = match frame {
            Ok(p) => p,
            // Nothing arrived within the idle or absolute window.
            Err(ReadFailure::HeaderTimeout) => {
                state.step(Input::Expired);
                return CloseReason::Expired;
            }
            Err(ReadFailure::Failed(reason)) => {
                state.step(Input::FrameFailed(reason));
                return reason;
            }
        };

        match state.step(Input::Request) {
            Action::Forward => {}
            _ => return CloseReason::Protocol,
        }
        ctx.lineage.touch(&session.token, Instant::now());

        let reply = dispatch::handle(&ctx.gateway, &payload, &auth).await;
        if let Err(e) = write_frame(stream, &reply).await {
            tracing::debug!(session = session_id, error = %e, "reply write failed");
            state.step(Input::FrameFailed(CloseReason::WriteFailed));
            return CloseReason::WriteFailed;
        }
    }
}

enum ReadFailure {
    /// No header byte arrived in time.
    HeaderTimeout,
    Failed(CloseReason),
}

impl ReadFailure {
    fn into_reason(self) -> CloseReason {
        match self {
            Self::HeaderTimeout => CloseReason::ReadTimeout,
            Self::Failed(reason) => reason,
        }
    }
}

/// When the frame body must be complete.
#[derive(Clone, Copy)]
enum BodyDeadline {
    /// A fixed instant shared with the header read.
    At(time::Instant),
    /// This long after the header arrived.
    After(Duration),
}

/// Read one frame: header by `header_deadline`, body by `body`.
async fn read_request(
    stream: &mut UnixStream,
    max_len: u32,
    header_deadline: time::Instant,
    body: BodyDeadline,
) -> Result<Vec<u8>, ReadFailure> {
    let len = match timeout_at(header_deadline, read_frame_len(stream)).await {
        Err(_) => return Err(ReadFailure::HeaderTimeout),
        Ok(Err(e)) => return Err(ReadFailure::Failed(frame_reason(&e))),
        Ok(Ok(len)) => len,
    };
    if len > max_len {
        return Err(ReadFailure::Failed(CloseReason::Oversized));
    }
    let body_deadline = match body {
        BodyDeadline::At(at) => at,
        BodyDeadline::After(wait) => time::Instant::now() + wait,
    };
    match timeout_at(body_deadline, read_frame_body(stream, len)).await {
        Err(_) => Err(ReadFailure::Failed(CloseReason::ReadTimeout)),
        Ok(Err(e)) => Err(ReadFailure::Failed(frame_reason(&e))),
        Ok(Ok(body)) => Ok(body),
    }
}

fn frame_reason(err: &FrameError) -> CloseReason {
    match err {
        FrameError::Closed => CloseReason::PeerClosed,
        FrameError::Truncated { .. } => CloseReason::Truncated,
        FrameError::TooLarge(_) => CloseReason::Oversized,
        FrameError::Io(_) => CloseReason::PeerClosed,
    }
}
