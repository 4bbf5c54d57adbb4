//! Per-connection session state machine.
//!
//! Pure: no I/O, no clocks. The connection driver feeds it inputs and performs
//! the returned action. Every failure edge lands in `Closed`, and nothing
//! leaves `Closed`.

use std::fmt;

use adbx_core::wire::HandshakeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Authenticated,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer hung up between frames.
    PeerClosed,
    /// Truncated header or body.
    Truncated,
    /// Declared length above the request limit.
    Oversized,
    /// A frame did not arrive, or did not finish, in time.
    ReadTimeout,
    /// Bad magic, bad version, bad secret, or an undecodable handshake.
    AuthFailed,
    /// Authenticated but turned away with a status reply.
    Rejected(HandshakeStatus),
    /// Idle or absolute TTL ran out.
    Expired,
    /// Could not write a reply.
    WriteFailed,
    /// An input that makes no sense in the current state.
    Protocol,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Truncated => f.write_str("truncated frame"),
            Self::Oversized => f.write_str("oversized frame"),
            Self::ReadTimeout => f.write_str("read timeout"),
            Self::AuthFailed => f.write_str("authentication failed"),
            Self::Rejected(status) => write!(f, "rejected with {status:?}"),
            Self::Expired => f.write_str("session expired"),
            Self::WriteFailed => f.write_str("write failed"),
            Self::Protocol => f.write_str("protocol violation"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Handshake verified and a resume token issued.
    HandshakeAccepted,
    /// Handshake failed authentication or could not be decoded.
    HandshakeRefused,
    /// Handshake authenticated but cannot be served.
    HandshakeRejected(HandshakeStatus),
    /// A complete request frame within the size bound.
    Request,
    /// The frame layer gave up.
    FrameFailed(CloseReason),
    Expired,
    Shutdown,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send the OK handshake response.
    ReplyOk,
    /// Send a status-coded handshake response, then close.
    ReplyAndClose(HandshakeStatus),
    /// Hand the request to the gateway.
    Forward,
    /// Close without writing anything.
    Close,
    /// Already closed.
    Nothing,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    /// Apply `input` and return the action to perform.
    pub fn step(&mut self, input: Input) -> Action {
        use Input::*;
        use SessionState::*;

        let (next, action) = match (*self, input) {
            (Closed(reason), _) => (Closed(reason), Action::Nothing),

            (AwaitingHandshake, HandshakeAccepted) => (Authenticated, Action::ReplyOk),
            (AwaitingHandshake, HandshakeRefused) => (Closed(CloseReason::AuthFailed), Action::Close),
            (AwaitingHandshake, HandshakeRejected(status)) => {
                (Closed(CloseReason::Rejected(status)), Action::ReplyAndClose(status))
            }

            (Authenticated, Request) => (Authenticated, Action::Forward),

            (_, FrameFailed(reason)) => (Closed(reason), Action::Close),
            (_, Expired) => (Closed(CloseReason::Expired), Action::Close),
            (_, Shutdown) => (Closed(CloseReason::Shutdown), Action::Close),

            // A second handshake, or a request before the first.
            (AwaitingHandshake, Request)
            | (Authenticated, HandshakeAccepted | HandshakeRefused | HandshakeRejected(_)) => {
                (Closed(CloseReason::Protocol), Action::Close)
            }
        };
        *self = next;
        action
    }
}
