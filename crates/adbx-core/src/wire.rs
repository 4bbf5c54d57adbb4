//! Broker wire format: the fixed-size handshake exchanged on the control socket.
//!
//! These types ARE the protocol. Every field, every size, every reserved bit
//! is part of the wire format. Both structs travel inside one length-prefixed
//! frame (see `frame`), and every scalar is big-endian on the wire.
//!
//! Fields use zerocopy's byte-order-aware integers, so the structs are
//! alignment-free and need no packing. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// "MCPB" read as a big-endian u32.
pub const HANDSHAKE_MAGIC: u32 = 0x4D43_5042;

/// Current handshake version.
pub const HANDSHAKE_VERSION: u16 = 1;

/// Request flag: the resume token field carries a token the client wants to resume.
pub const FLAG_HAS_RESUME: u16 = 0x0001;

/// Length of the shared secret carried in every handshake.
pub const SECRET_TOKEN_LEN: usize = 32;

/// Length of a resume token.
pub const RESUME_TOKEN_LEN: usize = 32;

/// Exact payload size of a handshake request frame.
pub const HANDSHAKE_REQUEST_LEN: usize = 72;

/// Exact payload size of a handshake response frame.
pub const HANDSHAKE_RESPONSE_LEN: usize = 48;

// ── Handshake request ─────────────────────────────────────────────────────────

/// First frame a client sends after connecting.
///
/// Wire size: 72 bytes. Deliberately has no `Debug` impl: it carries the
/// shared secret.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HandshakeRequest {
    /// Must equal `HANDSHAKE_MAGIC`.
    pub magic: U32<BigEndian>,

    /// Must equal `HANDSHAKE_VERSION`.
    pub version: U16<BigEndian>,

    /// Bit flags:
    ///   bit 0: FLAG_HAS_RESUME
    ///   bits 1-15: ignored by the broker
    pub flags: U16<BigEndian>,

    /// Token issued by a previous handshake. Meaningful only with FLAG_HAS_RESUME.
    pub resume_token: [u8; RESUME_TOKEN_LEN],

    /// The broker's shared secret, as read by the client from the private dir.
    pub secret_token: [u8; SECRET_TOKEN_LEN],
}

assert_eq_size!(HandshakeRequest, [u8; HANDSHAKE_REQUEST_LEN]);

impl HandshakeRequest {
    pub fn new(secret: &[u8; SECRET_TOKEN_LEN], resume: Option<&[u8; RESUME_TOKEN_LEN]>) -> Self {
        let (flags, resume_token) = match resume {
            Some(token) => (FLAG_HAS_RESUME, *token),
            None => (0, [0u8; RESUME_TOKEN_LEN]),
        };
        Self {
            magic: U32::new(HANDSHAKE_MAGIC),
            version: U16::new(HANDSHAKE_VERSION),
            flags: U16::new(flags),
            resume_token,
            secret_token: *secret,
        }
    }

    /// Decode a frame payload. Anything but exactly 72 bytes is rejected.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Self::read_from(payload).ok_or(WireError::BadLength {
            expected: HANDSHAKE_REQUEST_LEN,
            actual: payload.len(),
        })
    }

    pub fn wants_resume(&self) -> bool {
        self.flags.get() & FLAG_HAS_RESUME != 0
    }
}

// ── Handshake response ────────────────────────────────────────────────────────

/// Broker reply to an authenticated handshake.
///
/// Wire size: 48 bytes. Only sent once the secret has verified; failed
/// authentication closes the socket without writing this.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HandshakeResponse {
    pub magic: U32<BigEndian>,
    pub version: U16<BigEndian>,

    /// One of `HandshakeStatus`.
    pub status: U16<BigEndian>,

    /// Fresh resume token. All zero unless status is OK.
    pub resume_token: [u8; RESUME_TOKEN_LEN],

    /// Trailer: idle TTL the broker applies to this session, in seconds.
    pub idle_ttl_secs: U32<BigEndian>,

    /// Trailer: absolute lifetime of the session lineage, in seconds.
    pub absolute_ttl_secs: U32<BigEndian>,
}

assert_eq_size!(HandshakeResponse, [u8; HANDSHAKE_RESPONSE_LEN]);

impl HandshakeResponse {
    pub fn ok(resume_token: [u8; RESUME_TOKEN_LEN], idle_ttl_secs: u32, absolute_ttl_secs: u32) -> Self {
        Self {
            magic: U32::new(HANDSHAKE_MAGIC),
            version: U16::new(HANDSHAKE_VERSION),
            status: U16::new(HandshakeStatus::Ok.into()),
            resume_token,
            idle_ttl_secs: U32::new(idle_ttl_secs),
            absolute_ttl_secs: U32::new(absolute_ttl_secs),
        }
    }

    pub fn rejected(status: HandshakeStatus, idle_ttl_secs: u32, absolute_ttl_secs: u32) -> Self {
        Self {
            status: U16::new(status.into()),
            resume_token: [0u8; RESUME_TOKEN_LEN],
            ..Self::ok([0u8; RESUME_TOKEN_LEN], idle_ttl_secs, absolute_ttl_secs)
        }
    }

    /// Decode and validate magic/version. The status is returned as-is; callers
    /// map it with `HandshakeStatus::try_from`.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let resp = Self::read_from(payload).ok_or(WireError::BadLength {
            expected: HANDSHAKE_RESPONSE_LEN,
            actual: payload.len(),
        })?;
        if resp.magic.get() != HANDSHAKE_MAGIC {
            return Err(WireError::BadMagic(resp.magic.get()));
        }
        if resp.version.get() != HANDSHAKE_VERSION {
            return Err(WireError::UnsupportedVersion(resp.version.get()));
        }
        Ok(resp)
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Handshake status codes.
///
/// BadMagic, BadVersion and TokenUnknown exist for wire compatibility; the
/// broker answers authentication failures by closing the socket instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandshakeStatus {
    Ok = 0,
    BadMagic = 1,
    BadVersion = 2,
    TokenExpired = 3,
    TokenUnknown = 4,
    Full = 5,
    BadRequest = 6,
    Internal = 7,
}

impl TryFrom<u16> for HandshakeStatus {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HandshakeStatus::Ok),
            1 => Ok(HandshakeStatus::BadMagic),
            2 => Ok(HandshakeStatus::BadVersion),
            3 => Ok(HandshakeStatus::TokenExpired),
            4 => Ok(HandshakeStatus::TokenUnknown),
            5 => Ok(HandshakeStatus::Full),
            6 => Ok(HandshakeStatus::BadRequest),
            7 => Ok(HandshakeStatus::Internal),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl From<HandshakeStatus> for u16 {
    fn from(s: HandshakeStatus) -> u16 {
        s as u16
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("handshake payload is {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("bad handshake magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported handshake version: {0}")]
    UnsupportedVersion(u16),

    #[error("unknown handshake status: {0}")]
    UnknownStatus(u16),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
