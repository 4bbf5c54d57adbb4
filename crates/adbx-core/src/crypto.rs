//! Secret material: the broker's shared secret and resume tokens.
//!
//! - `SecretToken`: 32 random bytes, one per broker, stored owner-only under the
//!   private dir. Loaded once at startup; a broker never runs without it.
//! - `ResumeToken`: 32 random bytes identifying a resumable session lineage.
//!
//! Both zeroize on drop and redact themselves in `Debug`. Comparisons go
//! through `subtle` so they take the same time wherever the first mismatch is.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{RESUME_TOKEN_LEN, SECRET_TOKEN_LEN};

/// Fill a fixed-size array from the OS-seeded thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Constant-time equality. Length mismatch is simply `false`.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

// ── SecretToken ───────────────────────────────────────────────────────────────

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken([u8; SECRET_TOKEN_LEN]);

impl SecretToken {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; SECRET_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Load the secret from disk. Missing, unreadable, loosely-permissioned or
    /// wrongly-sized files are all errors; the caller treats them as fatal.
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SecretError::Missing(path.to_path_buf()),
            _ => SecretError::Unreadable(path.to_path_buf(), e),
        })?;
        if !meta.is_file() {
            return Err(SecretError::NotAFile(path.to_path_buf()));
        }
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(SecretError::InsecurePermissions(path.to_path_buf(), mode));
        }

        let mut data =
            fs::read(path).map_err(|e| SecretError::Unreadable(path.to_path_buf(), e))?;
        let result = <[u8; SECRET_TOKEN_LEN]>::try_from(data.as_slice())
            .map(Self)
            .map_err(|_| SecretError::BadLength(path.to_path_buf(), data.len()));
        data.zeroize();
        result
    }

    /// Write a fresh secret to `path` (mode 0600) unless a file already exists.
    /// Returns true when a new secret was written.
    pub fn provision(path: &Path) -> Result<bool, SecretError> {
        let secret = Self::generate();
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(SecretError::WriteFailed(path.to_path_buf(), e)),
        };
        file.write_all(&secret.0)
            .and_then(|_| file.sync_all())
            .map_err(|e| SecretError::WriteFailed(path.to_path_buf(), e))?;
        Ok(true)
    }

    /// Exact-length, full-byte comparison. Never says how a candidate failed.
    pub fn verify(&self, candidate: &[u8]) -> bool {
        ct_eq(&self.0, candidate)
    }

    /// Raw bytes, for building a client handshake.
    pub fn expose(&self) -> &[u8; SECRET_TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(<redacted>)")
    }
}

// ── ResumeToken ───────────────────────────────────────────────────────────────

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ResumeToken([u8; RESUME_TOKEN_LEN]);

impl ResumeToken {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; RESUME_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RESUME_TOKEN_LEN] {
        &self.0
    }

    pub fn matches(&self, candidate: &[u8]) -> bool {
        ct_eq(&self.0, candidate)
    }
}

impl PartialEq for ResumeToken {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for ResumeToken {}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeToken(<redacted>)")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret token {0} does not exist")]
    Missing(PathBuf),
    #[error("secret token {0} is unreadable: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("secret token {0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("secret token {0} has mode {1:o}, expected owner-only")]
    InsecurePermissions(PathBuf, u32),
    #[error("secret token {0} is {1} bytes, expected {SECRET_TOKEN_LEN}")]
    BadLength(PathBuf, usize),
    #[error("failed to write secret token {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
}
