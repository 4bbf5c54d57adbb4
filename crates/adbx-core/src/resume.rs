//! Durable resume tokens, one file per caller identity.
//!
//! Layout: `<dir>/token-<pid>-<start_ticks>`, 32 raw bytes, mode 0600, in a
//! directory that must be owned by us with mode 0700.
//!
//! The store fails safe to off: if the directory or a token file is not
//! strictly owner-only, `lookup` reports nothing and `rotate` refuses to
//! write. Callers then fall back to a fresh, secret-authenticated session.
//!
//! All calls here block on file I/O. Async callers run them on a blocking
//! thread.

use std::fs;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::fcntl::OFlag;
use nix::unistd::getuid;

use crate::crypto::ResumeToken;
use crate::identity::CallerIdentity;
use crate::privdir::{check_owner_only_dir, ensure_owner_only_dir, runtime_base, write_atomic, PrivateDirError};
use crate::wire::RESUME_TOKEN_LEN;

pub const DEFAULT_STORE_NAME: &str = "adbx-resume";

#[derive(Debug, Clone)]
pub struct ResumeTokenStore {
    dir: PathBuf,
    idle_ttl: Duration,
}

impl ResumeTokenStore {
    /// Open the store at `dir`, creating it (0700) if needed. An existing
    /// directory with lax permissions is not an error here: the store opens,
    /// but every lookup reports nothing until the directory is fixed.
    pub fn open(dir: impl Into<PathBuf>, idle_ttl: Duration) -> Result<Self, ResumeStoreError> {
        let dir = dir.into();
        match ensure_owner_only_dir(&dir) {
            Ok(()) => {}
            Err(PrivateDirError::Io(path, e)) => return Err(ResumeStoreError::Io(path, e)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "resume store directory is not owner-only; resume disabled");
            }
        }
        Ok(Self { dir, idle_ttl })
    }

    /// `$XDG_RUNTIME_DIR/adbx-resume` with the usual fallbacks.
    pub fn default_dir() -> PathBuf {
        runtime_base(DEFAULT_STORE_NAME)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn token_path(&self, identity: &CallerIdentity) -> PathBuf {
        self.dir.join(format!("token-{}-{}", identity.pid, identity.start_ticks))
    }

    /// True when the directory currently passes the owner-only check.
    pub fn is_secure(&self) -> bool {
        check_owner_only_dir(&self.dir).is_ok()
    }

    /// The stored token for `identity`, if there is a valid, fresh one.
    ///
    /// `None` covers: missing file, insecure directory or file, wrong-size
    /// file (deleted on sight), and a token older than the idle TTL.
    pub fn lookup(&self, identity: &CallerIdentity) -> Option<ResumeToken> {
        if let Err(e) = check_owner_only_dir(&self.dir) {
            tracing::debug!(error = %e, "resume store insecure; lookup disabled");
            return None;
        }

        let path = self.token_path(identity);
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!(%identity, error = %e, "resume token unreadable");
                return None;
            }
        };
        if !meta.is_file() || meta.uid() != getuid().as_raw() || meta.mode() & 0o777 != 0o600 {
            tracing::warn!(%identity, "resume token file is not owner-only; ignoring");
            return None;
        }

        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age > self.idle_ttl {
            tracing::debug!(%identity, age_secs = age.as_secs(), "resume token expired");
            return None;
        }

        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(%identity, error = %e, "resume token unreadable");
                return None;
            }
        };
        match <[u8; RESUME_TOKEN_LEN]>::try_from(data.as_slice()) {
            Ok(bytes) => Some(ResumeToken::from_bytes(bytes)),
            Err(_) => {
                tracing::warn!(%identity, len = data.len(), "corrupt resume token removed");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Replace the token for `identity` with a fresh random one and return it.
    pub fn rotate(&self, identity: &CallerIdentity) -> Result<ResumeToken, ResumeStoreError> {
        check_owner_only_dir(&self.dir).map_err(|e| ResumeStoreError::Insecure(e.to_string()))?;
        let token = ResumeToken::generate();
        let path = self.token_path(identity);
        write_atomic(&path, token.as_bytes(), 0o600).map_err(|e| ResumeStoreError::Io(path.clone(), e))?;
        // write_atomic creates with 0600, but an explicit chmod survives odd umasks.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| ResumeStoreError::Io(path, e))?;
        Ok(token)
    }

    /// Restart the idle clock on `identity`'s token, but only while the file
    /// still holds `token`. Returns false when another handshake has rotated
    /// it since, or when there is no file.
    pub fn refresh(&self, identity: &CallerIdentity, token: &ResumeToken) -> Result<bool, ResumeStoreError> {
        check_owner_only_dir(&self.dir).map_err(|e| ResumeStoreError::Insecure(e.to_string()))?;
        let path = self.token_path(identity);
        let io = |e: std::io::Error| ResumeStoreError::Io(path.clone(), e);

        let mut file = match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io(e)),
        };
        let meta = file.metadata().map_err(io)?;
        if !meta.is_file() || meta.uid() != getuid().as_raw() || meta.mode() & 0o777 != 0o600 {
            return Err(ResumeStoreError::Insecure(format!("{} is not owner-only", path.display())));
        }

        let mut data = Vec::with_capacity(RESUME_TOKEN_LEN);
        file.read_to_end(&mut data).map_err(io)?;
        if !token.matches(&data) {
            return Ok(false);
        }
        file.set_modified(SystemTime::now()).map_err(io)?;
        Ok(true)
    }

    /// Forget the token for `identity`. A missing file is not an error.
    pub fn remove(&self, identity: &CallerIdentity) -> Result<(), ResumeStoreError> {
        let path = self.token_path(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResumeStoreError::Io(path, e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeStoreError {
    #[error("{0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("resume store is not owner-only: {0}")]
    Insecure(String),
}
