//! Owner-only private directory layout.
//!
//! ```text
//! <base>/              0700
//!   run/<socket>       control socket
//!   secret/token       32-byte shared secret, 0600
//!   state/generation   token generation counter
//! ```
//!
//! Every directory must be owned by the current uid with mode exactly 0700.
//! Anything else is refused rather than repaired.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::socket::UnixAddr;
use nix::unistd::getuid;

use crate::crypto::random_bytes;

pub const APP_NAME: &str = "adbx";
pub const DEFAULT_SOCKET_NAME: &str = "broker.sock";
const SECRET_FILE: &str = "token";
const GENERATION_FILE: &str = "generation";

#[derive(Debug, Clone)]
pub struct PrivateDir {
    base: PathBuf,
}

impl PrivateDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `$XDG_RUNTIME_DIR/adbx`, then `$TMPDIR/adbx`, then `/tmp/adbx-<uid>`.
    pub fn default_base() -> PathBuf {
        runtime_base(APP_NAME)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn secret_dir(&self) -> PathBuf {
        self.base.join("secret")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.join("state")
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(name)
    }

    pub fn secret_path(&self) -> PathBuf {
        self.secret_dir().join(SECRET_FILE)
    }

    pub fn generation_path(&self) -> PathBuf {
        self.state_dir().join(GENERATION_FILE)
    }

    /// Create (or validate) the whole tree.
    pub fn ensure(&self) -> Result<(), PrivateDirError> {
        for dir in [self.base.clone(), self.run_dir(), self.secret_dir(), self.state_dir()] {
            ensure_owner_only_dir(&dir)?;
        }
        Ok(())
    }

    /// Fail early when the socket path would not fit in `sun_path`.
    pub fn check_socket_path(&self, name: &str) -> Result<PathBuf, PrivateDirError> {
        let path = self.socket_path(name);
        UnixAddr::new(&path).map_err(|_| PrivateDirError::SocketPathTooLong(path.clone()))?;
        Ok(path)
    }

    /// Read the persisted generation, add one, persist it, and return it.
    /// A missing file counts as generation 0.
    pub fn bump_generation(&self) -> Result<u32, PrivateDirError> {
        let path = self.generation_path();
        let current = match fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse::<u32>()
                .map_err(|_| PrivateDirError::CorruptGeneration(path.clone()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(PrivateDirError::Io(path, e)),
        };
        let next = current.wrapping_add(1);
        write_atomic(&path, next.to_string().as_bytes(), 0o600)
            .map_err(|e| PrivateDirError::Io(path.clone(), e))?;
        Ok(next)
    }
}

/// Runtime base directory for `name`, following the XDG fallback chain.
pub fn runtime_base(name: &str) -> PathBuf {
    for var in ["XDG_RUNTIME_DIR", "TMPDIR"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return PathBuf::from(v).join(name);
            }
        }
    }
    PathBuf::from(format!("/tmp/{name}-{}", getuid().as_raw()))
}

/// Create `path` with mode 0700 if missing; otherwise require it to be a
/// directory owned by us with mode exactly 0700.
pub fn ensure_owner_only_dir(path: &Path) -> Result<(), PrivateDirError> {
    match fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => {
            // The umask may have narrowed the mode; pin it.
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                .map_err(|e| PrivateDirError::Io(path.to_path_buf(), e))?;
            return Ok(());
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(PrivateDirError::Io(path.to_path_buf(), e)),
    }
    check_owner_only_dir(path)
}

/// Validate without creating.
pub fn check_owner_only_dir(path: &Path) -> Result<(), PrivateDirError> {
    let meta = fs::symlink_metadata(path).map_err(|e| PrivateDirError::Io(path.to_path_buf(), e))?;
    if !meta.is_dir() {
        return Err(PrivateDirError::NotADirectory(path.to_path_buf()));
    }
    let uid = getuid().as_raw();
    if meta.uid() != uid {
        return Err(PrivateDirError::WrongOwner(path.to_path_buf(), meta.uid()));
    }
    let mode = meta.mode() & 0o777;
    if mode != 0o700 {
        return Err(PrivateDirError::InsecureMode(path.to_path_buf(), mode));
    }
    Ok(())
}

/// Write `data` to a sibling temp file with `mode`, fsync, then rename over
/// `path`. Readers see the old content or the new, never a partial write.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?;
    let suffix: [u8; 8] = random_bytes();
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", hex::encode(suffix)));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[derive(Debug, thiserror::Error)]
pub enum PrivateDirError {
    #[error("{0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("{0} is owned by uid {1}, not the current user")]
    WrongOwner(PathBuf, u32),
    #[error("{0} has mode {1:o}, expected 700")]
    InsecureMode(PathBuf, u32),
    #[error("socket path {0} does not fit in sun_path")]
    SocketPathTooLong(PathBuf),
    #[error("generation file {0} is corrupt")]
    CorruptGeneration(PathBuf),
}
