//! Caller identity: the (pid, start time) pair a resume token is keyed by.
//!
//! The pid alone is not an identity: pids are recycled. Pairing it with the
//! process start time (clock ticks since boot, field 22 of `/proc/<pid>/stat`)
//! makes a key that a later process reusing the pid cannot reproduce.
//!
//! The identity is that of the client's *parent*: the long-lived agent host
//! that spawns short-lived client processes. Shell and `env` wrappers between
//! the two are skipped.

use std::fmt;
use std::path::PathBuf;

/// Parent command names treated as transparent wrappers.
const WRAPPER_COMMS: &[&str] = &["sh", "bash", "dash", "zsh", "fish", "env"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub pid: u32,
    pub start_ticks: u64,
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pid, self.start_ticks)
    }
}

/// Resolves the identity a connecting peer should be keyed under.
pub trait IdentitySource: Send + Sync {
    /// `peer_pid` is the pid reported by the socket's peer credentials.
    fn resolve(&self, peer_pid: u32) -> Result<CallerIdentity, IdentityError>;
}

/// The fields of `/proc/<pid>/stat` this module needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    pub start_ticks: u64,
}

impl ProcStat {
    /// Parse a stat line. `comm` may itself contain spaces and parentheses,
    /// so the remaining fields are split after the *last* `)`.
    pub fn parse(line: &str) -> Result<Self, IdentityError> {
        let open = line.find('(').ok_or(IdentityError::Malformed("missing '('"))?;
        let close = line.rfind(')').ok_or(IdentityError::Malformed("missing ')'"))?;
        if close < open {
            return Err(IdentityError::Malformed("unbalanced comm"));
        }
        let pid = line[..open]
            .trim()
            .parse()
            .map_err(|_| IdentityError::Malformed("bad pid"))?;
        let comm = line[open + 1..close].to_string();

        // Fields after the comm start at field 3 (state).
        let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();
        let ppid = rest
            .get(1)
            .and_then(|v| v.parse().ok())
            .ok_or(IdentityError::Malformed("bad ppid"))?;
        let start_ticks = rest
            .get(19)
            .and_then(|v| v.parse().ok())
            .ok_or(IdentityError::Malformed("bad starttime"))?;

        Ok(Self { pid, comm, ppid, start_ticks })
    }
}

/// `IdentitySource` backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcIdentity {
    proc_root: PathBuf,
}

impl Default for ProcIdentity {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcIdentity {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }

    pub fn stat(&self, pid: u32) -> Result<ProcStat, IdentityError> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        let line = std::fs::read_to_string(&path).map_err(|e| IdentityError::Unreadable(pid, e))?;
        ProcStat::parse(&line)
    }

    /// Identity of `pid`'s parent, hopping over one wrapper process.
    pub fn parent_identity(&self, pid: u32) -> Result<CallerIdentity, IdentityError> {
        let child = self.stat(pid)?;
        if child.ppid == 0 {
            return Err(IdentityError::NoParent(pid));
        }
        let mut parent = self.stat(child.ppid)?;
        if WRAPPER_COMMS.contains(&parent.comm.as_str()) && parent.ppid != 0 {
            tracing::debug!(wrapper = %parent.comm, pid = parent.pid, "skipping wrapper parent");
            parent = self.stat(parent.ppid)?;
        }
        Ok(CallerIdentity {
            pid: parent.pid,
            start_ticks: parent.start_ticks,
        })
    }
}

impl IdentitySource for ProcIdentity {
    fn resolve(&self, peer_pid: u32) -> Result<CallerIdentity, IdentityError> {
        self.parent_identity(peer_pid)
    }
}

/// Always resolves to the same identity. For tests and single-tenant setups.
#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub CallerIdentity);

impl IdentitySource for FixedIdentity {
    fn resolve(&self, _peer_pid: u32) -> Result<CallerIdentity, IdentityError> {
        Ok(self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("cannot read stat for pid {0}: {1}")]
    Unreadable(u32, std::io::Error),
    #[error("malformed stat line: {0}")]
    Malformed(&'static str),
    #[error("pid {0} has no parent")]
    NoParent(u32),
    #[error("peer credentials carry no pid")]
    NoPeerPid,
}
