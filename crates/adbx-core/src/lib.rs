//! adbx-core: wire format, framing, secrets, identity and on-disk state
//! shared by the broker and its clients. All other adbx crates depend on this one.

pub mod config;
pub mod crypto;
pub mod frame;
pub mod identity;
pub mod privdir;
pub mod resume;
pub mod wire;

pub use crypto::{ResumeToken, SecretToken};
pub use identity::{CallerIdentity, IdentitySource, ProcIdentity};
pub use resume::ResumeTokenStore;
