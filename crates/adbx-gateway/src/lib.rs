//! adbx-gateway: policy-checked SQL execution with tokenized results.

pub mod analysis;
pub mod backend;
pub mod gateway;
pub mod profile;
pub mod tokenize;

pub use backend::{Backend, ResultSet, SqliteBackend};
pub use gateway::{GatewayError, QueryGateway, SessionAuth};
pub use profile::ConnectionProfile;
pub use tokenize::{Token, TokenEngine};
