//! Client side of the broker protocol.
//!
//! Connects, reads the shared secret, offers the stored resume token for its
//! caller identity if there is one, and exchanges JSON-RPC frames.

use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::net::UnixStream;
use zerocopy::AsBytes;

use adbx_core::crypto::{ResumeToken, SecretError, SecretToken};
use adbx_core::frame::{read_frame, write_frame, FrameError};
use adbx_core::identity::{CallerIdentity, ProcIdentity};
use adbx_core::privdir::PrivateDir;
use adbx_core::resume::ResumeTokenStore;
use adbx_core::wire::{HandshakeRequest, HandshakeResponse, HandshakeStatus, WireError};

use crate::dispatch::{TOOL_RUN_SQL_QUERY, TOOL_RUN_SQL_QUERY_TOKENS};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_path: PathBuf,
    pub secret_path: PathBuf,
    pub store: Option<ResumeTokenStore>,
    /// Identity to look the resume token up under. Defaults to this
    /// process's parent, resolved the way the broker resolves its peers.
    pub identity: Option<CallerIdentity>,
}

impl ClientOptions {
    pub fn for_private_dir(dir: &PrivateDir, socket_name: &str) -> Self {
        Self {
            socket_path: dir.socket_path(socket_name),
            secret_path: dir.secret_path(),
            store: None,
            identity: ProcIdentity::default().parent_identity(std::process::id()).ok(),
        }
    }

    pub fn with_store(mut self, store: ResumeTokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

pub struct BrokerClient {
    stream: UnixStream,
    resume_token: ResumeToken,
    offered_resume: bool,
    idle_ttl_secs: u32,
    absolute_ttl_secs: u32,
    next_id: u64,
}

impl BrokerClient {
    pub async fn connect(options: &ClientOptions) -> Result<Self, ClientError> {
        let secret_path = options.secret_path.clone();
        let store = options.store.clone();
        let identity = options.identity;
        let (secret, stored) = tokio::task::spawn_blocking(move || {
            let secret = SecretToken::load(&secret_path)?;
            let stored = match (&store, identity) {
                (Some(store), Some(id)) => store.lookup(&id),
                _ => None,
            };
            Ok::<_, SecretError>((secret, stored))
        })
        .await
        .map_err(|e| ClientError::Io(std::io::Error::other(e)))??;

        let mut stream = UnixStream::connect(&options.socket_path).await?;
        let request = HandshakeRequest::new(secret.expose(), stored.as_ref().map(|t| t.as_bytes()));
        write_frame(&mut stream, request.as_bytes()).await?;

        let payload = match read_frame(&mut stream).await {
            Ok(p) => p,
            Err(FrameError::Closed) => return Err(ClientError::Refused),
            Err(e) => return Err(e.into()),
        };
        let response = HandshakeResponse::decode(&payload)?;
        let status = HandshakeStatus::try_from(response.status.get())?;
        if status != HandshakeStatus::Ok {
            return Err(ClientError::Rejected(status));
        }

        Ok(Self {
            stream,
            resume_token: ResumeToken::from_bytes(response.resume_token),
            offered_resume: stored.is_some(),
            idle_ttl_secs: response.idle_ttl_secs.get(),
            absolute_ttl_secs: response.absolute_ttl_secs.get(),
            next_id: 1,
        })
    }

    /// The token the broker issued for this session.
    pub fn resume_token(&self) -> &ResumeToken {
        &self.resume_token
    }

    /// Whether a stored resume token was offered in the handshake.
    pub fn offered_resume(&self) -> bool {
        self.offered_resume
    }

    pub fn idle_ttl_secs(&self) -> u32 {
        self.idle_ttl_secs
    }

    pub fn absolute_ttl_secs(&self) -> u32 {
        self.absolute_ttl_secs
    }

    /// Send one raw payload and wait for the reply payload.
    pub async fn call(&mut self, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        write_frame(&mut self.stream, payload).await?;
        match read_frame(&mut self.stream).await {
            Ok(reply) => Ok(reply),
            Err(FrameError::Closed) => Err(ClientError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Send a JSON-RPC request and return the whole response object.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let reply = self.call(body.to_string().as_bytes()).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    pub async fn run_sql_query(&mut self, connection: &str, query: &str) -> Result<Value, ClientError> {
        let arguments = json!({ "connectionName": connection, "query": query });
        self.request("tools/call", json!({ "name": TOOL_RUN_SQL_QUERY, "arguments": arguments }))
            .await
    }

    pub async fn run_sql_query_tokens(
        &mut self,
        connection: &str,
        query: &str,
        parameters: &[String],
    ) -> Result<Value, ClientError> {
        let arguments = json!({ "connectionName": connection, "query": query, "parameters": parameters });
        self.request("tools/call", json!({ "name": TOOL_RUN_SQL_QUERY_TOKENS, "arguments": arguments }))
            .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("invalid reply: {0}")]
    Json(#[from] serde_json::Error),
    /// The broker closed the connection without answering the handshake.
    #[error("broker refused the handshake")]
    Refused,
    #[error("broker rejected the handshake with {0:?}")]
    Rejected(HandshakeStatus),
    #[error("broker closed the session")]
    Closed,
}
