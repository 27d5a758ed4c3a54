//! Error types for the dfuse client

use crate::context::ContextError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Token store {path:?}: {source}")]
    TokenStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The issuance endpoint answered with a non-success status. `body` is the raw response
    /// text, kept for diagnostics only.
    #[error("Token issuance failed (code {status}): {body}")]
    Issuance { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A refresh shared between concurrent callers failed.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(Arc<ClientError>),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    RpcStatus(#[from] tonic::Status),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Invalid variables: {0}")]
    InvalidVariables(String),

    #[error("Unable to load GraphQL document {path:?}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream already failed, open a new subscription")]
    StreamClosed,

    #[error("Global client is not registered, call `dfuse_client::global::register` first")]
    NoGlobalClient,
}

impl ClientError {
    /// The gRPC status carried by this error, looking through shared refresh failures.
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            ClientError::RpcStatus(status) => Some(status),
            ClientError::TokenRefresh(inner) => inner.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
