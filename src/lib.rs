//! dfuse Rust Client
//!
//! A Rust client for dfuse GraphQL endpoints served over gRPC, with automatic API token
//! issuance, persistence and refresh, and subscriptions that survive transient failures.
//!
//! ```no_run
//! use dfuse_client::{Client, ClientConfig, Context, GraphqlOptions};
//!
//! # async fn run() -> dfuse_client::Result<()> {
//! let client = Client::new("mainnet.eos.dfuse.io", "server_0123456789abcdef", ClientConfig::default())?;
//! let ctx = Context::background();
//!
//! let mut stream = client
//!     .graphql_subscription(
//!         &ctx,
//!         "subscription ($query: String!) { searchTransactionsForward(query: $query) { cursor } }",
//!         GraphqlOptions::new().variable("query", "receiver:eosio.token"),
//!     )
//!     .await?;
//!
//! while let Some(response) = stream.recv().await? {
//!     println!("{}", response.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth_client;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod global;
pub mod proto;
pub mod stream;
pub mod token_store;
pub mod types;

pub use auth_client::{CredentialManager, HttpTokenIssuer};
pub use client::{Client, GraphqlDocument, GraphqlOptions, GraphqlSubscriber};
pub use config::{ClientConfig, TransportMode};
pub use connection::{ConnectionManager, Connector, GrpcConnector};
pub use context::{Context, ContextError};
pub use error::{ClientError, Result};
pub use stream::{is_transient, LastError, MessageStream, ResilientStream, StreamState, Subscribe};
pub use token_store::{FileTokenStore, InMemoryTokenStore, KeyedFileTokenStore, TokenStore};
pub use types::{AccessToken, ApiKey, Clock, SystemClock};
