//! Opt-in process wide client
//!
//! Applications that want a single shared [`Client`] register it once at startup and reach it
//! from anywhere through [`client`]. Nothing here is required, a [`Client`] can be passed around
//! explicitly instead.

use crate::client::{Client, GraphqlOptions, GraphqlSubscriber};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{ClientError, Result};
use crate::proto::Response;
use crate::stream::ResilientStream;
use crate::types::AccessToken;
use std::sync::OnceLock;

static GLOBAL_CLIENT: OnceLock<Client> = OnceLock::new();

/// Create the global client, fails when one is already registered
pub fn register(network: &str, api_key: &str, config: ClientConfig) -> Result<&'static Client> {
    set(Client::new(network, api_key, config)?)
}

/// Register an existing client as the global one
pub fn set(client: Client) -> Result<&'static Client> {
    GLOBAL_CLIENT
        .set(client)
        .map_err(|_| ClientError::Configuration("global client is already registered".to_string()))?;

    self::client()
}

pub fn client() -> Result<&'static Client> {
    GLOBAL_CLIENT.get().ok_or(ClientError::NoGlobalClient)
}

pub async fn api_token_info(ctx: &Context) -> Result<AccessToken> {
    client()?.api_token_info(ctx).await
}

pub async fn graphql_query(ctx: &Context, document: &str, options: GraphqlOptions) -> Result<Response> {
    client()?.graphql_query(ctx, document, options).await
}

pub async fn graphql_subscription(
    ctx: &Context,
    document: &str,
    options: GraphqlOptions,
) -> Result<ResilientStream<GraphqlSubscriber>> {
    client()?.graphql_subscription(ctx, document, options).await
}
