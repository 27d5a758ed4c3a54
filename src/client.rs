//! GraphQL over gRPC client

use crate::auth_client::{CredentialManager, HttpTokenIssuer};
use crate::config::ClientConfig;
use crate::connection::{resolve_address, ConnectionManager, GrpcConnector};
use crate::context::Context;
use crate::error::{ClientError, Result};
use crate::proto::{self, GraphQlClient, Request, Response};
use crate::stream::{ResilientStream, Subscribe};
use crate::token_store::{KeyedFileTokenStore, TokenStore};
use crate::types::{AccessToken, ApiKey};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::codec::Streaming;
use tonic::metadata::{Ascii, MetadataValue};
use tracing::{debug, info};

/// Client of a dfuse GraphQL endpoint
///
/// Cloning is cheap, clones share the connection and the cached credentials.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// `None` when authentication is disabled
    credentials: Option<CredentialManager>,
    connections: ConnectionManager<GrpcConnector>,
    reconnect_delay: Duration,
    max_message_size: usize,
}

impl Client {
    /// Create a client for `network`, an endpoint address with or without a port
    ///
    /// Nothing is dialed and no token is issued until the first call.
    pub fn new(network: &str, api_key: &str, config: ClientConfig) -> Result<Self> {
        if network.is_empty() {
            return Err(ClientError::Configuration("network is required".to_string()));
        }

        let api_key = ApiKey::new(api_key);
        let credentials = if config.authenticated {
            if api_key.is_empty() {
                return Err(ClientError::Configuration(
                    "api key is required when authentication is enabled".to_string(),
                ));
            }

            let store: Arc<dyn TokenStore> = match config.store {
                Some(store) => store,
                None => Arc::new(KeyedFileTokenStore::new(&api_key)?),
            };

            let issuer = HttpTokenIssuer::new(&config.auth_url, api_key.clone(), config.auth_timeout)?;
            Some(CredentialManager::new(issuer, store))
        } else {
            None
        };

        let address = resolve_address(network, config.port, config.transport);
        let connector = GrpcConnector::new(address, config.transport);

        info!(
            address = %connector.address(),
            transport = ?config.transport,
            api_key = %api_key,
            authenticated = config.authenticated,
            "Created dfuse client"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                credentials,
                connections: ConnectionManager::new(connector),
                reconnect_delay: config.reconnect_delay,
                max_message_size: config.max_message_size,
            }),
        })
    }

    /// Address dialed by this client
    pub fn address(&self) -> &str {
        self.inner.connections.connector().address()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.credentials.is_some()
    }

    /// Current access token, issuing a new one when the cached one is about to expire
    ///
    /// A client with authentication disabled holds no token, this returns
    /// [`ClientError::Configuration`] without touching any token store.
    pub async fn api_token_info(&self, ctx: &Context) -> Result<AccessToken> {
        match &self.inner.credentials {
            Some(credentials) => credentials.resolve_token(ctx).await,
            None => Err(ClientError::Configuration(
                "client has authentication disabled, it holds no API token".to_string(),
            )),
        }
    }

    /// Run a query and return its single response
    pub async fn graphql_query(
        &self,
        ctx: &Context,
        document: &str,
        options: GraphqlOptions,
    ) -> Result<Response> {
        let mut stream = self.execute(ctx, options.into_request(document)?).await?;

        let response = ctx
            .run(async { stream.message().await.map_err(ClientError::from) })
            .await?;

        response.ok_or_else(|| {
            ClientError::InvalidResponse("query completed without sending a response".to_string())
        })
    }

    /// Start a subscription that reconnects on transient failures
    ///
    /// The stream lives as long as `ctx`, cancelling it ends the subscription.
    pub async fn graphql_subscription(
        &self,
        ctx: &Context,
        document: &str,
        options: GraphqlOptions,
    ) -> Result<ResilientStream<GraphqlSubscriber>> {
        let subscriber = GraphqlSubscriber {
            client: self.clone(),
            request: options.into_request(document)?,
        };

        Ok(ResilientStream::connect(ctx.clone(), subscriber)
            .await?
            .with_reconnect_delay(self.inner.reconnect_delay))
    }

    /// Start a call and hand back the raw gRPC stream, without any reconnection
    pub async fn raw_graphql(
        &self,
        ctx: &Context,
        document: &str,
        options: GraphqlOptions,
    ) -> Result<Streaming<Response>> {
        self.execute(ctx, options.into_request(document)?).await
    }

    async fn execute(&self, ctx: &Context, request: Request) -> Result<Streaming<Response>> {
        let mut request = tonic::Request::new(request);

        if let Some(credentials) = &self.inner.credentials {
            let token = credentials.resolve_token(ctx).await?;
            request
                .metadata_mut()
                .insert("authorization", authorization_value(&token)?);
        }

        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }

        let channel = self.inner.connections.connection(ctx).await?;
        let mut client =
            GraphQlClient::new(channel).max_decoding_message_size(self.inner.max_message_size);

        debug!(address = %self.address(), "Executing GraphQL document");
        let response = ctx
            .run(async { client.execute(request).await.map_err(ClientError::from) })
            .await?;

        Ok(response.into_inner())
    }
}

fn authorization_value(token: &AccessToken) -> Result<MetadataValue<Ascii>> {
    format!("Bearer {}", token.token).parse().map_err(|_| {
        ClientError::InvalidResponse("access token is not a valid header value".to_string())
    })
}

/// Re-executes the same request for a [`ResilientStream`], with fresh credentials
pub struct GraphqlSubscriber {
    client: Client,
    request: Request,
}

#[async_trait]
impl Subscribe for GraphqlSubscriber {
    type Stream = Streaming<Response>;

    async fn subscribe(&self, ctx: &Context) -> Result<Streaming<Response>> {
        self.client.execute(ctx, self.request.clone()).await
    }
}

/// Variables and operation name of a GraphQL call
#[derive(Debug, Clone, Default)]
pub struct GraphqlOptions {
    variables: Map<String, JsonValue>,
    operation_name: Option<String>,
}

impl GraphqlOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `variables`, a key set more than once keeps its last value
    pub fn variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Merge variables given as a JSON object
    pub fn variables_json(self, variables: JsonValue) -> Result<Self> {
        match variables {
            JsonValue::Object(map) => Ok(self.variables(map)),
            JsonValue::Null => Ok(self),
            other => Err(ClientError::InvalidVariables(format!(
                "variables must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn get_variables(&self) -> &Map<String, JsonValue> {
        &self.variables
    }

    fn into_request(self, document: &str) -> Result<Request> {
        let variables = if self.variables.is_empty() {
            None
        } else {
            Some(proto::to_struct(self.variables)?)
        };

        Ok(Request {
            query: document.to_string(),
            variables,
            operation_name: self.operation_name.unwrap_or_default(),
        })
    }
}

/// Where a GraphQL document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphqlDocument {
    Inline(String),
    File(PathBuf),
}

impl GraphqlDocument {
    pub async fn load(&self) -> Result<String> {
        match self {
            GraphqlDocument::Inline(document) => Ok(document.clone()),
            GraphqlDocument::File(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ClientError::Document {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

impl From<&str> for GraphqlDocument {
    fn from(document: &str) -> Self {
        GraphqlDocument::Inline(document.to_string())
    }
}
