//! Wire schema of the `dfuse.graphql.v1.GraphQL` service
//!
//! Message definitions and the client stub mirror what `tonic-build` generates for
//! `dfuse/graphql/v1/graphql.proto`. They are written out so the crate builds without `protoc`.

use crate::error::{self, ClientError};
use prost_types::value::Kind;
use prost_types::{ListValue, NullValue, Struct, Value};
use serde_json::{Map, Number, Value as JsonValue};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

/// GraphQL document and its variables
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub query: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub variables: ::core::option::Option<Struct>,
    #[prost(string, tag = "3")]
    pub operation_name: ::prost::alloc::string::String,
}

/// One GraphQL result, a subscription produces many
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// JSON encoded `data` field of the GraphQL result
    #[prost(string, tag = "1")]
    pub data: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub errors: ::prost::alloc::vec::Vec<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub locations: ::prost::alloc::vec::Vec<SourceLocation>,
    #[prost(string, repeated, tag = "3")]
    pub path: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "4")]
    pub extensions: ::core::option::Option<Struct>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SourceLocation {
    #[prost(int32, tag = "1")]
    pub line: i32,
    #[prost(int32, tag = "2")]
    pub column: i32,
}

/// Client for the `dfuse.graphql.v1.GraphQL` service
#[derive(Debug, Clone)]
pub struct GraphQlClient {
    inner: tonic::client::Grpc<Channel>,
}

impl GraphQlClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Limits the maximum size of a decoded message
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_decoding_message_size(limit);
        self
    }

    /// Server streaming call: queries yield one response, subscriptions many
    pub async fn execute(
        &mut self,
        request: impl tonic::IntoRequest<Request>,
    ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<Response>>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::new(tonic::Code::Unknown, format!("Service was not ready: {e}"))
        })?;

        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/dfuse.graphql.v1.GraphQL/Execute");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }
}

/// Convert GraphQL variables to a protobuf `Struct`
pub fn to_struct(variables: Map<String, JsonValue>) -> error::Result<Struct> {
    let fields = variables
        .into_iter()
        .map(|(key, value)| Ok((key, to_value(value)?)))
        .collect::<error::Result<_>>()?;

    Ok(Struct { fields })
}

fn to_value(value: JsonValue) -> error::Result<Value> {
    let kind = match value {
        JsonValue::Null => Kind::NullValue(NullValue::NullValue as i32),
        JsonValue::Bool(b) => Kind::BoolValue(b),
        JsonValue::Number(n) => Kind::NumberValue(n.as_f64().ok_or_else(|| {
            ClientError::InvalidVariables(format!("number {n} is not representable as a double"))
        })?),
        JsonValue::String(s) => Kind::StringValue(s),
        JsonValue::Array(values) => Kind::ListValue(ListValue {
            values: values.into_iter().map(to_value).collect::<error::Result<_>>()?,
        }),
        JsonValue::Object(map) => Kind::StructValue(to_struct(map)?),
    };

    Ok(Value { kind: Some(kind) })
}

/// Convert a protobuf `Struct` back to JSON
pub fn from_struct(value: &Struct) -> JsonValue {
    JsonValue::Object(
        value
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), from_value(value)))
            .collect(),
    )
}

fn from_value(value: &Value) -> JsonValue {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::NumberValue(n)) => Number::from_f64(*n).map_or(JsonValue::Null, JsonValue::Number),
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::ListValue(list)) => JsonValue::Array(list.values.iter().map(from_value).collect()),
        Some(Kind::StructValue(s)) => from_struct(s),
    }
}

impl Response {
    /// Decoded `data` field, `null` when the server sent none
    pub fn data_json(&self) -> error::Result<JsonValue> {
        if self.data.is_empty() {
            return Ok(JsonValue::Null);
        }

        Ok(serde_json::from_str(&self.data)?)
    }

    /// The whole response as JSON, `data` decoded in place
    pub fn to_json(&self) -> error::Result<JsonValue> {
        let mut out = Map::new();
        out.insert("data".to_string(), self.data_json()?);
        if !self.errors.is_empty() {
            out.insert(
                "errors".to_string(),
                JsonValue::Array(self.errors.iter().map(Error::to_json).collect()),
            );
        }

        Ok(JsonValue::Object(out))
    }
}

impl Error {
    pub fn to_json(&self) -> JsonValue {
        let mut out = Map::new();
        out.insert("message".to_string(), JsonValue::String(self.message.clone()));

        if !self.locations.is_empty() {
            let locations = self
                .locations
                .iter()
                .map(|l| serde_json::json!({ "line": l.line, "column": l.column }))
                .collect();
            out.insert("locations".to_string(), JsonValue::Array(locations));
        }

        if !self.path.is_empty() {
            let path = self.path.iter().cloned().map(JsonValue::String).collect();
            out.insert("path".to_string(), JsonValue::Array(path));
        }

        if let Some(extensions) = &self.extensions {
            out.insert("extensions".to_string(), from_struct(extensions));
        }

        JsonValue::Object(out)
    }
}
