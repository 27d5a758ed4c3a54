//! Query or stream a dfuse GraphQL over gRPC endpoint
//!
//! Usage:
//!   dgql testnet.eos.dfuse.io:443 stream_transactions.graphql '{"query":"receiver:eosio"}'
//!   dgql localhost:13023 - variables.json < document.graphql
//!   dgql '*staging.example.com:443' document.graphql
//!
//! A `*` anywhere in the endpoint selects TLS without certificate verification, unless a
//! transport flag is given.

use anyhow::{bail, Context as _};
use clap::Parser;
use dfuse_client::proto::Response;
use dfuse_client::{Client, ClientConfig, Context, GraphqlDocument, GraphqlOptions, TransportMode};
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dgql", about = "Query/stream dfuse GraphQL over gRPC interface.")]
struct Args {
    /// Endpoint to connect to, a port is appended when absent
    endpoint: String,

    /// GraphQL document: a file path, `-` for standard input or the document itself
    document: String,

    /// Variables as inline JSON or a JSON file path
    variables: Option<String>,

    /// API key converted into an API token, the endpoint is assumed unauthenticated when empty
    #[arg(short = 'a', long, env = "DFUSE_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Authentication server used to convert the API key into an API token
    #[arg(long, env = "DFUSE_AUTH_URL")]
    auth_url: Option<String>,

    /// Plain-text gRPC connection (no TLS), the default for localhost endpoints
    #[arg(short = 'p', long, conflicts_with = "insecure")]
    plain_text: bool,

    /// TLS connection skipping server certificate verification, for local endpoints
    #[arg(short = 'i', long)]
    insecure: bool,

    /// Print each response untouched, `data` stays a JSON encoded string
    #[arg(short = 'r', long)]
    raw: bool,
}

impl Args {
    fn transport(&self) -> TransportMode {
        if self.plain_text {
            return TransportMode::PlainText;
        }

        if self.insecure || self.endpoint.contains('*') {
            return TransportMode::InsecureTls;
        }

        if is_localhost(&self.endpoint) {
            TransportMode::PlainText
        } else {
            TransportMode::SecureTls
        }
    }

    /// Endpoint without the insecure marker
    fn endpoint(&self) -> String {
        self.endpoint.replace('*', "")
    }

    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::default().with_transport(self.transport());

        if self.api_key.is_empty() {
            config = config.without_authentication();
        }

        if let Some(auth_url) = self.auth_url.as_deref().filter(|url| !url.is_empty()) {
            config = config.with_auth_url(auth_url);
        }

        config
    }
}

fn is_localhost(endpoint: &str) -> bool {
    let host = endpoint.split(':').next().unwrap_or_default();
    host.eq_ignore_ascii_case("localhost")
}

async fn read_document(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut document = String::new();
        tokio::io::stdin()
            .read_to_string(&mut document)
            .await
            .context("unable to read GraphQL document from standard input")?;
        return Ok(document);
    }

    let document = if Path::new(input).is_file() {
        GraphqlDocument::File(PathBuf::from(input))
    } else {
        GraphqlDocument::from(input)
    };

    Ok(document.load().await?)
}

async fn read_variables(input: Option<&str>) -> anyhow::Result<GraphqlOptions> {
    let Some(input) = input.filter(|input| !input.is_empty()) else {
        return Ok(GraphqlOptions::new());
    };

    let content = if Path::new(input).is_file() {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("unable to read variables file {input:?}"))?
    } else {
        input.to_string()
    };

    let variables: JsonValue =
        serde_json::from_str(&content).context("unable to unmarshal variables")?;

    Ok(GraphqlOptions::new().variables_json(variables)?)
}

fn print_response(response: &Response, raw: bool) -> anyhow::Result<()> {
    if raw {
        let errors: Vec<JsonValue> = response.errors.iter().map(|e| e.to_json()).collect();
        println!("{}", json!({ "data": response.data, "errors": errors }));
        return Ok(());
    }

    if !response.errors.is_empty() {
        let errors: Vec<JsonValue> = response.errors.iter().map(|e| e.to_json()).collect();
        eprintln!("{}", JsonValue::Array(errors));
    }

    println!("{}", response.data_json().context("unable to decode response data")?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let endpoint = args.endpoint();
    if endpoint.is_empty() {
        bail!("the endpoint value must be specified");
    }

    let document = read_document(&args.document).await?;
    let options = read_variables(args.variables.as_deref()).await?;

    info!(endpoint = %endpoint, transport = ?args.transport(), raw = args.raw, "Performing GraphQL operation");
    let client = Client::new(&endpoint, &args.api_key, args.config())
        .context("unable to create dfuse client")?;

    let ctx = Context::background().with_cancel();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted, cancelling stream");
            interrupt.cancel();
        }
    });

    let mut stream = client
        .graphql_subscription(&ctx, &document, options)
        .await
        .context("unable to open dfuse GraphQL over gRPC stream")?;

    while let Some(response) = stream
        .recv()
        .await
        .context("an error occurred while streaming results")?
    {
        print_response(&response, args.raw)?;
    }

    debug!("Stream completed");
    Ok(())
}
