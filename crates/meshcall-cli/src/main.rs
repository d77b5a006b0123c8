//! meshcall - call a service method from the command line.
//!
//! Candidates are given directly with `--endpoint`, so no discovery backend
//! is needed. Everything else goes through the same endpoint options a
//! library user would set.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use meshcall_core::{
    options, CallOptions, Candidate, Client, CodecRegistry, EndpointBuilder, FailedAttempt,
    MemoryRegistry,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "meshcall")]
#[command(about = "Call meshcall services from the command line")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call one method and print the decoded reply as JSON
    Call(CallArgs),
    /// List the built-in body codecs
    Codecs,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Service name
    #[arg(short, long)]
    service: String,

    /// Method name
    #[arg(short, long)]
    method: String,

    /// Candidate address; repeat for several
    #[arg(short, long = "endpoint", required = true)]
    endpoints: Vec<String>,

    /// Request body as JSON; a bare word is sent as a string
    #[arg(short, long, default_value = "null")]
    body: String,

    /// Body codec name
    #[arg(long, default_value = "json")]
    codec: String,

    /// Network kind (tcp, tcp4, tcp6, unix)
    #[arg(long, default_value = "tcp")]
    network: String,

    /// Retries after the first attempt
    #[arg(short, long, default_value = "2")]
    retry: u32,

    /// Per-attempt deadline in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Dial timeout in milliseconds
    #[arg(long, default_value = "10000")]
    dial_timeout_ms: u64,

    /// Client certificate (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// CA bundle to verify the server against (PEM)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Name to verify the server certificate against
    #[arg(long)]
    server_name: Option<String>,

    /// Metadata entry as key=value; repeat for several
    #[arg(long = "meta")]
    meta: Vec<String>,

    /// Log every message header at debug level
    #[arg(long)]
    detail: bool,
}

#[derive(Serialize)]
struct CallOutput {
    reply: Value,
    served_by: String,
    attempts: u32,
    failures: Vec<FailedAttempt>,
    elapsed_ms: u128,
    slow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Call(args) => call(args, cli.debug).await,
        Command::Codecs => {
            for name in CodecRegistry::with_defaults().names() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

async fn call(args: CallArgs, debug: bool) -> Result<()> {
    let registry = Arc::new(MemoryRegistry::new());
    registry.set(
        &args.service,
        args.endpoints.iter().map(Candidate::new).collect(),
    );

    let mut builder = EndpointBuilder::new()
        .with(options::registry(registry))
        .with(options::network(&args.network))
        .with(options::body_codec(&args.codec))
        .with(options::retry_times(args.retry))
        .with(options::context_age(Duration::from_millis(args.timeout_ms)))
        .with(options::dial_timeout(Duration::from_millis(args.dial_timeout_ms)))
        .with(options::print_detail(args.detail))
        .with(options::count_time(debug));
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        builder = builder.with(options::tls_files(cert, key));
    }
    if let Some(ca) = &args.tls_ca {
        builder = builder.with(options::tls_ca_file(ca));
    }
    if let Some(name) = &args.server_name {
        builder = builder.with(options::tls_server_name(name));
    }
    let config = builder.build().context("Invalid endpoint settings")?;

    let mut call_options = CallOptions::new();
    for entry in &args.meta {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("Metadata must be key=value, got {:?}", entry);
        };
        call_options = call_options.with_meta(key, value);
    }

    let body: Value =
        serde_json::from_str(&args.body).unwrap_or_else(|_| Value::String(args.body.clone()));

    let client = Client::new(config);
    info!(
        "Calling {}.{} on {} candidate(s)",
        args.service,
        args.method,
        args.endpoints.len()
    );
    let result = client
        .invoke::<_, Value>(&args.service, &args.method, &body, call_options)
        .await;
    client.shutdown(Duration::from_secs(2)).await;

    let reply = result.with_context(|| format!("Call {}.{} failed", args.service, args.method))?;
    let output = CallOutput {
        reply: reply.body,
        served_by: reply.served_by,
        attempts: reply.attempts,
        failures: reply.failures,
        elapsed_ms: reply.elapsed.as_millis(),
        slow: reply.slow,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
