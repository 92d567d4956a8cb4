use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use wsreq::{Client, ClientConfig, ConnectionState};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Config(#[from] wsreq::ConfigError),
    #[error("could not open connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error(transparent)]
    Client(#[from] wsreq::ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "wsreq-cli", about = "Request/response over a websocket endpoint")]
struct Cli {
    /// Endpoint; `http(s)://` is rewritten to `ws(s)://`.
    #[arg(long, env = "WSREQ_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    #[arg(long, env = "WSREQ_REQUEST_TIMEOUT_MS", default_value_t = wsreq::DEFAULT_REQUEST_TIMEOUT_MS)]
    timeout_ms: u64,

    #[arg(long, env = "WSREQ_CONNECT_TIMEOUT_MS", default_value_t = wsreq::DEFAULT_CONNECT_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print its response.
    Request(DataArgs),
    /// Send one fire-and-forget message.
    Send(DataArgs),
    /// Send every object line of a JSONL file as a request.
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
struct DataArgs {
    #[arg(long)]
    data: String,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();
    let connect_timeout = Duration::from_millis(cli.connect_timeout_ms);
    let config = ClientConfig::new(ws_url(&cli.url)?)?
        .with_request_timeout(Duration::from_millis(cli.timeout_ms))
        .with_connect_timeout(connect_timeout);
    let client = Client::new(config);

    let result = match cli.command {
        Command::Request(args) => run_request(&client, &args).await,
        Command::Send(args) => run_send(&client, &args, connect_timeout).await,
        Command::Batch(args) => run_batch(&client, &args).await,
    };
    client.close_socket().await?;
    result
}

async fn run_request(client: &Client, args: &DataArgs) -> Result<(), CliError> {
    let payload = parse_object(&args.data)?;
    let response = client.request(&payload).await?;
    print_json(&response)
}

async fn run_send(client: &Client, args: &DataArgs, connect_timeout: Duration) -> Result<(), CliError> {
    let payload = parse_object(&args.data)?;
    // Closing right after a queued send would strand it, so wait for Open first.
    client.open_socket()?;
    tokio::time::timeout(connect_timeout, client.wait_for_state(ConnectionState::Open))
        .await
        .map_err(|_| CliError::ConnectTimeout(connect_timeout))??;
    client.send_message(&payload)?;
    info!("message sent");
    Ok(())
}

async fn run_batch(client: &Client, args: &BatchArgs) -> Result<(), CliError> {
    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.input).map_err(|source| CliError::Io { context: "open input", source })?;
        Box::new(BufReader::new(file))
    };

    let mut submitted = Vec::new();
    let mut skipped = 0_usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| CliError::Io { context: "read input", source })?;
        let Some(payload) = parse_jsonl_line(&line)? else {
            skipped = skipped.saturating_add(1);
            continue;
        };
        submitted.push((index + 1, client.send_request(&payload)?));
    }

    let mut ok = 0_usize;
    let mut failed = 0_usize;
    for (line_no, pending) in submitted {
        let id = pending.id();
        match pending.await {
            Ok(response) => {
                println!("{}", serde_json::to_string(&response)?);
                ok = ok.saturating_add(1);
            }
            Err(error) => {
                warn!(line = line_no, %id, %error, "batch request failed");
                failed = failed.saturating_add(1);
            }
        }
    }

    eprintln!("batch complete: ok={ok} failed={failed} skipped={skipped}");
    Ok(())
}

/// Accept `ws(s)://` as-is and rewrite `http(s)://`.
fn ws_url(url: &str) -> Result<String, CliError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_owned());
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    if let Some(rest) = url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    Err(CliError::InvalidUrl(url.to_owned()))
}

fn parse_object(raw: &str) -> Result<Value, CliError> {
    let value = serde_json::from_str::<Value>(raw)?;
    if !value.is_object() {
        return Err(CliError::NotAnObject);
    }
    Ok(value)
}

/// One JSONL line: `None` for blank lines and non-object values.
fn parse_jsonl_line(line: &str) -> Result<Option<Value>, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str::<Value>(trimmed)?;
    Ok(value.is_object().then_some(value))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
