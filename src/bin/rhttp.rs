use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use resilient_http::{Config, Request, ResilientClient, Response, RetryOverrides};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rhttp")]
#[command(about = "HTTP client with retries and per-host circuit breakers", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ./config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override retry.max_attempts for this invocation
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a GET request and print the body
    Get { url: String },
    /// Send a DELETE request
    Delete { url: String },
    /// Send a POST request with a JSON body
    Post {
        url: String,
        #[arg(short, long)]
        data: String,
    },
    /// Send a PUT request with a JSON body
    Put {
        url: String,
        #[arg(short, long)]
        data: String,
    },
    /// Send a PATCH request with a JSON body
    Patch {
        url: String,
        #[arg(short, long)]
        data: String,
    },
    /// Call a URL repeatedly and report the breaker state after each call
    Probe {
        url: String,
        /// Number of calls (default: 10)
        #[arg(short = 'n', long, default_value = "10")]
        count: u32,
        /// Pause between calls in milliseconds (default: 500)
        #[arg(short, long, default_value = "500")]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("resilient_http=info,rhttp=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let client = ResilientClient::from_config(&config)?;
    let overrides = cli
        .max_attempts
        .map(|attempts| RetryOverrides::new().max_attempts(attempts));

    match cli.command {
        Commands::Get { url } => send(&client, Request::get(url), overrides).await,
        Commands::Delete { url } => send(&client, Request::delete(url), overrides).await,
        Commands::Post { url, data } => {
            send(&client, json_request(Method::POST, url, &data)?, overrides).await
        }
        Commands::Put { url, data } => {
            send(&client, json_request(Method::PUT, url, &data)?, overrides).await
        }
        Commands::Patch { url, data } => {
            send(&client, json_request(Method::PATCH, url, &data)?, overrides).await
        }
        Commands::Probe {
            url,
            count,
            interval_ms,
        } => probe(&client, &url, count, Duration::from_millis(interval_ms), overrides).await,
    }
}

fn json_request(method: Method, url: String, data: &str) -> Result<Request> {
    let body: serde_json::Value =
        serde_json::from_str(data).context("--data must be valid JSON")?;
    Ok(Request::new(method, url).json(&body)?)
}

async fn send(
    client: &ResilientClient,
    request: Request,
    overrides: Option<RetryOverrides>,
) -> Result<()> {
    let response = client.request(request, overrides).await?;
    print_response(&response);
    Ok(())
}

fn print_response(response: &Response) {
    info!(
        status = response.status.as_u16(),
        request_id = response.request_id.as_str(),
        latency_ms = response.latency.as_millis() as u64,
        "Response received"
    );
    match response.json::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{}", response.text()),
        },
        Err(_) => println!("{}", response.text()),
    }
}

async fn probe(
    client: &ResilientClient,
    url: &str,
    count: u32,
    interval: Duration,
    overrides: Option<RetryOverrides>,
) -> Result<()> {
    for call in 1..=count {
        let outcome = client.request(Request::get(url), overrides.clone()).await;
        let state = client.circuit_state(url)?;
        match outcome {
            Ok(response) => println!("#{call:<3} {:<4} circuit={state}", response.status.as_u16()),
            Err(err) => {
                warn!(call, error = %err, "Probe call failed");
                println!(
                    "#{call:<3} {:<4} circuit={state} path={}",
                    err.status_code(),
                    err.failure_path()
                );
            }
        }
        if call < count {
            tokio::time::sleep(interval).await;
        }
    }

    if let Some(snapshot) = client.circuit_snapshot(url)? {
        info!(
            state = %snapshot.state,
            consecutive_failures = snapshot.consecutive_failures,
            "Probe finished"
        );
    }
    Ok(())
}
