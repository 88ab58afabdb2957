//! mwrpc - command-line client for JSON RPC backends.
//!
//! Opens one session, runs a single command against it and closes the session
//! before exiting. Results are printed to stdout as pretty JSON; logs go to
//! stderr.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use mwrpc::{Client, ClientOptions, Context, Credentials};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mwrpc")]
#[command(about = "Call methods on a JSON RPC backend")]
struct Args {
    /// Backend endpoint (ws://, wss:// or tcp://host:port)
    #[arg(long, env = "MWRPC_URL", default_value = "ws://127.0.0.1/api/current")]
    url: String,

    /// Username for password login
    #[arg(short, long, env = "MWRPC_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password for password login
    #[arg(short, long, env = "MWRPC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// API key login (instead of username/password)
    #[arg(long, env = "MWRPC_API_KEY", hide_env_values = true, conflicts_with = "username")]
    api_key: Option<String>,

    /// Per-command timeout in seconds (0 = none)
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method and print its result
    Call {
        method: String,
        /// Parameters as a JSON array
        #[arg(default_value = "[]")]
        params: String,
    },
    /// Submit a job call and wait for it to finish
    Job {
        method: String,
        /// Parameters as a JSON array
        #[arg(default_value = "[]")]
        params: String,
    },
    /// Check that the backend answers
    Ping,
    /// Print server events until interrupted
    Watch,
}

impl Args {
    fn credentials(&self) -> Credentials {
        match (&self.api_key, &self.username, &self.password) {
            (Some(key), _, _) => Credentials::api_key(key.clone()),
            (None, Some(user), Some(pass)) => Credentials::password(user.clone(), pass.clone()),
            _ => Credentials::None,
        }
    }

    fn context(&self) -> Context {
        match self.timeout {
            0 => Context::background(),
            secs => Context::background().with_timeout(Duration::from_secs(secs)),
        }
    }
}

fn parse_params(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw).context("params must be valid JSON")? {
        Value::Array(params) => Ok(params),
        other => bail!("params must be a JSON array, got {}", other),
    }
}

fn init_logging(args: &Args) {
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let options = ClientOptions::new(args.url.clone()).with_credentials(args.credentials());
    let client = Client::connect(options)
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    info!(
        "Connected to {} (session {})",
        args.url,
        client.session_id().unwrap_or_default()
    );

    let outcome = run(&client, &args).await;
    client.close().await;
    outcome
}

async fn run(client: &Client, args: &Args) -> Result<()> {
    match &args.command {
        Command::Call { method, params } => {
            let result = client
                .call(&args.context(), method, parse_params(params)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Job { method, params } => {
            let result = client
                .call_job_with_progress(&args.context(), method, parse_params(params)?, |p| {
                    info!(
                        "{}% {}",
                        p.percent.unwrap_or_default(),
                        p.description.as_deref().unwrap_or("")
                    )
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Ping => {
            client.ping(&args.context()).await?;
            println!("pong");
        }
        Command::Watch => {
            let mut events = client.notifications();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received, exiting");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => println!(
                            "{} {} {}",
                            event.msg,
                            event.collection.as_deref().unwrap_or("-"),
                            event.fields.map(|f| f.to_string()).unwrap_or_default()
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Skipped {} events", n)
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}
