use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use token_gate::config::MIN_SALT_LEN;
use token_gate::{
    parse_rate, Expiration, Gate, GateRequest, GuardConfig, PathPattern, Principal, RateSpec,
};

#[derive(Parser)]
#[command(name = "token-gate", version, about = "Issue and inspect sealed API tokens")]
struct Cli {
    /// YAML configuration file; TOKEN_GATE__<SECTION>__<KEY> variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Issue a token and print it
    Issue {
        /// Principal id
        #[arg(long)]
        id: String,
        /// Path restriction pattern
        #[arg(long)]
        path: Option<String>,
        /// Minimum spacing between requests, e.g. 100ms or 5s
        #[arg(long)]
        rate: Option<String>,
        /// Expiration as epoch millis or a date string
        #[arg(long, conflicts_with = "expires_in")]
        expires: Option<String>,
        /// Expiration relative to now, e.g. 12h or 7d
        #[arg(long)]
        expires_in: Option<String>,
        /// Extra claim as key=value; values that parse as JSON are kept as JSON
        #[arg(long = "claim", value_parser = parse_claim)]
        claims: Vec<(String, Value)>,
    },
    /// Decode a token and print its contents as JSON
    Inspect {
        token: String,
    },
    /// Print a fresh random salt
    Salt {
        /// Number of random bytes
        #[arg(long, default_value_t = 24)]
        bytes: usize,
    },
    /// Push requests through the gate and print when each is admitted
    Simulate {
        #[arg(long)]
        token: String,
        #[arg(long, default_value_t = 5)]
        requests: usize,
        #[arg(long, default_value = "/")]
        path: String,
    },
}

fn parse_claim(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Issue {
            id,
            path,
            rate,
            expires,
            expires_in,
            claims,
        } => {
            let gate = open_gate(cli.config)?;
            let mut principal = Principal::new(id);
            if let Some(path) = path {
                principal = principal.with_path(PathPattern::new(&path)?);
            }
            if let Some(rate) = rate {
                principal = principal.with_rate(rate);
            }
            if let Some(expires) = expires {
                principal = principal.with_expiration(match expires.parse::<i64>() {
                    Ok(millis) => Expiration::EpochMillis(millis),
                    Err(_) => Expiration::Text(expires),
                });
            }
            if let Some(offset) = expires_in {
                let millis = parse_rate(&RateSpec::from(offset))?;
                let at = Utc::now().timestamp_millis().saturating_add(millis as i64);
                principal = principal.with_expiration(at);
            }
            for (key, value) in claims {
                principal = principal.with_claim(key, value);
            }

            println!("{}", gate.issue(&principal)?);
        }
        Command::Inspect { token } => {
            let gate = open_gate(cli.config)?;
            let principal = gate.codec().decode(&token)?;
            let rendered = json!({
                "id": principal.id,
                "path": principal.path.as_ref().map(|p| p.source().to_string()),
                "rate": principal.rate,
                "exp": principal.expires_at(),
                "claims": principal.claims,
            });
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
        Command::Simulate {
            token,
            requests,
            path,
        } => {
            let gate = open_gate(cli.config)?;
            tokio::select! {
                result = simulate(gate, token, requests, path) => result?,
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, aborting simulation");
                }
            }
        }
        Command::Salt { bytes } => {
            if bytes < MIN_SALT_LEN {
                bail!("a salt needs at least {} bytes", MIN_SALT_LEN);
            }
            let mut salt = vec![0u8; bytes];
            OsRng.fill_bytes(&mut salt);
            println!("{}", BASE64.encode(salt));
        }
    }

    Ok(())
}

/// Load configuration and build the gate.
fn open_gate(path: Option<PathBuf>) -> anyhow::Result<Gate> {
    let config = GuardConfig::load(path.as_deref()).context("loading configuration")?;
    let gate = Gate::new(&config).context("initializing token gate")?;
    info!(param = %config.auth.param, nodes = config.limiter.nodes, "Token gate initialized");
    Ok(gate)
}

/// Submit `requests` concurrent requests carrying `token` and report each
/// admission offset.
async fn simulate(gate: Gate, token: String, requests: usize, path: String) -> anyhow::Result<()> {
    let gate = Arc::new(gate);
    let request = GateRequest::new(path).with_authorization(token);
    let start = Instant::now();

    let mut pending = JoinSet::new();
    for n in 0..requests {
        let gate = Arc::clone(&gate);
        let request = request.clone();
        pending.spawn(async move { (n, gate.admit(&request).await) });
    }

    while let Some(joined) = pending.join_next().await {
        let (n, outcome) = joined?;
        let offset_ms = start.elapsed().as_millis();
        match outcome {
            Ok(principal) => println!("request {n}: admitted {} after {offset_ms}ms", principal.id),
            Err(rejection) => {
                warn!(request = n, status = rejection.status_code(), "Request rejected");
                println!("request {n}: rejected with {} ({rejection})", rejection.status_code());
            }
        }
    }
    Ok(())
}
