use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{unix_now, LocalLimiter, RedisStore, WindowStore};
use gatekeeper::{AdmissionRequest, RateLimitGate};

/// How long startup waits for the shared store before running local-only.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about = "Distributed rate limiting and admission control")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "GATEKEEPER_CONFIG")]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the policy table
    Validate,
    /// Run a single admission check and print the decision as JSON
    Check(RequestArgs),
    /// Fire concurrent checks for one caller and print the tally
    Burst(BurstArgs),
}

#[derive(Args, Debug, Clone)]
struct RequestArgs {
    /// Request path
    #[arg(long)]
    endpoint: String,

    /// Authenticated caller id
    #[arg(long)]
    principal: Option<String>,

    /// Directly connected peer address
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// X-Forwarded-For header value
    #[arg(long)]
    forwarded_for: Option<String>,

    /// Caller role
    #[arg(long, default_value = "standard")]
    role: String,
}

impl RequestArgs {
    fn request(&self, now: f64) -> AdmissionRequest<'_> {
        AdmissionRequest {
            endpoint: &self.endpoint,
            principal: self.principal.as_deref(),
            client_ip: &self.ip,
            forwarded_for: self.forwarded_for.as_deref(),
            role: &self.role,
            now,
        }
    }
}

#[derive(Args, Debug)]
struct BurstArgs {
    #[command(flatten)]
    request: RequestArgs,

    /// Number of concurrent checks
    #[arg(long, default_value_t = 10)]
    count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match GatekeeperConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        store = config.store.url.is_some(),
        timeout_ms = config.store.timeout_ms,
        "Configuration loaded"
    );

    match cli.command {
        Command::Validate => validate(&config),
        Command::Check(args) => {
            let gate = build_gate(&config).await?;
            let decision = gate.check(&args.request(unix_now())).await?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::Burst(args) => burst(&config, args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn validate(config: &GatekeeperConfig) -> anyhow::Result<()> {
    let gate = RateLimitGate::from_config(config, None, Arc::new(LocalLimiter::new()))?;

    for policy in gate.resolver().policies() {
        println!(
            "{:<40} {:>8} req / {:>6}s",
            policy.endpoint, policy.max_requests, policy.window_seconds
        );
    }
    println!("configuration ok");
    Ok(())
}

/// Build the gate, connecting to the shared store when one is configured.
///
/// An unreachable store at startup is not fatal: the gate enforces limits
/// per process until restarted with a reachable store.
async fn build_gate(config: &GatekeeperConfig) -> anyhow::Result<RateLimitGate> {
    let store: Option<Arc<dyn WindowStore>> = match &config.store.url {
        Some(url) => match tokio::time::timeout(
            CONNECT_TIMEOUT,
            RedisStore::connect(url, config.store.timeout()),
        )
        .await
        {
            Ok(Ok(store)) => Some(Arc::new(store)),
            Ok(Err(e)) => {
                warn!(error = %e, "Shared store not available, using local rate limiting");
                None
            }
            Err(_) => {
                warn!("Shared store connection timed out, using local rate limiting");
                None
            }
        },
        None => None,
    };

    let gate = RateLimitGate::from_config(config, store, Arc::new(LocalLimiter::new()))?;
    Ok(gate)
}

async fn burst(config: &GatekeeperConfig, args: BurstArgs) -> anyhow::Result<()> {
    let gate = build_gate(config).await?;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let background = gate.spawn_background_tasks(config.local.sweep_interval(), async move {
        tokio::select! {
            _ = stop_rx => {}
            _ = shutdown_signal() => {}
        }
    });

    let now = unix_now();
    let requests: Vec<AdmissionRequest<'_>> =
        (0..args.count).map(|_| args.request.request(now)).collect();
    let results = join_all(requests.iter().map(|request| gate.check(request))).await;

    let mut admitted = 0;
    let mut denied = 0;
    for result in results {
        if result?.admitted {
            admitted += 1;
        } else {
            denied += 1;
        }
    }

    let summary = serde_json::json!({
        "admitted": admitted,
        "denied": denied,
        "stats": gate.limiter().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let _ = stop_tx.send(());
    join_all(background).await;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
