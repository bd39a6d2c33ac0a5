use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{RequestMeta, Verdict};
use tollgate::registry::{LimiterOptions, Registry};
use tollgate::store::{MemoryStore, ScriptStore};
use tollgate::LimiterError;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Per-client request quotas on a shared store")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "tollgate.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the configuration and build every declared rule
    Validate,
    /// Drive synthetic traffic through one rule and print each verdict
    Simulate {
        /// Name of the declared rule
        #[arg(long)]
        rule: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Number of distinct client addresses
        #[arg(long, default_value_t = 1)]
        clients: u8,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Print verdicts as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Tollgate version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            rule,
            requests,
            clients,
            interval_ms,
            json,
        } => {
            let registry: Registry<RequestMeta> = Registry::new();
            let work = simulate(&registry, &config, &rule, requests, clients.max(1), interval_ms, json);
            until_shutdown(&registry, work, shutdown_signal()).await
        }
    }
}

/// Run `work` until it finishes or `shutdown` fires, then close the registry.
async fn until_shutdown<W, S>(
    registry: &Registry<RequestMeta>,
    work: W,
    shutdown: S,
) -> anyhow::Result<()>
where
    W: Future<Output = anyhow::Result<()>>,
    S: Future<Output = ()>,
{
    let result = tokio::select! {
        result = work => result,
        _ = shutdown => Ok(()),
    };
    registry.close().await?;
    result
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn validate(config: &TollgateConfig) -> anyhow::Result<()> {
    let rules = config.build_rules::<RequestMeta>()?;

    println!(
        "prefix={} failure_policy={:?} store={}",
        config.limiter.prefix,
        config.limiter.failure_policy,
        if config.store.url.is_some() { "redis" } else { "memory" }
    );
    for rule in &rules {
        println!("  {:<20} {:?}", rule.id().as_str(), rule.algorithm());
    }
    println!("{} rule(s) valid", rules.len());
    Ok(())
}

async fn simulate(
    registry: &Registry<RequestMeta>,
    config: &TollgateConfig,
    rule_name: &str,
    requests: u32,
    clients: u8,
    interval_ms: u64,
    json: bool,
) -> anyhow::Result<()> {
    let declared = config
        .rule(rule_name)
        .with_context(|| format!("no rule named '{}'", rule_name))?;
    let rule = declared.build::<RequestMeta>()?;

    let store = open_store(config).await?;
    registry.init(store, config.limiter.apply(LimiterOptions::default()));

    for seq in 0..requests {
        let host = rand::thread_rng().gen_range(1..=clients);
        let request = RequestMeta::new(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host))));

        match rule.check(registry, &request).await {
            Ok(verdict) => report(seq, &request, &verdict, json),
            Err(LimiterError::StoreUnavailable(reason)) => {
                warn!(seq, %reason, "Store unavailable");
            }
            Err(e) => return Err(e.into()),
        }

        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    Ok(())
}

fn report(seq: u32, request: &RequestMeta, verdict: &Verdict, json: bool) {
    let client = request
        .client_addr
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    if json {
        let line = serde_json::json!({
            "seq": seq,
            "client": client,
            "admitted": verdict.is_admitted(),
            "wait_ms": verdict.wait().map(|wait| wait.as_millis() as u64),
        });
        println!("{}", line);
    } else {
        println!("{:>5} {:<12} {}", seq, client, verdict);
    }
}

#[cfg(feature = "redis")]
async fn open_store(config: &TollgateConfig) -> anyhow::Result<Arc<dyn ScriptStore>> {
    match config.store.url.as_deref() {
        Some(url) => {
            let store = tollgate::store::RedisStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn open_store(config: &TollgateConfig) -> anyhow::Result<Arc<dyn ScriptStore>> {
    if config.store.url.is_some() {
        warn!("store.url is set but the redis feature is disabled; using the in-memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
