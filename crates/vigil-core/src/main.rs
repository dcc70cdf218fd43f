//! Vigil CLI
//!
//! Command-line interface for the Vigil alert scheduler.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vigil::api::{AppState, HttpServer};
use vigil::config::{Conf, Config, LoggingConfig};
use vigil::expr::{Context, Expr, GroupResult};
use vigil::notify::{DryRun, NotificationSender, Notifier};
use vigil::sched::{Schedule, Silence, Snapshot};
use vigil::tsdb::{OpenTsdbClient, QueryCache, QueryService};

/// Vigil - expression-driven alerting for time series
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and HTTP API
    Serve {
        /// HTTP API port
        #[arg(long, env = "VIGIL_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Run one check cycle and print the resulting state
    Check {
        /// Deliver notifications instead of only logging them
        #[arg(long)]
        notify: bool,
    },

    /// Evaluate one expression and print its results
    Expr {
        /// Expression text
        expression: String,

        /// Evaluate as of this RFC 3339 time
        #[arg(long)]
        time: Option<DateTime<Utc>>,
    },

    /// Validate a silence and print the id it would get
    Silence {
        /// Alert name (empty matches any alert)
        #[arg(long, default_value = "")]
        alert: String,

        /// Tag patterns, e.g. host=web*,dc=ny
        #[arg(long, default_value = "")]
        tags: String,

        /// Start time (RFC 3339), now if omitted
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// How long the silence lasts
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        duration: Duration,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Serve { http_port } => run_serve(config, http_port).await,
        Commands::Check { notify } => run_check(config, notify, cli.format).await,
        Commands::Expr { expression, time } => {
            run_expr(config, &expression, time, cli.format).await
        }
        Commands::Silence {
            alert,
            tags,
            start,
            duration,
        } => run_silence(alert, &tags, start, duration, cli.format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn backend(config: &Config) -> anyhow::Result<Arc<dyn QueryService>> {
    Ok(Arc::new(OpenTsdbClient::new(&config.tsdb)?))
}

async fn run_serve(config: Config, http_port: Option<u16>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        config.server.host,
        http_port.unwrap_or(config.server.http_port)
    );
    let backend = backend(&config)?;
    let query_timeout = config.tsdb.timeout;
    let conf: Arc<Conf> = Arc::new(config.into_conf()?);
    let notifier: Arc<dyn Notifier> = Arc::new(NotificationSender::new(Duration::from_secs(30))?);

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let schedule = Arc::new(Schedule::new(conf, backend.clone(), notifier, query_timeout));
    schedule.restore().await.context("failed to restore state")?;

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(schedule.clone().run(cancel.clone()));

    let server = HttpServer::new(AppState {
        schedule,
        backend,
        query_timeout,
        metrics,
    });
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        shutdown.cancel();
    });

    let served = server.serve(&addr, cancel.clone()).await;
    cancel.cancel();
    scheduler.await.context("scheduler task panicked")?;
    served?;
    Ok(())
}

async fn run_check(mut config: Config, notify: bool, format: OutputFormat) -> anyhow::Result<()> {
    let backend = backend(&config)?;
    let query_timeout = config.tsdb.timeout;
    // A one-off cycle never touches the daemon's state file
    config.schedule.state_file = None;
    let conf = Arc::new(config.into_conf()?);
    let notifier: Arc<dyn Notifier> = if notify {
        Arc::new(NotificationSender::new(Duration::from_secs(30))?)
    } else {
        Arc::new(DryRun)
    };

    let schedule = Schedule::new(conf, backend, notifier, query_timeout);
    let summary = schedule.check().await;
    let snapshot = schedule.snapshot(Utc::now());

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({ "summary": summary, "state": snapshot });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            print_snapshot(&snapshot);
            if !summary.failed.is_empty() {
                println!("\nFailed alerts: {}", summary.failed.join(", "));
            }
        }
    }

    if summary.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} alert(s) failed to evaluate", summary.failed.len())
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    if snapshot.alerts.is_empty() {
        println!("No alert keys.");
        return;
    }
    println!("{:<10} {:<5} {}", "STATUS", "ACK", "KEY");
    for a in &snapshot.alerts {
        let ack = if a.need_ack { "no" } else { "-" };
        println!("{:<10} {:<5} {}", a.status.as_str(), ack, a.key);
        for c in &a.computations {
            println!("{:<16} {} = {}", "", c.text, c.value);
        }
    }
}

async fn run_expr(
    config: Config,
    expression: &str,
    time: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let expr = Expr::parse(expression)?;
    let cache = QueryCache::new(backend(&config)?, config.tsdb.timeout);
    let now = time.unwrap_or_else(Utc::now);
    let results = expr.evaluate(&Context::new(now, &cache)).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Text => print_results(&results),
    }
    Ok(())
}

fn print_results(results: &[GroupResult]) {
    for r in results {
        let value = match r.value.as_number() {
            Some(n) => n.to_string(),
            None => "<series>".to_string(),
        };
        println!("{{{}}} {}", r.group, value);
        for c in &r.computations {
            println!("    {} = {}", c.text, c.value);
        }
    }
}

fn run_silence(
    alert: String,
    tags: &str,
    start: Option<DateTime<Utc>>,
    duration: Duration,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let tags = parse_tags(tags)?;
    let start = start.unwrap_or_else(Utc::now);
    let end = start + chrono::Duration::from_std(duration)?;
    let silence = Silence::new(start, end, alert, tags)?;

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({ "id": silence.id(), "silence": silence });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => println!("{}", silence.id()),
    }
    Ok(())
}

/// Parse `k=v,k2=v2` where values may be glob patterns
fn parse_tags(s: &str) -> anyhow::Result<BTreeMap<String, String>> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .with_context(|| format!("invalid tag pattern {pair:?}"))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
