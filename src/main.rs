// Courier Agent - Main Entry Point
//
// Wires the pieces together:
// - CLI interface and logging
// - Credential sync and the offline queue processor
// - Inbound gateway and metrics listener
// - Graceful shutdown on SIGINT/SIGTERM

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use courier_agent::config::Config;
use courier_agent::credentials::CredentialStore;
use courier_agent::delivery::{Deliver, DeliveryClient};
use courier_agent::gateway::{self, AppState};
use courier_agent::metrics;
use courier_agent::metrics_server::start_metrics_server;
use courier_agent::queue::{PersistentQueue, QueueProcessor};
use courier_agent::sync::CredentialSync;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// How long background work may take to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Courier: encrypting forwarding agent with offline buffering
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author = "Courier Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Encrypting forwarding agent with durable offline buffering", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Run a single drain cycle over the offline queue
    Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config).await,
        Commands::CheckConfig => {
            check_config(&config);
            Ok(())
        }
        Commands::Drain => drain_once(config).await,
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn check_config(config: &Config) {
    println!("Configuration OK");
    println!("  upstream:     {}", config.upstream.server_url);
    println!("  listen:       {}:{}", config.agent.bind, config.agent.port);
    println!("  credentials:  {} static", config.credentials.len());
    println!(
        "  auto-sync:    {}",
        if config.upstream.has_auto_sync() {
            format!("every {}s", config.upstream.sync_interval_secs)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  retry:        {} attempts, {}ms apart (queue drop after {})",
        config.upstream.retry_attempts,
        config.upstream.retry_delay_ms,
        config.queue_drop_ceiling()
    );
    if config.buffer.enabled {
        println!(
            "  buffer:       {} (max {} messages)",
            config.buffer.db_path.display(),
            config.buffer.max_size
        );
    } else {
        println!("  buffer:       disabled");
    }
    if config.metrics.enabled {
        println!("  metrics:      port {}", config.metrics.port);
    }
}

fn build_delivery(config: &Config, credentials: &CredentialStore) -> Result<Arc<dyn Deliver>> {
    let client = DeliveryClient::new(
        &config.upstream.server_url,
        config.upstream.timeout(),
        config.upstream.retry_policy(),
        credentials.clone(),
    )
    .context("Failed to build delivery HTTP client")?;
    Ok(Arc::new(client))
}

fn build_sync(config: &Config, credentials: &CredentialStore) -> Result<Option<CredentialSync>> {
    let token = match &config.upstream.agent_token {
        Some(token) if config.upstream.has_auto_sync() => token,
        _ => return Ok(None),
    };
    let sync = CredentialSync::new(
        &config.upstream.server_url,
        token.clone(),
        config.upstream.timeout(),
        config.upstream.sync_interval(),
        credentials.clone(),
    )
    .context("Failed to build sync HTTP client")?;
    Ok(Some(sync))
}

fn open_queue(config: &Config) -> Result<Arc<PersistentQueue>> {
    let queue = PersistentQueue::open(&config.buffer.db_path, config.buffer.max_size)
        .with_context(|| format!("Failed to open queue at {:?}", config.buffer.db_path))?;
    Ok(Arc::new(queue))
}

/// Run the agent until SIGINT/SIGTERM
async fn run_agent(config: Config) -> Result<()> {
    info!("Courier agent v{} starting...", env!("CARGO_PKG_VERSION"));

    metrics::init().context("Failed to initialize metrics")?;

    let credentials = CredentialStore::new(config.credentials.clone());
    let delivery = build_delivery(&config, &credentials)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    match build_sync(&config, &credentials)? {
        Some(sync) => {
            info!("Auto-sync enabled (token configured)");
            tasks.spawn(sync.run(shutdown_rx.clone()));
        }
        None => info!("Using static config for {} credential(s)", credentials.len()),
    }

    let queue = if config.buffer.enabled {
        let queue = open_queue(&config)?;
        info!(
            "Offline buffering enabled (max: {} messages)",
            config.buffer.max_size
        );
        let processor = Arc::new(QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&delivery),
            config.queue_drop_ceiling(),
            config.buffer.drain_interval(),
        ));
        tasks.spawn(processor.run(shutdown_rx.clone()));
        Some(queue)
    } else {
        None
    };

    if config.metrics.enabled {
        let bind = config.agent.bind.clone();
        let port = config.metrics.port;
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = start_metrics_server(&bind, port, rx).await {
                error!("{:#}", e);
            }
        });
    }

    let app = gateway::router(AppState {
        delivery,
        queue,
        credentials,
    });

    let addr = format!("{}:{}", config.agent.bind, config.agent.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {}", addr))?;
    info!("Agent listening on {}", addr);

    let mut gateway_rx = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while gateway_rx.changed().await.is_ok() {
                    if *gateway_rx.borrow() {
                        break;
                    }
                }
            })
            .await
    });

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down agent...");
            None
        }
        res = &mut server => Some(res),
    };

    let _ = shutdown_tx.send(true);

    let finished = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let server_result = match early_exit {
            Some(res) => res,
            None => (&mut server).await,
        };
        while tasks.join_next().await.is_some() {}
        server_result
    })
    .await;

    match finished {
        Ok(Ok(Ok(()))) => {
            info!("Agent stopped");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(e).context("Gateway server error"),
        Ok(Err(e)) => Err(anyhow!("Gateway task failed: {}", e)),
        Err(_) => {
            warn!(
                "Shutdown grace period of {}s elapsed, abandoning in-flight work",
                SHUTDOWN_GRACE.as_secs()
            );
            server.abort();
            tasks.abort_all();
            Ok(())
        }
    }
}

/// One drain cycle against the configured queue, for operators
async fn drain_once(config: Config) -> Result<()> {
    if !config.buffer.enabled {
        anyhow::bail!("Buffering is disabled in the configuration; there is no queue to drain");
    }

    let credentials = CredentialStore::new(config.credentials.clone());
    if let Some(sync) = build_sync(&config, &credentials)? {
        if let Err(e) = sync.sync_once().await {
            warn!("Credential sync failed, using static credentials: {}", e);
        }
    }

    let queue = open_queue(&config)?;
    let processor = QueueProcessor::new(
        Arc::clone(&queue),
        build_delivery(&config, &credentials)?,
        config.queue_drop_ceiling(),
        config.buffer.drain_interval(),
    );

    let report = processor.drain_cycle().await.context("Drain cycle failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("remaining: {}", queue.size()?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
