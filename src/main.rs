// hookrelay - Main Entry Point
//
// Commands:
// - serve: HTTP API, delivery worker pool and optional metrics server
// - sign: print the signature a receiver should expect
// - check-config: load and validate the configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hookrelay::api::auth::StaticTokens;
use hookrelay::api::{self, AppState};
use hookrelay::config::Config;
use hookrelay::inbound::handlers::{
    LoggingDomainHandler, DEFERRED_DRAIN_TIMEOUT, DEFERRED_QUEUE_CAPACITY,
};
use hookrelay::inbound::{default_router, spawn_deferred_worker};
use hookrelay::webhooks::signer;
use hookrelay::webhooks::{
    DeliveryQueue, DeliveryStore, Dispatcher, EndpointRegistry, WebhookManager, WorkerPool,
};
use hookrelay::{logging, metrics_server};

/// hookrelay: signed webhook delivery and inbound event routing
#[derive(Parser, Debug)]
#[command(name = "hookrelay")]
#[command(version)]
#[command(about = "Signed webhook delivery and inbound event routing", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "HOOKRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API server and delivery workers
    Serve,
    /// Print the HMAC-SHA256 signature for a payload
    Sign {
        /// Endpoint signing secret
        #[arg(long)]
        secret: String,

        /// Unix timestamp sent in X-Webhook-Timestamp
        #[arg(long)]
        timestamp: String,

        /// Raw request body
        #[arg(long)]
        body: String,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Serve => {
            let config = Config::load(args.config.as_deref())?;
            logging::init_tracing(&config.logging)?;
            serve(config).await
        }
        Commands::Sign {
            secret,
            timestamp,
            body,
        } => {
            println!("{}", signer::sign(&secret, &timestamp, body.as_bytes()));
            Ok(())
        }
        Commands::CheckConfig => {
            let config = Config::load(args.config.as_deref())?;
            println!(
                "Configuration OK: listening on {}:{}, {} workers, max {} attempts, {} tokens",
                config.server.host,
                config.server.port,
                config.delivery.workers,
                config.delivery.retry.max_attempts,
                config.auth.tokens.len()
            );
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("hookrelay v{} starting", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        let host = config.server.host.clone();
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(&host, port).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    let auth = StaticTokens::from_config(&config.auth).context("Invalid auth configuration")?;
    if auth.is_empty() {
        warn!("No API tokens configured; every authenticated route will answer 401");
    }

    let endpoints = EndpointRegistry::new();
    let deliveries = DeliveryStore::new();
    let (queue, receiver) = DeliveryQueue::new();

    let dispatcher =
        Dispatcher::new(endpoints.clone(), deliveries.clone(), config.delivery.clone())
            .context("Failed to create dispatcher")?;
    let workers = WorkerPool::spawn(
        Arc::new(dispatcher),
        queue.clone(),
        receiver,
        config.delivery.workers,
    );

    let (deferred_tx, deferred_rx) = mpsc::channel(DEFERRED_QUEUE_CAPACITY);
    let deferred_worker = spawn_deferred_worker(deferred_rx, LoggingDomainHandler);

    let manager = WebhookManager::new(endpoints, deliveries.clone(), queue);
    let state = AppState::new(manager, default_router(deferred_tx), auth);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;

    // Returns once the router, and with it every deferred job sender, is dropped
    let result = api::serve(listener, state).await;

    workers.shutdown();
    let dropped = deferred_worker.drain(DEFERRED_DRAIN_TIMEOUT).await;
    if dropped > 0 {
        warn!(dropped, "Acknowledged inbound jobs dropped at shutdown");
    }

    let unfinished = deliveries.unfinished().await;
    if !unfinished.is_empty() {
        warn!(
            count = unfinished.len(),
            "Deliveries still pending or retrying at shutdown"
        );
    }
    info!("hookrelay stopped");
    result
}
