//! Off-chain node
//!
//! Entry point: loads configuration and the node key, wires the chain
//! client, compute adapters and submission engine, then runs one polling
//! loop per configured topic until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use offchain_node::adapters::AdapterRegistry;
use offchain_node::chain::rest::{RestChainClient, RestClientConfig};
use offchain_node::config::Config;
use offchain_node::endpoints;
use offchain_node::metrics::Metrics;
use offchain_node::orchestrator::{self, NodeContext, TopicSubscription};
use offchain_node::payload::{BundleSigner, PayloadBuilder};
use offchain_node::shutdown;
use offchain_node::submission::SubmissionEngine;
use offchain_node::wallet::{LocalKeystore, NodeIdentity};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "OFFCHAIN_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Metrics port, overrides `[metrics].port`
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "starting off-chain node");
    info!(path = %args.config, "loading configuration");
    let config = Config::load(&args.config).with_context(|| format!("failed to load config from {}", args.config))?;

    let keystore = Arc::new(LocalKeystore::new());
    keystore
        .load_key(Path::new(&config.wallet.keyring_dir), &config.wallet.address_key_name)
        .context("failed to load node key")?;
    let identity = NodeIdentity::load(
        keystore.as_ref(),
        &config.wallet.address_key_name,
        &config.wallet.address_prefix,
        &config.wallet.fee_denom,
    )
    .context("failed to resolve node identity")?;
    info!(address = %identity.address, key = %identity.key_name, "node identity loaded");

    let metrics = Arc::new(Metrics::new().context("failed to create metrics")?);
    let (trigger, shutdown) = shutdown::channel();

    if config.metrics.enabled {
        let port = args.metrics_port.unwrap_or(config.metrics.port);
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(port, metrics, shutdown).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let client = Arc::new(
        RestChainClient::new(
            RestClientConfig {
                api_url: config.wallet.node_rpc.clone(),
                tx_gateway: config.wallet.tx_gateway.clone(),
                emissions_version: config.wallet.emissions_version.clone(),
                request_timeout: config.request_timeout(),
            },
            identity.address.clone(),
        )
        .context("failed to create chain client")?,
    );

    let subscriptions = build_subscriptions(&config)?;

    let node = Arc::new(NodeContext {
        identity: identity.clone(),
        chain: client.clone(),
        registrar: client.clone(),
        engine: Arc::new(SubmissionEngine::new(client, config.retry_config(), shutdown.clone())),
        signer: Arc::new(BundleSigner::new(keystore, identity.clone())),
        builder: Arc::new(PayloadBuilder::new(
            identity.address.clone(),
            config.request_timeout(),
            Arc::clone(&metrics),
        )),
        metrics,
        submit_tx: config.wallet.submit_tx,
        call_timeout: config.request_timeout(),
        shutdown,
    });

    if !config.wallet.submit_tx {
        info!("submit_tx is false, running as a dry run");
    }

    let run = orchestrator::spawn(node, subscriptions);
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {
            info!("all topic loops exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            trigger.trigger();
            run.await;
        }
    }

    info!("shut down gracefully");
    Ok(())
}

/// Resolve adapters for every configured topic. Any bad entrypoint aborts startup.
fn build_subscriptions(config: &Config) -> Result<Vec<TopicSubscription>> {
    let registry = AdapterRegistry::new(config.request_timeout()).context("failed to create adapter client")?;
    let mut subscriptions = Vec::with_capacity(config.worker.len() + config.reputer.len());

    for worker in &config.worker {
        let adapters = registry
            .worker(worker)
            .with_context(|| format!("invalid adapters for worker on topic {}", worker.topic_id))?;
        subscriptions.push(TopicSubscription::worker(
            worker.topic_id,
            Duration::from_secs(worker.loop_seconds),
            adapters,
        ));
    }

    for reputer in &config.reputer {
        let adapters = registry
            .reputer(reputer)
            .with_context(|| format!("invalid adapters for reputer on topic {}", reputer.topic_id))?;
        subscriptions.push(TopicSubscription::reputer(
            reputer.topic_id,
            Duration::from_secs(reputer.loop_seconds),
            adapters,
            reputer.min_stake,
        ));
    }

    Ok(subscriptions)
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "offchain_node=debug,info"
    } else {
        "offchain_node=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
