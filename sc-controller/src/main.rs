//! sc-controller: runs the StorageClass controller against an in-memory
//! store, creates a default class and waits for a handler's annotation to
//! converge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sc_controller::{
    handler_fn, set_annotation, Backoff, Controller, ControllerConfig, ConvergencePoller,
    HandlerOutcome, HandlerRegistry, MemoryStore, ResourceKind, ResourceStore, StorageClass,
    IS_DEFAULT_CLASS_ANNOTATION,
};

/// StorageClass controller
#[derive(Parser, Debug)]
#[command(name = "sc-controller", version, about)]
struct Args {
    /// Name of the StorageClass to create
    #[arg(long, default_value = "standard")]
    name: String,

    /// Provisioner of the StorageClass
    #[arg(long, default_value = "hostpath.csi.k8s.io")]
    provisioner: String,

    /// Annotation the demo handler sets (key=value)
    #[arg(long, default_value = "kubeblocks.io/test=test", value_parser = parse_annotation)]
    annotation: (String, String),

    /// Number of reconcile workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Periodic resync in seconds (0 disables)
    #[arg(long, default_value = "0")]
    resync_secs: u64,

    /// Maximum conflict retries per handler and round
    #[arg(long, default_value = "5")]
    conflict_retries: u32,

    /// Seconds to wait for convergence
    #[arg(long, default_value = "20")]
    timeout_secs: u64,

    /// Convergence poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Keep the controller running until Ctrl-C after convergence
    #[arg(long)]
    keep_running: bool,
}

fn parse_annotation(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or("Expected format: key=value".to_string())?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "sc_controller=info".into()),
        )
        .init();

    let args = Args::parse();

    let defaults = ControllerConfig::default();
    let config = ControllerConfig {
        workers: args.workers,
        resync_interval: (args.resync_secs > 0).then(|| Duration::from_secs(args.resync_secs)),
        conflict_retry: Backoff {
            max_attempts: args.conflict_retries.max(1),
            ..defaults.conflict_retry
        },
        ..defaults
    };

    let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new(ResourceKind::STORAGE_CLASS));
    let registry = Arc::new(HandlerRegistry::new());

    let (key, value) = args.annotation.clone();
    registry.register(
        "annotate",
        handler_fn(move |_ctx, snapshot| {
            let key = key.clone();
            let value = value.clone();
            async move {
                if snapshot.is_tombstone() {
                    return Ok(HandlerOutcome::NoOp);
                }
                Ok(snapshot.mutate(|f| set_annotation(f, key, value)).into())
            }
        }),
    );

    let controller = Controller::new(Arc::clone(&store), Arc::clone(&registry), config).start();

    let mut class = StorageClass::new(&args.name, &args.provisioner);
    class
        .metadata
        .annotations
        .insert(IS_DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string());
    class.allow_volume_expansion = Some(true);
    let reference = class.reference();
    store
        .create(&reference, class.into_fields()?)
        .await
        .context("Failed to create StorageClass")?;
    info!("Created StorageClass {}", reference);

    let (key, value) = args.annotation;
    let poller = ConvergencePoller::new(
        Duration::from_secs(args.timeout_secs),
        Duration::from_millis(args.interval_ms),
    );
    let converged = poller
        .wait_until(store.as_ref(), &reference, |current| {
            current.is_some_and(|s| s.annotation(&key) == Some(value.as_str()))
        })
        .await
        .context("StorageClass did not converge")?
        .context("StorageClass disappeared")?;

    info!(
        "StorageClass {} converged at version {}",
        reference,
        converged.version()
    );
    println!("{}", serde_json::to_string_pretty(converged.fields())?);

    if args.keep_running {
        // Wait for shutdown signal
        signal::ctrl_c().await?;
        info!("Shutting down");
    }

    controller.shutdown().await;
    Ok(())
}
