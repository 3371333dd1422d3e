//! glb - a health-aware HTTP load balancer
//!
//! Usage:
//!     glb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use glb::backend::algorithms::build_strategy;
use glb::config::{load_config, Config, ConfigWatcher};
use glb::frontend::FrontendListener;
use glb::health::{HealthProbe, HttpChecker, ProbeSettings};
use glb::metrics::{EventBus, EventSink, MetricsCollector, MetricsServer};
use glb::proxy::{Dispatcher, HttpForwarder};
use glb::util::init_logging;
use glb::LbState;

/// How long shutdown waits for in-flight probes and open connections.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// A health-aware HTTP load balancer.
#[derive(Parser, Debug)]
#[command(name = "glb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    let _log_guard = init_logging(
        log_level,
        &config.global.log_format,
        &config.global.log_file,
    )
    .with_context(|| {
        format!(
            "failed to open log directory '{}'",
            config.global.log_file.directory.display()
        )
    })?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Strategy: {:?}", config.strategy);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {}", backend);
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.listen,
        strategy = ?config.strategy,
        backends = config.backends.len(),
        "glb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config, cli.config))
}

async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let metrics = MetricsCollector::new();
    let events: Arc<dyn EventSink> =
        Arc::new(EventBus::tracing().with_sink(Arc::new(metrics.clone())));

    let state = LbState::new(config.clone(), Arc::clone(&events))
        .context("failed to build backend registry")?;
    let shutdown = state.shutdown().clone();

    let dispatcher = Dispatcher::new(
        state.registry().clone(),
        build_strategy(config.strategy),
        Arc::new(HttpForwarder::new(config.forward.connect_timeout)),
        Arc::clone(&events),
    );

    let checker = HttpChecker::new(
        config.health_check.path.clone(),
        config.forward.connect_timeout,
    );
    let probe = HealthProbe::new(
        state.registry().clone(),
        Arc::new(checker),
        ProbeSettings {
            interval: config.health_check.interval,
            timeout: config.health_check.timeout,
        },
        Arc::clone(&events),
    )
    .spawn();

    let mut tasks = JoinSet::new();

    if config.global.metrics.enabled {
        let server = MetricsServer::bind(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind metrics server on {}",
                config.global.metrics.address
            )
        })?;
        tasks.spawn(server.run(shutdown.clone()));
    }

    let reload_state = state.clone();
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |config| {
            if let Err(e) = reload_state.apply_config(config) {
                error!(error = %e, "reloaded configuration rejected, keeping current backends");
            }
        }),
    );
    tasks.spawn(watcher.run(shutdown.clone()));

    let listener = FrontendListener::bind(config.listen, dispatcher, metrics)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    tasks.spawn(listener.run(shutdown.clone()));

    info!("glb is running");
    info!("press Ctrl+C to stop");

    wait_for_signal().await;

    state.trigger_shutdown();

    if let Err(e) = probe.stop(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "health probe shutdown incomplete");
    }

    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("tasks still running at shutdown deadline, aborting");
        tasks.abort_all();
    }

    info!("glb shut down complete");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received Ctrl+C"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
        },
        _ = terminate => info!("received SIGTERM"),
    }
}
