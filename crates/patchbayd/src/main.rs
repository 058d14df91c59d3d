mod telemetry;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use patchbay::{
    Acquirable, ConnectionPolicy, EventBus, GraphBackend, JackCliBackend, MemoryBackend,
    MessageBus, PatchEvent, ReconciliationManager, Role,
};
use patchconf::{BackendConfig, BackendKind, PatchConfig, RouteConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps the JACK patch graph wired the way the configuration says.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file, replacing ./patchbay.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured level (e.g. "debug" or "info,patchbay=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Reconcile the configured routes until interrupted (default)
    Run,
    /// Poll the graph once and print it as JSON
    Snapshot,
    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = PatchConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.infra.telemetry.log_level = level;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
        Command::Snapshot => {
            telemetry::init(&config.infra.telemetry.log_level)?;
            snapshot(&config).await
        }
        Command::Run => {
            telemetry::init(&config.infra.telemetry.log_level)?;
            info!("patchbayd {} starting", env!("CARGO_PKG_VERSION"));
            for file in &sources.files {
                info!("Loaded config from {}", file.display());
            }
            run(&config).await
        }
    }
}

/// The configured backend. The memory backend is seeded with every port the
/// routes name, for dry runs.
fn build_backend(backend: &BackendConfig, routes: &[RouteConfig]) -> Arc<dyn GraphBackend> {
    match backend.kind {
        BackendKind::Jack => Arc::new(JackCliBackend::new(backend)),
        BackendKind::Memory => {
            let memory = MemoryBackend::new();
            for route in routes {
                for name in &route.source {
                    memory.add_port(name, false);
                }
                for name in &route.sink {
                    memory.add_port(name, true);
                }
            }
            Arc::new(memory)
        }
    }
}

fn build_manager(config: &PatchConfig) -> Arc<ReconciliationManager> {
    let backend = build_backend(&config.infra.backend, &config.bootstrap.routes);
    let bus = Arc::new(EventBus::new());
    bus.register_all(Arc::new(|event: &PatchEvent| -> anyhow::Result<()> {
        debug!(target: "patchbay::events", "{}", event);
        Ok(())
    }));

    Arc::new(ReconciliationManager::from_config(
        &config.infra.reconcile,
        backend,
        bus,
    ))
}

/// Acquire the endpoints of every configured route and the paths they
/// expand to. Returns the number of paths now tracked.
fn declare_routes(manager: &ReconciliationManager, routes: &[RouteConfig]) -> usize {
    for (index, route) in routes.iter().enumerate() {
        let policy: ConnectionPolicy = match route.policy.parse() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(route = index, "Skipping route: {}", e);
                continue;
            }
        };
        let (Some(source), Some(sink)) = (
            manager.endpoint(&route.source, Role::Source),
            manager.endpoint(&route.sink, Role::Sink),
        ) else {
            warn!(route = index, "Skipping route with an empty source or sink");
            continue;
        };

        manager.acquire(&source);
        manager.acquire(&sink);
        let paths = manager.get_signal_paths(&source, &sink, policy);
        for path in &paths {
            path.acquire();
        }
        info!(route = index, %policy, paths = paths.len(), "Route declared");
    }
    manager.paths().len()
}

async fn run(config: &PatchConfig) -> Result<()> {
    let manager = build_manager(config);

    info!(
        backend = config.infra.backend.kind.as_str(),
        routes = config.bootstrap.routes.len(),
        "Reconciling"
    );
    if !manager.start() {
        bail!("Reconciliation loop failed to start");
    }
    let tracked = declare_routes(&manager, &config.bootstrap.routes);
    info!("Tracking {} signal paths", tracked);

    wait_for_shutdown().await;

    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn snapshot(config: &PatchConfig) -> Result<()> {
    let manager = build_manager(config);
    manager.reconcile_once().await;
    let snapshot = manager
        .last_snapshot()
        .context("Failed to poll the patch graph")?;

    let json = serde_json::to_string_pretty(&snapshot.view())
        .context("Failed to serialize snapshot")?;
    println!("{}", json);

    manager.shutdown().await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
