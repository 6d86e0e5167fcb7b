//! portfwd - runtime-managed TCP port forwarding
//!
//! Each rule binds a local port and relays traffic to a remote host:port,
//! tracking per-rule byte counters, connection counts and last activity.
//! Rules can be added, edited, deleted, started and stopped at runtime.

// Use mimalloc as the global allocator for better performance
// with high-frequency buffer allocations (two relay buffers per connection)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod forwarding;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::ConfigStorage;
use forwarding::{ForwardError, ForwardingManager, RuleRegistry, RuleStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Process-level options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Rules file; defaults to ~/.portfwd/rules.json
    pub config_path: Option<PathBuf>,
    /// Period of the status log, None disables it
    pub status_interval: Option<Duration>,
}

/// Load the rules, start every forwarder and run until Ctrl-C / SIGTERM.
///
/// Every forwarder is stopped before this returns.
pub async fn run(options: RunOptions) -> Result<(), ForwardError> {
    let mut storage = match options.config_path {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new()?,
    };
    tracing::info!("Using config file {:?}", storage.path());

    let config = storage.load_or_init().await?;
    let store: Arc<dyn RuleStore> = Arc::new(storage);
    let registry = RuleRegistry::load(store).await?;
    let manager = Arc::new(ForwardingManager::new(registry, config.settings));

    manager.start_all().await;
    for snapshot in manager.snapshots().await {
        if let Some(ref error) = snapshot.error {
            tracing::warn!("Forward '{}' not started: {}", snapshot.name, error);
        }
    }

    let status_task = options.status_interval.map(|every| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for snapshot in manager.snapshots().await {
                    tracing::info!("{}", snapshot);
                }
            }
        })
    });

    shutdown_signal().await;
    tracing::info!("Shutting down, stopping all port forwards...");

    if let Some(task) = status_task {
        task.abort();
    }
    manager.stop_all().await;
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
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
