//! Daemon wiring: catalog + handler factory + reconciler, on a timer.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stow_core::config::StowConfig;
use stow_storage::{check_health, OpendalFactory};
use stow_sync::{JsonCatalog, Reconciler, WalkRules};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load the config file, falling back to defaults when it doesn't exist.
/// The flag reports whether defaults were used.
pub async fn load_config(path: &Path) -> Result<(StowConfig, bool)> {
    if !path.exists() {
        return Ok((StowConfig::default(), true));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: StowConfig =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, false))
}

/// Open the catalog and handler factory described by `config`.
pub fn open_backends(config: &StowConfig) -> Result<(Arc<JsonCatalog>, Arc<OpendalFactory>)> {
    let store = JsonCatalog::open(&config.metadata.catalog).with_context(|| {
        format!("opening catalog {}", config.metadata.catalog.display())
    })?;

    let credentials = OpendalFactory::credentials_from_env(
        &config.storage.access_key_env,
        &config.storage.secret_key_env,
    );
    if credentials.is_none() {
        info!(
            "{} / {} not set; S3 policies will fail",
            config.storage.access_key_env, config.storage.secret_key_env
        );
    }
    let factory = OpendalFactory::new(config.storage.enforce_tls, credentials);
    Ok((Arc::new(store), Arc::new(factory)))
}

/// Probe every policy's backend once. Failures are logged, not fatal.
/// Returns the number of reachable backends.
pub async fn check_policies(store: &JsonCatalog, factory: &OpendalFactory) -> Result<usize> {
    let mut healthy = 0;
    for policy in store.snapshot()?.policies {
        let op = match factory.operator_for(&policy) {
            Ok(op) => op,
            Err(e) => {
                warn!(policy = policy.id, "storage unusable: {e}");
                continue;
            }
        };
        match check_health(&op).await {
            Ok(()) => {
                info!(policy = policy.id, backend = ?policy.backend, "storage: connected");
                healthy += 1;
            }
            Err(e) => warn!(policy = policy.id, backend = ?policy.backend, "{e}"),
        }
    }
    Ok(healthy)
}

/// Build the reconciler described by `config` over an opened catalog.
pub fn build_reconciler(
    config: &StowConfig,
    store: Arc<JsonCatalog>,
    factory: Arc<OpendalFactory>,
    cancel: CancellationToken,
) -> Reconciler {
    Reconciler::new(store, factory)
        .with_rules(WalkRules {
            skip_dir_marker: config.sync.skip_dir_marker.clone(),
            skip_file_suffix: config.sync.skip_file_suffix.clone(),
        })
        .with_workers(config.sync.effective_workers())
        .with_cancellation(cancel)
}

pub async fn run(config: StowConfig, once: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let (store, factory) = open_backends(&config)?;
    check_policies(&store, &factory).await?;
    let reconciler = build_reconciler(&config, store, factory, cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let interval = Duration::from_secs(config.sync.interval_secs);
    loop {
        let summary = reconciler.sync().await;
        if let Some(e) = &summary.error {
            warn!("pass aborted before any user was processed: {e}");
        }

        if once || interval.is_zero() || cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("stowd stopped");
    Ok(())
}
