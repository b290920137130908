//! Notify-based configuration hot-reload watcher.
//!
//! - Watches the limits JSON file using notify::RecommendedWatcher.
//! - On create/modify events, reloads the file and atomically replaces the policy cache.

use crate::config::loader::{build_policy_cache, load_limits_from_file};
use crate::config::PolicyCache;
use crate::errors::GatewayError;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the limits file and swap a freshly built [`PolicyCache`] into
/// `shared_cache` after every successful reload. A failed reload keeps the
/// previous policies.
pub async fn watch_config_file(
    path: PathBuf,
    shared_cache: Arc<ArcSwap<PolicyCache>>,
) -> Result<(), notify::Error> {
    // Bridges the synchronous watcher callback with this task.
    let (tx, mut rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send config file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("Watching limits file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event) {
                    info!(
                        "Limits file change detected. Event: {:?}. Triggering reload.",
                        event.kind
                    );
                    reload_config(&path, &shared_cache).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_config_reload(false);
                error!("Error watching limits file: {}", e);
            }
        }
    }

    warn!("Configuration watcher task is shutting down.");
    Ok(())
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    )
}

/// Reload the file and swap the new cache in. Returns whether a swap happened.
pub async fn reload_config(path: &Path, shared_cache: &Arc<ArcSwap<PolicyCache>>) -> bool {
    let limits = match load_limits_from_file(path).await {
        Ok(limits) => limits,
        Err(e) => {
            crate::metrics::record_config_reload(false);
            match e {
                GatewayError::FileSystem(io_err) => error!(
                    "Failed to read limits file '{}': {}. Keeping old config.",
                    path.display(),
                    io_err
                ),
                GatewayError::Json(json_err) => error!(
                    "Failed to parse JSON from '{}': {}. Keeping old config.",
                    path.display(),
                    json_err
                ),
                other => error!(
                    "Limits file '{}' is invalid: {}. Keeping old config.",
                    path.display(),
                    other
                ),
            }
            return false;
        }
    };

    let cache = build_policy_cache(&limits);
    let rejected = cache.stats().rejected_count;

    // Readers holding the old Arc finish with it; new readers see the new one.
    shared_cache.store(Arc::new(cache));
    crate::metrics::record_config_reload(true);
    info!(
        "Limits hot-reloaded successfully ({} model entries rejected).",
        rejected
    );
    true
}
