//! Hot-reload watcher for `orch.config.json` / `.orchrc`.
//!
//! Grounded on the teacher's `store::watcher::StoreWatcher`: a
//! `notify::RecommendedWatcher` callback bridges filesystem events into a
//! bounded `tokio::sync::mpsc` channel, a background task debounces bursts
//! of events before acting, and a `rescan_needed` flag absorbs channel
//! overflow instead of blocking the `notify` callback thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;

use crate::error::{OrchError, Result};
use crate::events::{EventBus, OrchEvent};

use super::Config;

const CHANNEL_CAPACITY: usize = 64;
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(150);

/// Watches the project root for config file changes and swaps the shared
/// `Config` in place. Holds the `notify::RecommendedWatcher` alive for its
/// own lifetime; dropping the `ConfigWatcher` stops watching.
pub struct ConfigWatcher {
    current: Arc<RwLock<Config>>,
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `root` for config changes, reloading `initial` on
    /// every debounced filesystem event. Parse failures are logged via
    /// `event_bus` and the previous valid config is retained (SPEC_FULL §7:
    /// "hot-reload errors are logged and the previous valid config is
    /// retained").
    pub fn start(root: &Path, initial: Config, event_bus: Arc<EventBus>) -> Result<Self> {
        let current = Arc::new(RwLock::new(initial));
        let (bridge_tx, bridge_rx) = tokio::sync::mpsc::channel::<notify::Event>(CHANNEL_CAPACITY);
        let rescan_needed = Arc::new(AtomicBool::new(false));

        let watcher = {
            let tx = bridge_tx;
            let rescan = Arc::clone(&rescan_needed);
            notify::RecommendedWatcher::new(
                move |res: std::result::Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        if tx.try_send(event).is_err() {
                            rescan.store(true, Ordering::Relaxed);
                        }
                    }
                    Err(_) => {
                        rescan.store(true, Ordering::Relaxed);
                    }
                },
                notify::Config::default(),
            )
            .map_err(|e| OrchError::Config(format!("failed to create config watcher: {e}")))?
        };

        let mut watcher = watcher;
        if root.exists() {
            watcher
                .watch(root, RecursiveMode::NonRecursive)
                .map_err(|e| OrchError::Config(format!("failed to watch {}: {e}", root.display())))?;
        }

        let task_current = Arc::clone(&current);
        let task_root = root.to_path_buf();
        let task_bus = Arc::clone(&event_bus);
        tokio::spawn(async move {
            run_reload_loop(bridge_rx, rescan_needed, task_root, task_current, task_bus).await;
        });

        Ok(ConfigWatcher {
            current,
            _watcher: watcher,
        })
    }

    pub fn current(&self) -> Config {
        self.current.read().clone()
    }

    pub fn handle(&self) -> Arc<RwLock<Config>> {
        Arc::clone(&self.current)
    }
}

async fn run_reload_loop(
    mut bridge_rx: tokio::sync::mpsc::Receiver<notify::Event>,
    rescan_needed: Arc<AtomicBool>,
    root: PathBuf,
    current: Arc<RwLock<Config>>,
    event_bus: Arc<EventBus>,
) {
    loop {
        let first = match bridge_rx.recv().await {
            Some(event) => event,
            None => return,
        };
        let mut relevant = is_relevant(&first, &root);

        // Absorb a short burst of related events into a single reload.
        let deadline = tokio::time::Instant::now() + DEBOUNCE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, bridge_rx.recv()).await {
                Ok(Some(event)) => relevant |= is_relevant(&event, &root),
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if rescan_needed.swap(false, Ordering::Relaxed) {
            relevant = true;
        }
        if !relevant {
            continue;
        }

        reload(&root, &current, &event_bus);
    }
}

fn is_relevant(event: &notify::Event, root: &Path) -> bool {
    is_relevant_path(&event.paths, root)
}

fn is_relevant_path(paths: &[PathBuf], root: &Path) -> bool {
    let project_config = Config::project_config_path(root);
    let orchrc = Config::orchrc_path(root);
    paths.iter().any(|p| p == &project_config || p == &orchrc)
}

fn reload(root: &Path, current: &Arc<RwLock<Config>>, event_bus: &Arc<EventBus>) {
    match Config::load_with_details(root, &env_snapshot()) {
        Ok((config, issues)) => {
            for issue in &issues {
                event_bus.publish(OrchEvent::warn(format!(
                    "config reload: ignoring invalid override from {}: {}",
                    issue.source, issue.detail
                )));
            }
            *current.write() = config;
            event_bus.publish(OrchEvent::info("configuration reloaded"));
        }
        Err(e) => {
            event_bus.publish(OrchEvent::error(format!(
                "config reload failed, retaining previous configuration: {e}"
            )));
        }
    }
}

fn env_snapshot() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_relevant_matches_only_config_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_relevant_path(
            &[Config::project_config_path(dir.path())],
            dir.path()
        ));
        assert!(is_relevant_path(&[Config::orchrc_path(dir.path())], dir.path()));
        assert!(!is_relevant_path(
            &[dir.path().join("PLAN.md")],
            dir.path()
        ));
    }
}
