//! Active configuration and its reload coordinator.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use vigil_cache::BundleDiffCache;
use vigil_core::{EnabledRules, Evaluator, IgnoreMatcher, LinterConfig, LinterError};

use crate::conversion::uri_to_path;
use crate::jobs::{ConfigEvent, WorkspaceLintJob};
use crate::scheduler::Inner;

/// A configuration together with everything derived from it.
#[derive(Debug)]
pub struct ActiveConfig {
    pub config: LinterConfig,
    pub enabled_rules: EnabledRules,
    pub ignore: IgnoreMatcher,
    /// Catalog revision `enabled_rules` was resolved against.
    pub catalog_revision: u64,
}

impl ActiveConfig {
    /// Resolves `config` against the evaluator's rule catalog.
    pub fn new(config: LinterConfig, evaluator: &dyn Evaluator) -> Result<Self, LinterError> {
        let ignore = config.ignore_matcher()?;
        let catalog_revision = evaluator.catalog_revision();
        let enabled_rules = evaluator.enabled_rules(&config);
        Ok(Self {
            config,
            enabled_rules,
            ignore,
            catalog_revision,
        })
    }

    /// Returns true if the file behind `uri` is excluded from linting.
    pub fn is_ignored(&self, uri: &str) -> bool {
        uri_to_path(uri).is_some_and(|path| self.ignore.is_ignored(path))
    }
}

/// Holder of the current [`ActiveConfig`].
///
/// Readers get an `Arc` to a complete configuration; a reload replaces the
/// whole value at once.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<ActiveConfig>>,
}

impl ConfigStore {
    pub fn new(active: ActiveConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(active)),
        }
    }

    /// The current configuration.
    pub fn current(&self) -> Arc<ActiveConfig> {
        self.current.read().clone()
    }

    /// Installs `active` and returns the configuration it replaced.
    pub fn replace(&self, active: ActiveConfig) -> Arc<ActiveConfig> {
        std::mem::replace(&mut *self.current.write(), Arc::new(active))
    }

    /// Installs `fresh` unless `stale` was replaced in the meantime.
    ///
    /// Returns the configuration in effect afterwards.
    pub fn refresh(&self, stale: &Arc<ActiveConfig>, fresh: ActiveConfig) -> Arc<ActiveConfig> {
        let mut current = self.current.write();
        if Arc::ptr_eq(&current, stale) {
            *current = Arc::new(fresh);
        }
        current.clone()
    }
}

/// Applies configuration changes to a running scheduler.
pub(crate) struct ConfigReloadCoordinator {
    inner: Arc<Inner>,
}

impl ConfigReloadCoordinator {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) async fn run(self, mut rx: mpsc::Receiver<ConfigEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.reload(event).await,
                    None => break,
                },
            }
        }
        debug!("Config reload worker stopped");
    }

    async fn reload(&self, event: ConfigEvent) {
        let config = match event {
            ConfigEvent::Changed(path) => match LinterConfig::from_file(&path) {
                Ok(config) => {
                    info!("Reloaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    error!("Keeping previous configuration: {}", e);
                    return;
                }
            },
            ConfigEvent::Dropped => {
                info!("Configuration removed, using defaults");
                LinterConfig {
                    base_dir: self.inner.workspace_root(),
                    ..LinterConfig::default()
                }
            }
        };

        let current = self.inner.config.current();
        if config.base_dir == current.config.base_dir && config.hash() == current.config.hash() {
            debug!("Configuration unchanged, skipping reload");
            return;
        }

        if let Err(e) = self.inner.apply_config(config) {
            error!("Keeping previous configuration: {}", e);
            return;
        }
        self.inner.ticker_reset.notify_one();
        self.sync_ignored().await;

        let job = WorkspaceLintJob::full("configuration changed", true);
        if let Err(e) = self.inner.enqueue_workspace(job).await {
            error!("Failed to schedule workspace lint: {}", e);
        }
    }

    /// Moves cached files between the normal and ignored namespaces to match
    /// the current ignore patterns.
    async fn sync_ignored(&self) {
        let active = self.inner.config.current();
        let files = &self.inner.files;

        for uri in files.uris() {
            if !active.is_ignored(&uri) {
                continue;
            }
            if let Some(version) = files.mark_ignored(&uri) {
                debug!("{} is now ignored", uri);
                self.inner.aggregates.remove(&uri, version);
                self.inner.publisher.publish(&uri).await;
            }
        }

        for uri in files.ignored_uris() {
            if !active.is_ignored(&uri) && files.mark_unignored(&uri).is_some() {
                debug!("{} is no longer ignored", uri);
            }
        }
    }
}

impl Inner {
    /// The configuration in effect, with its rules re-resolved if the rule
    /// catalog changed since they were resolved.
    pub(crate) fn active_config(&self) -> Arc<ActiveConfig> {
        let active = self.config.current();
        if self.evaluator.catalog_revision() == active.catalog_revision {
            return active;
        }

        info!("Rule catalog changed, resolving enabled rules again");
        match ActiveConfig::new(active.config.clone(), self.evaluator.as_ref()) {
            Ok(fresh) => self.config.refresh(&active, fresh),
            Err(e) => {
                error!("Keeping previously resolved rules: {}", e);
                active
            }
        }
    }

    /// Installs `config`, rebuilding the bundle cache when its roots moved.
    pub(crate) fn apply_config(&self, config: LinterConfig) -> Result<(), LinterError> {
        let active = ActiveConfig::new(config, self.evaluator.as_ref())?;
        let roots = active.config.bundle_roots();
        info!(
            "Active configuration: {} rules enabled, {} ignore patterns",
            active.enabled_rules.len(),
            active.config.ignore.len()
        );
        self.config.replace(active);

        let mut bundles = self.bundles.write();
        if bundles.roots() != roots.as_slice() {
            debug!("Bundle roots changed to {:?}", roots);
            *bundles = Arc::new(BundleDiffCache::new(roots));
        }
        Ok(())
    }
}

/// Maps a change of the file at `path` to a configuration event.
///
/// With an `explicit` configuration file only that file counts. Otherwise
/// only configuration files directly in `root` do, and the event names
/// whichever of them is still there.
pub fn config_event_for(
    path: &Path,
    deleted: bool,
    root: &Path,
    explicit: Option<&Path>,
) -> Option<ConfigEvent> {
    if let Some(explicit) = explicit {
        if path != explicit {
            return None;
        }
        return Some(if deleted {
            ConfigEvent::Dropped
        } else {
            ConfigEvent::Changed(path.to_path_buf())
        });
    }

    if !LinterConfig::is_config_file(path) || path.parent() != Some(root) {
        return None;
    }
    Some(match LinterConfig::discover(root) {
        Some(found) => ConfigEvent::Changed(found),
        None => ConfigEvent::Dropped,
    })
}

/// Loads the configuration `explicit` names, or the one found in `root`.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> Result<LinterConfig, LinterError> {
    match explicit {
        Some(path) => LinterConfig::from_file(path),
        None => workspace_config(root),
    }
}

/// Loads the configuration found in `root`, or the defaults.
pub fn workspace_config(root: &Path) -> Result<LinterConfig, LinterError> {
    match LinterConfig::discover(root) {
        Some(path) => LinterConfig::from_file(path),
        None => Ok(LinterConfig {
            base_dir: Some(root.to_path_buf()),
            ..LinterConfig::default()
        }),
    }
}
