//! The diagnostics scheduler.
//!
//! Changes enter through [`DiagnosticsScheduler::handle_event`], which updates
//! the [`FileCache`] right away and queues a file lint. Worker tasks then run
//! the passes:
//!
//! ```text
//! events ──► file_jobs ──► file-lint ──┐ (aggregate report)
//!                                      ▼
//! ticker / config / startup ──► workspace_jobs ──► workspace-relay ──► relay ──► workspace-lint
//! ```
//!
//! Each channel has a single consumer, so jobs for one file run in the order
//! they were submitted. Every result is written back conditionally on the
//! version of the contents it was computed from, which keeps a slow job from
//! overwriting the result of a newer one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_cache::{AggregateStore, BundleDiffCache, FileCache, FileState};
use vigil_core::{
    EnabledRules, EvalOutput, EvalRequest, Evaluator, IgnoreMatcher, LinterConfig, LinterError,
    Parser, SourceFile, discover_files,
};
use vigil_types::{Aggregate, AggregateMap, Diagnostic, FileUri};

use crate::ServerError;
use crate::config::{ActiveConfig, ConfigReloadCoordinator, ConfigStore};
use crate::conversion::{path_to_uri, uri_to_path};
use crate::jobs::{ChangeEvent, ConfigEvent, FileLintJob, WorkspaceLintJob};
use crate::publish::Publisher;
use crate::relay::Relay;
use crate::sink::DiagnosticsSink;

const CONFIG_QUEUE_CAPACITY: usize = 16;

/// Tuning knobs of the scheduler.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Capacity of the file job queue.
    pub file_queue_capacity: usize,
    /// Capacity of the workspace job queue.
    pub workspace_queue_capacity: usize,
    /// Capacity of the relay in front of the workspace worker.
    pub relay_capacity: usize,
    /// Fixed interval of periodic full passes.
    ///
    /// Overrides `workspace.ticker_interval_ms` from the configuration.
    pub ticker_interval: Option<Duration>,
    /// Configuration file used instead of the one found in the workspace root.
    pub config_path: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            file_queue_capacity: 100,
            workspace_queue_capacity: 100,
            relay_capacity: 10,
            ticker_interval: None,
            config_path: None,
        }
    }
}

/// State shared by the scheduler and its workers.
pub(crate) struct Inner {
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) parser: Arc<dyn Parser>,
    pub(crate) files: Arc<FileCache>,
    pub(crate) aggregates: AggregateStore,
    pub(crate) bundles: RwLock<Arc<BundleDiffCache>>,
    pub(crate) config: ConfigStore,
    pub(crate) publisher: Publisher,
    pub(crate) ticker_reset: Notify,
    file_tx: mpsc::Sender<FileLintJob>,
    workspace_tx: mpsc::Sender<WorkspaceLintJob>,
    root: RwLock<Option<PathBuf>>,
}

/// Owns the caches and the worker tasks of one server.
pub struct DiagnosticsScheduler {
    inner: Arc<Inner>,
    config_tx: mpsc::Sender<ConfigEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiagnosticsScheduler {
    /// Creates the caches and spawns the worker tasks.
    ///
    /// Must be called from within a tokio runtime. The scheduler starts with
    /// the default configuration; see [`DiagnosticsScheduler::initialize_config`].
    pub fn start(
        evaluator: Arc<dyn Evaluator>,
        parser: Arc<dyn Parser>,
        sink: Arc<dyn DiagnosticsSink>,
        options: ServerOptions,
    ) -> Self {
        let (file_tx, file_rx) = mpsc::channel(options.file_queue_capacity.max(1));
        let (workspace_tx, workspace_rx) = mpsc::channel(options.workspace_queue_capacity.max(1));
        let (config_tx, config_rx) = mpsc::channel(CONFIG_QUEUE_CAPACITY);
        let (relay, relay_rx) = Relay::new(options.relay_capacity);

        let files = Arc::new(FileCache::new());
        let defaults = ActiveConfig {
            catalog_revision: evaluator.catalog_revision(),
            enabled_rules: evaluator.enabled_rules(&LinterConfig::default()),
            config: LinterConfig::default(),
            ignore: IgnoreMatcher::default(),
        };

        let inner = Arc::new(Inner {
            evaluator,
            parser,
            publisher: Publisher::new(sink, files.clone()),
            files,
            aggregates: AggregateStore::new(),
            bundles: RwLock::new(Arc::new(BundleDiffCache::new(Vec::new()))),
            config: ConfigStore::new(defaults),
            ticker_reset: Notify::new(),
            file_tx,
            workspace_tx,
            root: RwLock::new(None),
        });

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_file_worker(inner.clone(), file_rx, cancel.clone())),
            tokio::spawn(run_relay_worker(relay, workspace_rx, cancel.clone())),
            tokio::spawn(run_workspace_worker(inner.clone(), relay_rx, cancel.clone())),
            tokio::spawn(ConfigReloadCoordinator::new(inner.clone()).run(config_rx, cancel.clone())),
            tokio::spawn(run_ticker(inner.clone(), options.ticker_interval, cancel.clone())),
        ];
        info!("Diagnostics scheduler started");

        Self {
            inner,
            config_tx,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Installs the configuration used before any reload event arrives.
    pub fn initialize_config(&self, config: LinterConfig) -> Result<(), ServerError> {
        self.inner.apply_config(config)?;
        self.inner.ticker_reset.notify_one();
        Ok(())
    }

    /// Loads every policy file under `root` and queues the initial full pass.
    ///
    /// Returns the number of files loaded.
    pub async fn load_workspace(&self, root: &Path) -> Result<usize, ServerError> {
        *self.inner.root.write() = Some(root.to_path_buf());

        let roots = vec![root.to_path_buf()];
        let paths =
            tokio::task::spawn_blocking(move || discover_files(&roots, &IgnoreMatcher::default()))
                .await?;

        let active = self.inner.config.current();
        let mut loaded = 0;
        for path in paths {
            let Some(uri) = path_to_uri(&path) else {
                warn!("Skipping {}: not an absolute path", path.display());
                continue;
            };
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    continue;
                }
            };
            if active.is_ignored(&uri) {
                self.inner.files.set_ignored_contents(&uri, contents);
            } else {
                self.inner.files.set_contents(&uri, contents);
            }
            loaded += 1;
        }
        info!("Loaded {} files from {}", loaded, root.display());

        self.inner
            .enqueue_workspace(WorkspaceLintJob::full("workspace loaded", true))
            .await?;
        Ok(loaded)
    }

    /// Applies a change to a policy file.
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<(), ServerError> {
        match event {
            ChangeEvent::Opened { uri, text } => self.inner.update_contents(uri, text, "opened").await,
            ChangeEvent::Changed { uri, text } => {
                self.inner.update_contents(uri, text, "changed").await
            }
            ChangeEvent::Saved {
                uri,
                text: Some(text),
            } => self.inner.update_contents(uri, text, "saved").await,
            ChangeEvent::Saved { uri, text: None } => {
                if self.inner.files.contains(&uri) {
                    self.inner.enqueue_file(uri, "saved").await
                } else {
                    self.inner.load_from_disk(uri, "saved").await
                }
            }
            ChangeEvent::Renamed { old, new } => self.inner.rename(old, new).await,
            ChangeEvent::Deleted { uri } => self.inner.delete(&uri).await,
        }
    }

    /// Hands a configuration change to the reload coordinator.
    pub async fn handle_config_event(&self, event: ConfigEvent) -> Result<(), ServerError> {
        self.config_tx
            .send(event)
            .await
            .map_err(|_| ServerError::QueueClosed("config-reload"))
    }

    /// Queues a workspace pass.
    pub async fn request_workspace_lint(&self, job: WorkspaceLintJob) -> Result<(), ServerError> {
        self.inner.enqueue_workspace(job).await
    }

    /// The file cache.
    pub fn file_cache(&self) -> &FileCache {
        &self.inner.files
    }

    /// The aggregate store.
    pub fn aggregate_store(&self) -> &AggregateStore {
        &self.inner.aggregates
    }

    /// The configuration currently in effect.
    pub fn active_config(&self) -> Arc<ActiveConfig> {
        self.inner.active_config()
    }

    /// Stops every worker and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Diagnostics scheduler stopped");
    }
}

impl Drop for DiagnosticsScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_file_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<FileLintJob>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => inner.lint_file(job).await,
                None => break,
            },
        }
    }
    debug!("File lint worker stopped");
}

async fn run_relay_worker(
    relay: Relay,
    mut rx: mpsc::Receiver<WorkspaceLintJob>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => {
                    if let Err(e) = relay.admit(job).await {
                        debug!("{}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("Workspace relay worker stopped");
}

async fn run_workspace_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<WorkspaceLintJob>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => inner.lint_workspace(job).await,
                None => break,
            },
        }
    }
    debug!("Workspace lint worker stopped");
}

async fn run_ticker(inner: Arc<Inner>, fixed: Option<Duration>, cancel: CancellationToken) {
    loop {
        let interval = fixed.or_else(|| {
            inner
                .config
                .current()
                .config
                .workspace
                .ticker_interval_ms
                .map(Duration::from_millis)
        });

        match interval {
            Some(interval) => tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.ticker_reset.notified() => continue,
                _ = tokio::time::sleep(interval) => {
                    let job = WorkspaceLintJob::full("ticker", false);
                    if let Err(e) = inner.enqueue_workspace(job).await {
                        debug!("{}", e);
                        break;
                    }
                }
            },
            None => tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.ticker_reset.notified() => continue,
            },
        }
    }
    debug!("Ticker stopped");
}

/// Result of analyzing one file.
enum FileOutcome {
    ParseFailed(Vec<Diagnostic>),
    Evaluated {
        diagnostics: Vec<Diagnostic>,
        aggregate: Option<Aggregate>,
    },
}

fn analyze_file(
    parser: &dyn Parser,
    evaluator: &dyn Evaluator,
    uri: &str,
    contents: String,
    enabled_rules: EnabledRules,
) -> Result<FileOutcome, LinterError> {
    let module = match parser.parse(uri, &contents) {
        Ok(module) => module,
        Err(errors) => return Ok(FileOutcome::ParseFailed(errors)),
    };

    let mut files = BTreeMap::new();
    files.insert(uri.to_string(), SourceFile { contents, module });
    let request = EvalRequest {
        files,
        enabled_rules,
        ..EvalRequest::default()
    };
    let mut output = evaluator.evaluate(&request)?;
    log_notices(&output);

    Ok(FileOutcome::Evaluated {
        diagnostics: output.violations.remove(uri).unwrap_or_default(),
        aggregate: output.aggregates.remove(uri),
    })
}

/// Result of analyzing a workspace snapshot.
struct WorkspaceOutcome {
    versions: HashMap<FileUri, u64>,
    parse_errors: Vec<(FileUri, Vec<Diagnostic>)>,
    output: EvalOutput,
}

fn analyze_workspace(
    parser: &dyn Parser,
    evaluator: &dyn Evaluator,
    bundles: &BundleDiffCache,
    snapshot: HashMap<FileUri, FileState>,
    enabled_rules: EnabledRules,
) -> Result<WorkspaceOutcome, LinterError> {
    let changed = bundles.refresh();
    if !changed.is_empty() {
        info!("Bundles changed: {}", changed.join(", "));
    }

    let versions = snapshot
        .iter()
        .map(|(uri, state)| (uri.clone(), state.version))
        .collect();

    let parsed: Vec<(FileUri, Result<SourceFile, Vec<Diagnostic>>)> = snapshot
        .into_par_iter()
        .map(|(uri, state)| {
            let result = parser.parse(&uri, &state.contents);
            let result = result.map(|module| SourceFile {
                contents: state.contents,
                module,
            });
            (uri, result)
        })
        .collect();

    let mut files = BTreeMap::new();
    let mut parse_errors = Vec::new();
    for (uri, result) in parsed {
        match result {
            Ok(source) => {
                files.insert(uri, source);
            }
            Err(errors) => parse_errors.push((uri, errors)),
        }
    }

    let request = EvalRequest {
        files,
        enabled_rules,
        prior_aggregates: None,
        data_roots: bundles.data_roots(),
    };
    let output = evaluator.evaluate(&request)?;
    log_notices(&output);

    Ok(WorkspaceOutcome {
        versions,
        parse_errors,
        output,
    })
}

fn log_notices(output: &EvalOutput) {
    for notice in &output.notices {
        warn!("{}", notice);
    }
}

impl Inner {
    pub(crate) fn workspace_root(&self) -> Option<PathBuf> {
        self.root.read().clone()
    }

    pub(crate) async fn enqueue_file(
        &self,
        uri: FileUri,
        reason: &'static str,
    ) -> Result<(), ServerError> {
        self.file_tx
            .send(FileLintJob { uri, reason })
            .await
            .map_err(|_| ServerError::QueueClosed("file-lint"))
    }

    pub(crate) async fn enqueue_workspace(&self, job: WorkspaceLintJob) -> Result<(), ServerError> {
        self.workspace_tx
            .send(job)
            .await
            .map_err(|_| ServerError::QueueClosed("workspace-lint"))
    }

    /// Stores new contents of `uri` and queues a lint, or parks them in the
    /// ignored namespace.
    async fn update_contents(
        &self,
        uri: FileUri,
        text: String,
        reason: &'static str,
    ) -> Result<(), ServerError> {
        if self.config.current().is_ignored(&uri) {
            let was_linted = self.files.mark_ignored(&uri);
            self.files.set_ignored_contents(&uri, text);
            self.publisher.publish(&uri).await;
            if let Some(version) = was_linted {
                self.aggregates.remove(&uri, version);
                self.enqueue_workspace(WorkspaceLintJob::aggregate_report("file ignored"))
                    .await?;
            }
            return Ok(());
        }

        self.files.mark_unignored(&uri);
        self.files.set_contents(&uri, text);
        self.enqueue_file(uri, reason).await
    }

    async fn load_from_disk(&self, uri: FileUri, reason: &'static str) -> Result<(), ServerError> {
        let Some(path) = uri_to_path(&uri) else {
            warn!("Cannot load {}: not a file URI", uri);
            return Ok(());
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => self.update_contents(uri, text, reason).await,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                Ok(())
            }
        }
    }

    async fn rename(&self, old: FileUri, new: FileUri) -> Result<(), ServerError> {
        let Some(version) = self.files.rename(&old, &new) else {
            // Not linted under the old name: ignored, or never seen.
            match self.files.get_ignored_contents(&old) {
                Some(text) => {
                    self.files.delete(&old);
                    return self.update_contents(new, text, "renamed").await;
                }
                None => return self.load_from_disk(new, "renamed").await,
            }
        };

        self.aggregates.remove(&old, version);
        self.publisher.publish(&old).await;
        self.enqueue_workspace(WorkspaceLintJob::aggregate_report("file renamed"))
            .await?;

        if self.config.current().is_ignored(&new) {
            if let Some(version) = self.files.mark_ignored(&new) {
                self.aggregates.remove(&new, version);
            }
            self.publisher.publish(&new).await;
            return Ok(());
        }
        self.enqueue_file(new, "renamed").await
    }

    async fn delete(&self, uri: &str) -> Result<(), ServerError> {
        let version = self.files.delete(uri);
        self.aggregates.remove(uri, version);
        self.publisher.publish(uri).await;
        self.enqueue_workspace(WorkspaceLintJob::aggregate_report("file deleted"))
            .await
    }

    /// Runs one file job: parse, evaluate single-file rules, merge the
    /// file's aggregate and publish.
    async fn lint_file(&self, job: FileLintJob) {
        let Some((contents, version)) = self.files.get_contents(&job.uri) else {
            warn!("Skipping lint of {} ({}): no contents", job.uri, job.reason);
            return;
        };
        debug!("Linting {} at version {} ({})", job.uri, version, job.reason);

        let rules = self.active_config().enabled_rules.without_aggregate();
        let rule_names = rules.names();
        let parser = self.parser.clone();
        let evaluator = self.evaluator.clone();
        let uri = job.uri.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            analyze_file(parser.as_ref(), evaluator.as_ref(), &uri, contents, rules)
        })
        .await;

        let (diagnostics, aggregate) = match outcome {
            Ok(Ok(FileOutcome::Evaluated {
                diagnostics,
                aggregate,
            })) => (diagnostics, aggregate),
            Ok(Ok(FileOutcome::ParseFailed(errors))) => {
                debug!("{} has {} parse errors", job.uri, errors.len());
                if self.files.set_parse_errors(&job.uri, errors, Some(version)) {
                    self.publisher.publish(&job.uri).await;
                }
                return;
            }
            Ok(Err(e)) => {
                error!("Failed to lint {}: {}", job.uri, e);
                return;
            }
            Err(e) => {
                error!("Lint task for {} failed: {}", job.uri, e);
                return;
            }
        };

        if !self.files.set_parse_errors(&job.uri, Vec::new(), Some(version)) {
            return;
        }
        self.files
            .set_diagnostics_for_rules(&job.uri, &rule_names, diagnostics, Some(version));
        if let Some(aggregate) = aggregate
            && self
                .files
                .set_aggregate(&job.uri, Some(aggregate.clone()), Some(version))
        {
            self.aggregates.merge_one(&job.uri, version, aggregate);
        }
        self.publisher.publish(&job.uri).await;

        let report = WorkspaceLintJob::aggregate_report(format!("{} linted", job.uri));
        if let Err(e) = self.enqueue_workspace(report).await {
            debug!("{}", e);
        }
    }

    async fn lint_workspace(&self, job: WorkspaceLintJob) {
        if job.aggregate_report_only {
            self.report_aggregates(&job.reason).await;
        } else {
            self.lint_all(&job).await;
        }
    }

    /// Runs a full pass over every cached file.
    async fn lint_all(&self, job: &WorkspaceLintJob) {
        let as_of = self.files.current_version();
        let snapshot = self.files.all_files();
        info!(
            "Linting workspace: {} files ({}{})",
            snapshot.len(),
            job.reason,
            if job.overwrite_aggregates { ", overwrite" } else { "" }
        );

        let rules = self.active_config().enabled_rules.without_aggregate();
        let parser = self.parser.clone();
        let evaluator = self.evaluator.clone();
        let bundles = self.bundles.read().clone();
        let outcome = tokio::task::spawn_blocking(move || {
            analyze_workspace(
                parser.as_ref(),
                evaluator.as_ref(),
                &bundles,
                snapshot,
                rules,
            )
        })
        .await;

        let WorkspaceOutcome {
            versions,
            parse_errors,
            mut output,
        } = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("Workspace lint failed: {}", e);
                return;
            }
            Err(e) => {
                error!("Workspace lint task failed: {}", e);
                return;
            }
        };

        let previous = self.aggregates.versioned_snapshot();
        let mut fresh: Vec<(FileUri, u64, Aggregate)> = Vec::new();

        for (uri, errors) in parse_errors {
            let Some(&version) = versions.get(&uri) else {
                continue;
            };
            self.files.set_parse_errors(&uri, errors, Some(version));
            // Keep the last good contribution of files that stopped parsing.
            if let Some((version, aggregate)) = previous.get(&uri) {
                fresh.push((uri, *version, aggregate.clone()));
            }
        }

        for (uri, diagnostics) in output.violations {
            let Some(&version) = versions.get(&uri) else {
                continue;
            };
            if self.files.set_parse_errors(&uri, Vec::new(), Some(version)) {
                self.files.set_diagnostics(&uri, diagnostics, Some(version));
            }
            if let Some(aggregate) = output.aggregates.remove(&uri) {
                self.files
                    .set_aggregate(&uri, Some(aggregate.clone()), Some(version));
                fresh.push((uri, version, aggregate));
            }
        }

        if job.overwrite_aggregates {
            self.aggregates.overwrite(fresh, as_of);
        } else {
            for (uri, version, aggregate) in fresh {
                self.aggregates.merge_one(&uri, version, aggregate);
            }
        }

        self.report_aggregates(&job.reason).await;
    }

    /// Re-runs aggregate rules over the aggregate store and publishes every
    /// cached file.
    async fn report_aggregates(&self, reason: &str) {
        let rules = self.active_config().enabled_rules.aggregate_only();
        let rule_names = rules.names();
        let snapshot = self.aggregates.versioned_snapshot();
        debug!(
            "Reporting aggregate rules over {} files ({})",
            snapshot.len(),
            reason
        );

        if !rules.is_empty() {
            let prior: AggregateMap = snapshot
                .iter()
                .map(|(uri, (_, aggregate))| (uri.clone(), aggregate.clone()))
                .collect();
            let request = EvalRequest {
                files: BTreeMap::new(),
                enabled_rules: rules,
                prior_aggregates: Some(prior),
                data_roots: self.bundles.read().data_roots(),
            };
            let evaluator = self.evaluator.clone();
            let outcome =
                tokio::task::spawn_blocking(move || evaluator.evaluate(&request)).await;

            let mut violations = match outcome {
                Ok(Ok(output)) => {
                    log_notices(&output);
                    output.violations
                }
                Ok(Err(e)) => {
                    error!("Aggregate evaluation failed: {}", e);
                    return;
                }
                Err(e) => {
                    error!("Aggregate evaluation task failed: {}", e);
                    return;
                }
            };

            for (uri, (version, _)) in &snapshot {
                let diagnostics = violations.remove(uri).unwrap_or_default();
                self.files
                    .set_diagnostics_for_rules(uri, &rule_names, diagnostics, Some(*version));
            }
        }

        self.publisher.publish_all().await;
    }
}
