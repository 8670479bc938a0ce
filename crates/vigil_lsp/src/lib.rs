//! Vigil LSP Server
//!
//! Language Server Protocol implementation for Vigil.
//! Keeps diagnostics of a whole policy workspace up to date while files are
//! edited, through the [`DiagnosticsScheduler`].

mod config;
pub mod conversion;
mod error;
mod jobs;
mod publish;
mod relay;
mod scheduler;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use parking_lot::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, error, info, warn};

use vigil_core::{Engine, EngineOptions, Evaluator, LinterConfig, RegoParser, is_policy_file};

pub use config::{ActiveConfig, ConfigStore, config_event_for, load_config, workspace_config};
pub use error::ServerError;
pub use jobs::{ChangeEvent, ConfigEvent, FileLintJob, WorkspaceLintJob};
pub use publish::Publisher;
pub use relay::{Admission, Relay, should_drop};
pub use scheduler::{DiagnosticsScheduler, ServerOptions};
pub use sink::DiagnosticsSink;

const POLICY_GLOB: &str = "**/*.rego";

/// The LSP backend for Vigil.
pub struct Backend {
    /// LSP client for sending notifications.
    client: Client,
    scheduler: DiagnosticsScheduler,
    /// Documents open in the editor; their contents come from the editor,
    /// not from disk.
    open_documents: DashSet<String>,
    /// Workspace root path.
    workspace_root: RwLock<Option<PathBuf>>,
    /// Whether the client accepts dynamic file watcher registration.
    watch_files: AtomicBool,
    /// Configuration file given on the command line.
    config_path: Option<PathBuf>,
}

impl Backend {
    /// Creates a new backend publishing to `client`.
    pub fn new(client: Client, evaluator: Arc<dyn Evaluator>, options: ServerOptions) -> Self {
        let config_path = options.config_path.clone();
        let scheduler = DiagnosticsScheduler::start(
            evaluator,
            Arc::new(RegoParser::new()),
            Arc::new(client.clone()),
            options,
        );
        Self {
            client,
            scheduler,
            open_documents: DashSet::new(),
            workspace_root: RwLock::new(None),
            watch_files: AtomicBool::new(false),
            config_path,
        }
    }

    async fn submit(&self, event: ChangeEvent) {
        if let Err(e) = self.scheduler.handle_event(event).await {
            error!("Failed to handle change: {}", e);
        }
    }

    async fn submit_config(&self, event: ConfigEvent) {
        if let Err(e) = self.scheduler.handle_config_event(event).await {
            error!("Failed to reload configuration: {}", e);
        }
    }

    async fn register_file_watchers(&self) {
        let mut watchers = vec![FileSystemWatcher {
            glob_pattern: GlobPattern::String(POLICY_GLOB.to_string()),
            kind: None,
        }];
        match &self.config_path {
            Some(path) => watchers.push(FileSystemWatcher {
                glob_pattern: GlobPattern::String(path.display().to_string()),
                kind: None,
            }),
            None => {
                for name in LinterConfig::CONFIG_FILES {
                    watchers.push(FileSystemWatcher {
                        glob_pattern: GlobPattern::String(format!("**/{}", name)),
                        kind: None,
                    });
                }
            }
        }

        let options = DidChangeWatchedFilesRegistrationOptions { watchers };
        let registration = Registration {
            id: "vigil-watched-files".to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: serde_json::to_value(options).ok(),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            warn!("Client refused file watcher registration: {}", e);
        }
    }

    async fn handle_watched_change(&self, change: FileEvent) {
        let Ok(path) = change.uri.to_file_path() else {
            debug!("Ignoring change of non-file URI: {}", change.uri);
            return;
        };
        let uri = change.uri.to_string();

        let deleted = change.typ == FileChangeType::DELETED;
        let root = self.workspace_root.read().clone();
        if let Some(root) = root
            && let Some(event) =
                config_event_for(&path, deleted, &root, self.config_path.as_deref())
        {
            self.submit_config(event).await;
            return;
        }
        if LinterConfig::is_config_file(&path) {
            debug!("Ignoring configuration file {}", path.display());
            return;
        }

        if !is_policy_file(&path) {
            return;
        }
        if deleted {
            self.open_documents.remove(&uri);
            self.submit(ChangeEvent::Deleted { uri }).await;
            return;
        }
        if self.open_documents.contains(&uri) {
            debug!("{} is open, keeping editor contents", uri);
            return;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => self.submit(ChangeEvent::Changed { uri, text }).await,
            Err(e) => warn!("Failed to read {}: {}", path.display(), e),
        }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        info!("Vigil LSP server initializing...");

        #[allow(deprecated)]
        let root = params
            .workspace_folders
            .and_then(|folders| folders.into_iter().next())
            .map(|folder| folder.uri)
            .or(params.root_uri)
            .and_then(|uri| uri.to_file_path().ok());
        *self.workspace_root.write() = root;

        let watch_files = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|workspace| workspace.did_change_watched_files.as_ref())
            .and_then(|watched| watched.dynamic_registration)
            .unwrap_or(false);
        self.watch_files.store(watch_files, Ordering::Relaxed);

        let rego_files = FileOperationRegistrationOptions {
            filters: vec![FileOperationFilter {
                scheme: Some("file".to_string()),
                pattern: FileOperationPattern {
                    glob: POLICY_GLOB.to_string(),
                    matches: None,
                    options: None,
                },
            }],
        };

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(true),
                        })),
                        ..Default::default()
                    },
                )),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: None,
                    file_operations: Some(WorkspaceFileOperationsServerCapabilities {
                        did_rename: Some(rego_files),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "vigil-lsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        if self.watch_files.load(Ordering::Relaxed) {
            self.register_file_watchers().await;
        }

        let root = self.workspace_root.read().clone();
        if let Some(root) = root {
            match load_config(&root, self.config_path.as_deref()) {
                Ok(config) => {
                    if let Err(e) = self.scheduler.initialize_config(config) {
                        error!("Invalid configuration, using defaults: {}", e);
                    }
                }
                Err(e) => error!("Failed to load configuration, using defaults: {}", e),
            }
            match self.scheduler.load_workspace(&root).await {
                Ok(count) => debug!("Workspace has {} policy files", count),
                Err(e) => error!("Failed to load workspace: {}", e),
            }
        }

        self.client
            .log_message(MessageType::INFO, "Vigil LSP server initialized!")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Vigil LSP server shutting down...");
        self.scheduler.shutdown().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        debug!("Document opened: {}", params.text_document.uri);

        let uri = params.text_document.uri.to_string();
        self.open_documents.insert(uri.clone());
        self.submit(ChangeEvent::Opened {
            uri,
            text: params.text_document.text,
        })
        .await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        debug!("Document changed: {}", params.text_document.uri);

        // Full sync: the last change holds the whole text.
        if let Some(change) = params.content_changes.into_iter().last() {
            self.submit(ChangeEvent::Changed {
                uri: params.text_document.uri.to_string(),
                text: change.text,
            })
            .await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        debug!("Document saved: {}", params.text_document.uri);

        self.submit(ChangeEvent::Saved {
            uri: params.text_document.uri.to_string(),
            text: params.text,
        })
        .await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        debug!("Document closed: {}", params.text_document.uri);

        // The file stays part of the workspace; only its source of truth moves
        // back to disk.
        self.open_documents
            .remove(&params.text_document.uri.to_string());
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        debug!("Watched files changed: {:?}", params.changes);

        for change in params.changes {
            self.handle_watched_change(change).await;
        }
    }

    async fn did_rename_files(&self, params: RenameFilesParams) {
        for file in params.files {
            debug!("File renamed: {} -> {}", file.old_uri, file.new_uri);
            if self.open_documents.remove(&file.old_uri).is_some() {
                self.open_documents.insert(file.new_uri.clone());
            }
            self.submit(ChangeEvent::Renamed {
                old: file.old_uri,
                new: file.new_uri,
            })
            .await;
        }
    }
}

/// Runs the LSP server over stdio.
///
/// Fails before serving when the rule engine cannot start.
pub async fn run(
    options: ServerOptions,
    engine_options: EngineOptions,
) -> std::result::Result<(), ServerError> {
    info!("Vigil LSP server starting...");

    let evaluator: Arc<dyn Evaluator> = Arc::new(Engine::new(engine_options)?);

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) =
        LspService::new(move |client| Backend::new(client, evaluator, options));
    Server::new(stdin, stdout, socket).serve(service).await;
    Ok(())
}
