#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use vigil_core::{Engine, EngineOptions, RegoParser};
use vigil_lsp::conversion::path_to_uri;
use vigil_lsp::{DiagnosticsScheduler, DiagnosticsSink, ServerOptions};
use vigil_types::Diagnostic;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub async fn send_msg<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &str) {
    let content = format!("Content-Length: {}\r\n\r\n{}", msg.len(), msg);
    writer.write_all(content.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

pub async fn recv_msg<R: AsyncReadExt + Unpin>(reader: &mut R) -> Option<String> {
    let mut buffer = Vec::new();
    let mut content_length = 0;

    loop {
        let byte = reader.read_u8().await.ok()?;
        buffer.push(byte);
        if buffer.ends_with(b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buffer);
            for line in headers.lines() {
                if line.to_lowercase().starts_with("content-length:") {
                    let parts: Vec<&str> = line.split(':').collect();
                    if parts.len() == 2 {
                        content_length = parts[1].trim().parse().unwrap_or_else(|e| {
                            panic!("Failed to parse Content-Length: {e}, header: {line}")
                        });
                    }
                }
            }
            break;
        }
    }

    if content_length == 0 {
        return None;
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.ok()?;

    Some(String::from_utf8(body).unwrap())
}

/// Records every publication, per URI, in order.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<HashMap<String, Vec<Vec<Diagnostic>>>>,
}

#[tower_lsp::async_trait]
impl DiagnosticsSink for RecordingSink {
    async fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
        self.published
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push(diagnostics);
    }
}

impl RecordingSink {
    /// The most recent publication for `uri`.
    pub fn latest(&self, uri: &str) -> Option<Vec<Diagnostic>> {
        self.published
            .lock()
            .get(uri)
            .and_then(|all| all.last().cloned())
    }

    /// Rule ids of the most recent publication for `uri`.
    pub fn latest_rules(&self, uri: &str) -> Option<Vec<String>> {
        self.latest(uri)
            .map(|diagnostics| diagnostics.into_iter().map(|d| d.rule_id).collect())
    }

    /// Number of publications for `uri`.
    pub fn count(&self, uri: &str) -> usize {
        self.published.lock().get(uri).map_or(0, |all| all.len())
    }
}

/// Polls `condition` until it holds, panicking after a bounded wait.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub fn write_file(root: &Path, relative: &str, contents: &str) -> String {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path_to_uri(&path).unwrap()
}

pub fn uri_of(root: &Path, relative: &str) -> String {
    path_to_uri(&root.join(relative)).unwrap()
}

pub fn start_scheduler(options: ServerOptions) -> (DiagnosticsScheduler, Arc<RecordingSink>) {
    start_scheduler_with(Engine::new(EngineOptions::default()).unwrap(), options)
}

pub fn start_scheduler_with(
    engine: Engine,
    options: ServerOptions,
) -> (DiagnosticsScheduler, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let scheduler = DiagnosticsScheduler::start(
        Arc::new(engine),
        Arc::new(RegoParser::new()),
        sink.clone(),
        options,
    );
    (scheduler, sink)
}
