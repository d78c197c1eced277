use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lsp_types::Url;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, warn};

use crate::provider::ProviderError;

use super::symbol_cache::{smallest_enclosing, DefinitionSymbol, WorkspaceSymbolDefinitionsPair};
use super::LspServiceClient;

pub const POPULATION_QUEUE_CAPACITY: usize = 10;

#[derive(Default)]
struct PendingCounter {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingCounter {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The background symbol-population pipeline: a bounded queue of file URIs
/// drained by a single worker that pre-scans content, chases definitions,
/// and fills the workspace-symbol projection of the cache.
pub struct PopulationPipeline {
    queue: mpsc::Sender<Url>,
    pending: Arc<PendingCounter>,
}

impl PopulationPipeline {
    pub fn start(client: Arc<LspServiceClient>) -> Self {
        let (queue, mut receiver) = mpsc::channel::<Url>(POPULATION_QUEUE_CAPACITY);
        let pending: Arc<PendingCounter> = Default::default();

        let worker_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                let uri = tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    uri = receiver.recv() => match uri {
                        Some(uri) => uri,
                        None => break,
                    },
                };
                if let Err(error) = populate_file(&client, &uri).await {
                    match error {
                        ProviderError::Cancelled => {
                            worker_pending.done();
                            break;
                        }
                        error => warn!(%uri, %error, "symbol population failed"),
                    }
                }
                worker_pending.done();
            }
            // cancellation drains queued URIs without touching the cache
            while receiver.try_recv().is_ok() {
                worker_pending.done();
            }
        });

        Self { queue, pending }
    }

    /// Queue a file for population. The bounded channel applies
    /// backpressure to bulk producers such as `prepare`.
    pub async fn enqueue(&self, uri: Url) {
        self.pending.add();
        if self.queue.send(uri).await.is_err() {
            self.pending.done();
        }
    }

    /// Wait until every queued file has been processed or dropped.
    pub async fn drained(&self) {
        self.pending.wait_drained().await;
    }
}

/// Populate one file: pre-scan its content against the currently known
/// conditions, follow each match to its definitions, and store the
/// deduplicated pairs. Files that vanished are dropped silently.
#[instrument(skip(client), fields(provider = %client.name))]
async fn populate_file(client: &Arc<LspServiceClient>, uri: &Url) -> Result<(), ProviderError> {
    let Ok(path) = uri.to_file_path() else {
        return Ok(());
    };
    if !path.exists() {
        debug!("file vanished before population");
        return Ok(());
    }
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(_) => return Ok(()),
    };

    let conditions = client.conditions.read().clone();
    let ranges = client
        .overlay
        .match_file_content_by_conditions(&content, &conditions);

    let mut pairs: Vec<WorkspaceSymbolDefinitionsPair> = Vec::new();
    let mut seen: HashSet<(u32, u32)> = HashSet::new();
    for range in ranges {
        if client.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        // dedup by (URI, startLine, startChar); the URI is fixed here
        if !seen.insert((range.start.line, range.start.character)) {
            continue;
        }
        let name = matched_text(&content, &range);

        let mut definitions: Vec<DefinitionSymbol> = Vec::new();
        let locations = client
            .definitions(uri, range.start)
            .await
            .unwrap_or_default();
        for location in locations {
            if client.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let symbols = client
                .query_document_symbol(&location.uri)
                .await
                .unwrap_or_default();
            if let Some(symbol) = smallest_enclosing(&symbols, location.range.start) {
                definitions.push(DefinitionSymbol {
                    uri: location.uri.clone(),
                    symbol,
                });
            }
        }

        pairs.push(WorkspaceSymbolDefinitionsPair {
            symbol: super::symbol_cache::WorkspaceSymbol {
                name,
                uri: uri.clone(),
                range,
            },
            definitions,
        });
    }

    client.cache.set_workspace_symbols(uri.clone(), pairs);
    Ok(())
}

fn matched_text(content: &str, range: &lsp_types::Range) -> String {
    content
        .lines()
        .nth(range.start.line as usize)
        .map(|line| {
            line.chars()
                .skip(range.start.character as usize)
                .take((range.end.character - range.start.character) as usize)
                .collect()
        })
        .unwrap_or_default()
}
