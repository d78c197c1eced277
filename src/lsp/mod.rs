use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::{
    Diagnostic, DidCloseTextDocumentParams, DidOpenTextDocumentParams, DocumentSymbol,
    DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams, GotoDefinitionResponse,
    InitializeResult, Location, Position, PublishDiagnosticsParams, ServerCapabilities,
    SymbolInformation, TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams, Url,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::provider::{
    Capability, CodeLocation, DependencyDagMap, DependencyMap, DependencyNode, EvaluateResponse,
    FileChange, Incident, InitConfig, InitResult, PrepareProgress, Provider, ProviderError,
};
use crate::rpc::{Connection, ConnectionHandlers, RpcError, StdioTransport, Transport};

mod await_cache;
mod overlay;
mod population;
mod symbol_cache;

pub use await_cache::AwaitCache;
pub use overlay::{
    default_symbol_match, DefaultOverlay, LanguageOverlay, NodeOverlay, ReferencedCondition,
    YamlOverlay, DEFAULT_EXCLUDED_DIRS,
};
pub use population::PopulationPipeline;
pub use symbol_cache::{
    range_contains, range_length_key, smallest_enclosing, DefinitionSymbol, SymbolCache,
    WorkspaceSymbol, WorkspaceSymbolDefinitionsPair,
};

pub const CAP_REFERENCED: &str = "referenced";

const QUERY_RETRY_ATTEMPTS: usize = 2;
const QUERY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The service-client base every LSP-backed provider is built on: it owns
/// the transport and handshake, tracks opened documents, serves symbol and
/// definition queries with retry-on-empty, and carries the symbol cache the
/// population pipeline writes into.
pub struct LspServiceClient {
    pub(crate) name: String,
    language_id: String,
    connection: Arc<Connection>,
    pub(crate) cache: SymbolCache,
    pub(crate) overlay: Arc<dyn LanguageOverlay>,
    opened: Mutex<HashSet<Url>>,
    pub(crate) diagnostics: Arc<AwaitCache<Url, Vec<Diagnostic>>>,
    server_capabilities: OnceCell<ServerCapabilities>,
    pub(crate) conditions: RwLock<Vec<ReferencedCondition>>,
    pub(crate) cancel: CancellationToken,
}

impl LspServiceClient {
    pub fn new(
        name: impl Into<String>,
        language_id: impl Into<String>,
        transport: Transport,
        overlay: Arc<dyn LanguageOverlay>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let diagnostics: Arc<AwaitCache<Url, Vec<Diagnostic>>> = Default::default();
        let handler_diagnostics = diagnostics.clone();
        let handlers = ConnectionHandlers {
            on_notification: Some(Box::new(move |method, params| {
                if method == "textDocument/publishDiagnostics" {
                    if let Some(params) = params {
                        match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                            Ok(published) => {
                                handler_diagnostics.remove(&published.uri);
                                handler_diagnostics
                                    .set(published.uri.clone(), published.diagnostics);
                            }
                            Err(error) => debug!(%error, "undecodable diagnostics"),
                        }
                    }
                }
            })),
            on_request: None,
        };
        Arc::new(Self {
            name: name.into(),
            language_id: language_id.into(),
            connection: Connection::new(transport, handlers),
            cache: SymbolCache::default(),
            overlay,
            opened: Mutex::new(HashSet::new()),
            diagnostics,
            server_capabilities: OnceCell::new(),
            conditions: RwLock::new(Vec::new()),
            cancel,
        })
    }

    /// `initialize`/`initialized` handshake; must precede every other call.
    #[instrument(skip_all, fields(provider = %self.name))]
    pub async fn initialize(&self, root: &Path) -> Result<(), ProviderError> {
        let root_uri = Url::from_file_path(root).map_err(|()| {
            ProviderError::Startup(format!("root is not an absolute path: {}", root.display()))
        })?;
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {
                "textDocument": {
                    "documentSymbol": {"hierarchicalDocumentSymbolSupport": true},
                    "definition": {"linkSupport": true},
                    "publishDiagnostics": {},
                },
                "workspace": {"symbol": {}},
            },
            "clientInfo": {"name": "lsp-lint", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self.connection.request("initialize", Some(params)).await?;
        let initialized: InitializeResult = serde_json::from_value(result)
            .map_err(|error| ProviderError::MalformedResponse(error.to_string()))?;
        let _ = self.server_capabilities.set(initialized.capabilities);
        self.connection
            .notify("initialized", Some(json!({})))
            .await?;
        Ok(())
    }

    pub fn supports_workspace_symbol(&self) -> bool {
        use lsp_types::OneOf;
        matches!(
            self.server_capabilities
                .get()
                .and_then(|capabilities| capabilities.workspace_symbol_provider.as_ref()),
            Some(OneOf::Left(true)) | Some(OneOf::Right(_))
        )
    }

    /// Open each URI at most once per provider lifetime.
    pub async fn ensure_open(&self, uri: &Url) -> Result<(), ProviderError> {
        let mut opened = self.opened.lock().await;
        if opened.contains(uri) {
            return Ok(());
        }
        let Ok(path) = uri.to_file_path() else {
            return Ok(());
        };
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| ProviderError::Evaluation(format!("unreadable {uri}: {error}")))?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: self.language_id.clone(),
                version: 0,
                text,
            },
        };
        self.connection
            .notify(
                "textDocument/didOpen",
                Some(serde_json::to_value(params).map_err(RpcError::Json)?),
            )
            .await?;
        opened.insert(uri.clone());
        Ok(())
    }

    pub async fn close_file(&self, uri: &Url) -> Result<(), ProviderError> {
        let mut opened = self.opened.lock().await;
        if !opened.remove(uri) {
            return Ok(());
        }
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        };
        self.connection
            .notify(
                "textDocument/didClose",
                Some(serde_json::to_value(params).map_err(RpcError::Json)?),
            )
            .await?;
        Ok(())
    }

    /// `textDocument/documentSymbol`, with retry-on-empty: some servers
    /// answer empty while still indexing the file.
    pub async fn query_document_symbol(
        &self,
        uri: &Url,
    ) -> Result<Vec<DocumentSymbol>, ProviderError> {
        self.ensure_open(uri).await?;
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        let params = serde_json::to_value(params).map_err(RpcError::Json)?;

        let mut symbols = Vec::new();
        for attempt in 0..QUERY_RETRY_ATTEMPTS {
            let result = self
                .connection
                .request("textDocument/documentSymbol", Some(params.clone()))
                .await?;
            symbols = decode_document_symbols(result)?;
            if !symbols.is_empty() {
                break;
            }
            if attempt + 1 < QUERY_RETRY_ATTEMPTS {
                tokio::time::sleep(QUERY_RETRY_DELAY).await;
            }
        }
        self.cache.set_document_symbols(uri.clone(), symbols.clone());
        Ok(symbols)
    }

    /// `textDocument/definition`, normalized over the three response shapes.
    pub async fn definitions(
        &self,
        uri: &Url,
        position: Position,
    ) -> Result<Vec<Location>, ProviderError> {
        self.ensure_open(uri).await?;
        let params = GotoDefinitionParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        let params = serde_json::to_value(params).map_err(RpcError::Json)?;

        let mut locations = Vec::new();
        for attempt in 0..QUERY_RETRY_ATTEMPTS {
            let result = self
                .connection
                .request("textDocument/definition", Some(params.clone()))
                .await?;
            locations = decode_definitions(result)?;
            if !locations.is_empty() {
                break;
            }
            if attempt + 1 < QUERY_RETRY_ATTEMPTS {
                tokio::time::sleep(QUERY_RETRY_DELAY).await;
            }
        }
        Ok(locations)
    }

    pub async fn workspace_symbols(
        &self,
        query: &str,
    ) -> Result<Vec<SymbolInformation>, ProviderError> {
        let result = self
            .connection
            .request("workspace/symbol", Some(json!({ "query": query })))
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        match serde_json::from_value::<lsp_types::WorkspaceSymbolResponse>(result) {
            Ok(lsp_types::WorkspaceSymbolResponse::Flat(symbols)) => Ok(symbols),
            Ok(lsp_types::WorkspaceSymbolResponse::Nested(_)) => Ok(Vec::new()),
            Err(error) => Err(ProviderError::MalformedResponse(error.to_string())),
        }
    }

    /// Diagnostics for a URI, delivered by the server whenever it pleases.
    pub async fn await_diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        self.diagnostics.wait(uri).await
    }

    pub async fn shutdown(&self) {
        if self.connection.is_alive() {
            let _ = self
                .connection
                .request_with_timeout("shutdown", None, Duration::from_secs(2))
                .await;
            let _ = self.connection.notify("exit", None).await;
        }
        self.connection.close();
    }
}

fn decode_document_symbols(result: Value) -> Result<Vec<DocumentSymbol>, ProviderError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let response: DocumentSymbolResponse = serde_json::from_value(result)
        .map_err(|error| ProviderError::MalformedResponse(error.to_string()))?;
    Ok(match response {
        DocumentSymbolResponse::Nested(symbols) => symbols,
        DocumentSymbolResponse::Flat(flat) => flat.into_iter().map(flat_to_nested).collect(),
    })
}

fn flat_to_nested(info: SymbolInformation) -> DocumentSymbol {
    #[allow(deprecated)]
    DocumentSymbol {
        name: info.name,
        detail: None,
        kind: info.kind,
        tags: info.tags,
        deprecated: None,
        range: info.location.range,
        selection_range: info.location.range,
        children: None,
    }
}

fn decode_definitions(result: Value) -> Result<Vec<Location>, ProviderError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let response: GotoDefinitionResponse = serde_json::from_value(result)
        .map_err(|error| ProviderError::MalformedResponse(error.to_string()))?;
    Ok(match response {
        GotoDefinitionResponse::Scalar(location) => vec![location],
        GotoDefinitionResponse::Array(locations) => locations,
        GotoDefinitionResponse::Link(links) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
    })
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LspServerConfig {
    lsp_server_path: PathBuf,
    #[serde(default)]
    lsp_server_args: Vec<String>,
}

struct StartedState {
    client: Arc<LspServiceClient>,
    pipeline: PopulationPipeline,
    child: Option<Child>,
    root: PathBuf,
}

type ProgressCallback = Arc<dyn Fn(PrepareProgress) + Send + Sync>;

/// An in-process provider wrapping one language server. `init` spawns the
/// server named in the provider-specific config and performs the handshake;
/// `prepare` feeds the population pipeline; `referenced` queries are
/// answered from the symbol cache (or `workspace/symbol` when the server
/// offers it).
pub struct LspProvider {
    name: String,
    language_id: String,
    overlay: Arc<dyn LanguageOverlay>,
    state: tokio::sync::RwLock<Option<StartedState>>,
    cancel: CancellationToken,
    progress: RwLock<Option<ProgressCallback>>,
}

impl LspProvider {
    pub fn new(
        name: impl Into<String>,
        language_id: impl Into<String>,
        overlay: Arc<dyn LanguageOverlay>,
    ) -> Self {
        Self {
            name: name.into(),
            language_id: language_id.into(),
            overlay,
            state: tokio::sync::RwLock::new(None),
            cancel: CancellationToken::new(),
            progress: RwLock::new(None),
        }
    }

    pub fn on_prepare_progress(&self, callback: ProgressCallback) {
        *self.progress.write() = Some(callback);
    }

    fn incident_from_symbol(&self, symbol: &WorkspaceSymbol) -> Incident {
        let mut variables = Map::new();
        variables.insert("name".to_owned(), Value::String(symbol.name.clone()));
        Incident {
            file_uri: symbol.uri.to_string(),
            line_number: Some(symbol.range.start.line + 1),
            code_location: Some(CodeLocation {
                start_position: crate::provider::Position {
                    line: symbol.range.start.line,
                    character: symbol.range.start.character,
                },
                end_position: crate::provider::Position {
                    line: symbol.range.end.line,
                    character: symbol.range.end.character,
                },
            }),
            variables,
            ..Default::default()
        }
    }

    async fn evaluate_referenced(
        &self,
        cancel: &CancellationToken,
        condition: ReferencedCondition,
    ) -> Result<EvaluateResponse, ProviderError> {
        let state = self.state.read().await;
        let state = state
            .as_ref()
            .ok_or_else(|| ProviderError::Evaluation("provider not initialized".to_owned()))?;

        let mut incidents: Vec<Incident> = Vec::new();

        // direct workspace/symbol is only allowed for unscoped queries; a
        // filepath-scoped query must honor the file filters, which only the
        // cache path applies
        if condition.filepaths.is_none() && state.client.supports_workspace_symbol() {
            let symbols = state.client.workspace_symbols(&condition.pattern).await?;
            let matched: Vec<&SymbolInformation> = symbols
                .iter()
                .filter(|info| {
                    self.overlay
                        .match_symbol_by_patterns(&info.name, &[condition.pattern.clone()])
                })
                .collect();
            if !matched.is_empty() {
                for info in matched {
                    incidents.push(self.incident_from_symbol(&WorkspaceSymbol {
                        name: info.name.clone(),
                        uri: info.location.uri.clone(),
                        range: info.location.range,
                    }));
                }
                return Ok(referenced_response(incidents, &condition.pattern));
            }
        }

        // fall back to the populated cache
        state.pipeline.drained().await;
        for uri in state.client.cache.workspace_symbol_uris() {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let Some(pairs) = state.client.cache.workspace_symbols(&uri) else {
                continue;
            };
            for pair in pairs {
                if self
                    .overlay
                    .match_symbol_by_patterns(&pair.symbol.name, &[condition.pattern.clone()])
                {
                    incidents.push(self.incident_from_symbol(&pair.symbol));
                }
            }
        }
        incidents.sort_by(|a, b| (&a.file_uri, a.line_number).cmp(&(&b.file_uri, b.line_number)));
        Ok(referenced_response(incidents, &condition.pattern))
    }
}

fn referenced_response(incidents: Vec<Incident>, pattern: &str) -> EvaluateResponse {
    let mut template_context = Map::new();
    template_context.insert("name".to_owned(), Value::String(pattern.to_owned()));
    EvaluateResponse {
        matched: !incidents.is_empty(),
        incidents,
        template_context,
    }
}

#[async_trait]
impl Provider for LspProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::with_schema(
                CAP_REFERENCED,
                json!({
                    "type": "object",
                    "required": ["pattern"],
                    "properties": {
                        "pattern": {"type": "string"},
                        "namespace": {"type": "string"},
                        "location": {"type": "string"},
                        "filepaths": {"type": "array", "items": {"type": "string"}},
                    },
                }),
            ),
            Capability::new(crate::rule::DEPENDENCY_CAPABILITY),
        ]
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    async fn init(
        &self,
        _cancel: &CancellationToken,
        configs: Vec<InitConfig>,
    ) -> Result<InitResult, ProviderError> {
        let config = configs
            .first()
            .ok_or_else(|| ProviderError::Startup("no init config".to_owned()))?;
        let root = PathBuf::from(&config.location);
        let server: LspServerConfig = serde_json::from_value(Value::Object(
            config.provider_specific_config.clone(),
        ))
        .map_err(|error| {
            ProviderError::Startup(format!("providerSpecificConfig is incomplete: {error}"))
        })?;

        let mut command = tokio::process::Command::new(&server.lsp_server_path);
        command
            .args(&server.lsp_server_args)
            .current_dir(&root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|error| {
            ProviderError::Startup(format!(
                "failed to spawn {:?}: {error}",
                server.lsp_server_path
            ))
        })?;
        let transport = StdioTransport::from_child(&mut child, crate::rpc::DEFAULT_MAX_MESSAGE_SIZE)
            .map_err(|error| ProviderError::Startup(error.to_string()))?;

        let client = LspServiceClient::new(
            self.name.clone(),
            self.language_id.clone(),
            transport,
            self.overlay.clone(),
            self.cancel.child_token(),
        );
        client.initialize(&root).await?;
        let pipeline = PopulationPipeline::start(client.clone());

        *self.state.write().await = Some(StartedState {
            client,
            pipeline,
            child: Some(child),
            root,
        });
        Ok(InitResult::default())
    }

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        capability: &str,
        payload: Value,
    ) -> Result<EvaluateResponse, ProviderError> {
        match capability {
            CAP_REFERENCED => {
                let condition: ReferencedCondition = serde_json::from_value(payload)
                    .map_err(|error| ProviderError::Evaluation(format!("bad payload: {error}")))?;
                self.evaluate_referenced(cancel, condition).await
            }
            other => Err(ProviderError::UnknownCapability {
                provider: self.name.clone(),
                capability: other.to_owned(),
            }),
        }
    }

    async fn get_dependencies(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<DependencyMap, ProviderError> {
        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            return Ok(DependencyMap::new());
        };
        Ok(self.overlay.resolve_dependencies(&state.root))
    }

    async fn get_dependencies_dag(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DependencyDagMap, ProviderError> {
        // flat resolution only; the DAG view degenerates to leaf nodes
        let flat = self.get_dependencies(cancel).await?;
        Ok(flat
            .into_iter()
            .map(|(uri, dependencies)| {
                (
                    uri,
                    dependencies
                        .into_iter()
                        .map(|dependency| DependencyNode {
                            dependency,
                            children: Vec::new(),
                        })
                        .collect(),
                )
            })
            .collect())
    }

    async fn notify_file_changes(
        &self,
        _cancel: &CancellationToken,
        changes: Vec<FileChange>,
    ) -> Result<(), ProviderError> {
        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            return Ok(());
        };
        for change in changes {
            let Ok(uri) = Url::from_file_path(&change.path) else {
                warn!(path = %change.path, "unusable change path");
                continue;
            };
            state.client.close_file(&uri).await?;
            state.client.cache.invalidate(&uri);
            state.client.diagnostics.remove(&uri);
            state.pipeline.enqueue(uri).await;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    async fn prepare(
        &self,
        cancel: &CancellationToken,
        conditions: Vec<Value>,
    ) -> Result<(), ProviderError> {
        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            return Ok(());
        };
        let referenced = ReferencedCondition::from_prepare_conditions(&conditions, &self.name);
        *state.client.conditions.write() = referenced.clone();

        let uris = self
            .overlay
            .get_document_uris(&state.root, &referenced)
            .map_err(|error| ProviderError::Evaluation(error.to_string()))?;
        let total_files = uris.len() as u64;
        for (index, uri) in uris.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            state.pipeline.enqueue(uri).await;
            if let Some(callback) = self.progress.read().as_ref() {
                callback(PrepareProgress {
                    provider_name: self.name.clone(),
                    files_processed: index as u64 + 1,
                    total_files,
                });
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let mut state = self.state.write().await;
        if let Some(mut state) = state.take() {
            state.client.shutdown().await;
            if let Some(mut child) = state.child.take() {
                if let Err(error) = child.kill().await {
                    debug!(provider = %self.name, %error, "kill failed");
                }
            }
        }
    }
}
