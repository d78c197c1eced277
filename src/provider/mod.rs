use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::rpc::RpcError;

mod builtin;
mod capability;
mod client;
mod retry;
mod server;
mod supervisor;

pub use builtin::{
    BuiltinProvider, TagStore, BUILTIN_PROVIDER_NAME, CAP_FILE, CAP_FILECONTENT, CAP_HAS_TAGS,
};
pub use capability::CapabilityRegistry;
pub use client::RpcProvider;
pub use retry::{BackoffPolicy, BackoffTable};
pub use server::ProviderServer;
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorOptionsBuilder, TransportKind};

/// A named query operation a provider exposes, with an optional JSON Schema
/// describing valid payloads.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: None,
        }
    }

    pub fn with_schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            input_schema: Some(schema),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeLocation {
    pub start_position: Position,
    pub end_position: Position,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A single located match produced by a capability call. `code_snip` is
/// attached later, during aggregation, when the file is readable.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    #[serde(rename = "fileURI")]
    pub file_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_location: Option<CodeLocation>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ExternalLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snip: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    #[serde(default)]
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incidents: Vec<Incident>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub template_context: serde_json::Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum AnalysisMode {
    #[serde(rename = "source-only")]
    SourceOnly,
    #[default]
    #[serde(rename = "full")]
    Full,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Per-provider initialization payload from the settings file. A provider
/// may answer with extra configs that the builtin provider then consumes
/// (discovered sub-project roots and the like).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_path: Option<String>,
    #[serde(default)]
    pub analysis_mode: AnalysisMode,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub provider_specific_config: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snip_size: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builtin_configs: Vec<InitConfig>,
}

/// A resolved package as reported by a provider's dependency subsystem.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_identifier: Option<String>,
    #[serde(default)]
    pub indirect: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_uri_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyNode {
    #[serde(flatten)]
    pub dependency: Dependency,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DependencyNode>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub saved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Streamed by providers while `prepare` warms their caches.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareProgress {
    pub provider_name: String,
    pub files_processed: u64,
    pub total_files: u64,
}

pub type DependencyMap = BTreeMap<String, Vec<Dependency>>;
pub type DependencyDagMap = BTreeMap<String, Vec<DependencyNode>>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("provider startup failed: {0}")]
    Startup(String),

    #[error("no capabilities advertised within {0:?}")]
    CapabilityDeadline(Duration),

    #[error("provider {provider:?} has no capability {capability:?}")]
    UnknownCapability {
        provider: String,
        capability: String,
    },

    #[error("payload rejected by {capability:?} input schema: {reason}")]
    InvalidPayload { capability: String, reason: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Rpc(_))
    }
}

/// The engine-facing contract every provider satisfies, whether it lives in
/// an external process behind the RPC protocol or in this process.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Stable for the provider's lifetime once startup has completed.
    fn capabilities(&self) -> Vec<Capability>;

    fn has_capability(&self, name: &str) -> bool {
        self.capabilities()
            .iter()
            .any(|capability| capability.name == name)
    }

    async fn init(
        &self,
        cancel: &CancellationToken,
        configs: Vec<InitConfig>,
    ) -> Result<InitResult, ProviderError>;

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        capability: &str,
        payload: Value,
    ) -> Result<EvaluateResponse, ProviderError>;

    async fn get_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DependencyMap, ProviderError>;

    async fn get_dependencies_dag(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DependencyDagMap, ProviderError>;

    /// Advisory; providers use it to invalidate symbol caches.
    async fn notify_file_changes(
        &self,
        cancel: &CancellationToken,
        changes: Vec<FileChange>,
    ) -> Result<(), ProviderError>;

    /// Ahead-of-time warm-up with the union of all parsed conditions.
    async fn prepare(
        &self,
        cancel: &CancellationToken,
        conditions: Vec<Value>,
    ) -> Result<(), ProviderError>;

    async fn stop(&self);
}
