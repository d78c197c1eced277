use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::{Connection, RpcError};

use super::{
    BackoffTable, Capability, DependencyDagMap, DependencyMap, EvaluateResponse, FileChange,
    InitConfig, InitResult, Provider, ProviderError,
};

pub mod methods {
    pub const CAPABILITIES: &str = "capabilities";
    pub const INIT: &str = "init";
    pub const EVALUATE: &str = "evaluate";
    pub const DEPENDENCIES: &str = "dependencies";
    pub const DEPENDENCIES_DAG: &str = "dependenciesDAG";
    pub const NOTIFY_FILE_CHANGES: &str = "notifyFileChanges";
    pub const PREPARE: &str = "prepare";
    pub const SHUTDOWN: &str = "shutdown";

    /// Notification streamed by providers during `prepare`.
    pub const PREPARE_PROGRESS: &str = "prepare/progress";
}

/// A provider reached over the engine's RPC protocol. All calls funnel
/// through one retry wrapper in front of the connection; nothing else in the
/// engine retries.
pub struct RpcProvider {
    name: String,
    connection: Arc<Connection>,
    capabilities: Vec<Capability>,
    assume_works: bool,
    backoff: BackoffTable,
}

impl RpcProvider {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<Connection>,
        capabilities: Vec<Capability>,
        assume_works: bool,
        backoff: BackoffTable,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            capabilities,
            assume_works,
            backoff,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    async fn call(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let key = BackoffTable::key(method, params.as_ref());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                outcome = self.connection.request(method, params.clone()) => outcome,
            };
            match outcome {
                Ok(value) => {
                    self.backoff.record_success(&key);
                    return Ok(value);
                }
                Err(RpcError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(error) => {
                    let delay = self.backoff.record_failure(&key);
                    let retryable = is_retryable(&error) && self.connection.is_alive();
                    if !retryable || attempt >= self.backoff.policy().max_attempts {
                        return Err(ProviderError::Rpc(error));
                    }
                    warn!(
                        provider = %self.name,
                        method,
                        attempt,
                        ?delay,
                        %error,
                        "provider call failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn is_retryable(error: &RpcError) -> bool {
    matches!(
        error,
        RpcError::Timeout | RpcError::Io(_) | RpcError::Transport(_)
    )
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|error| ProviderError::MalformedResponse(error.to_string()))
}

#[async_trait]
impl Provider for RpcProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn has_capability(&self, name: &str) -> bool {
        if self.assume_works {
            return true;
        }
        self.capabilities
            .iter()
            .any(|capability| capability.name == name)
    }

    async fn init(
        &self,
        cancel: &CancellationToken,
        configs: Vec<InitConfig>,
    ) -> Result<InitResult, ProviderError> {
        let value = self
            .call(
                cancel,
                methods::INIT,
                Some(json!({ "configs": configs })),
            )
            .await?;
        if value.is_null() {
            return Ok(InitResult::default());
        }
        decode(value)
    }

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        capability: &str,
        payload: Value,
    ) -> Result<EvaluateResponse, ProviderError> {
        let value = self
            .call(
                cancel,
                methods::EVALUATE,
                Some(json!({ "capability": capability, "payload": payload })),
            )
            .await?;
        decode(value)
    }

    async fn get_dependencies(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DependencyMap, ProviderError> {
        let value = self.call(cancel, methods::DEPENDENCIES, None).await?;
        decode(value)
    }

    async fn get_dependencies_dag(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DependencyDagMap, ProviderError> {
        let value = self.call(cancel, methods::DEPENDENCIES_DAG, None).await?;
        decode(value)
    }

    async fn notify_file_changes(
        &self,
        cancel: &CancellationToken,
        changes: Vec<FileChange>,
    ) -> Result<(), ProviderError> {
        self.call(
            cancel,
            methods::NOTIFY_FILE_CHANGES,
            Some(json!({ "changes": changes })),
        )
        .await?;
        Ok(())
    }

    async fn prepare(
        &self,
        cancel: &CancellationToken,
        conditions: Vec<Value>,
    ) -> Result<(), ProviderError> {
        self.call(
            cancel,
            methods::PREPARE,
            Some(json!({ "conditions": conditions })),
        )
        .await?;
        Ok(())
    }

    async fn stop(&self) {
        if self.connection.is_alive() {
            if let Err(error) = self.connection.notify(methods::SHUTDOWN, None).await {
                debug!(provider = %self.name, %error, "shutdown notify failed");
            }
        }
        self.connection.close();
    }
}
