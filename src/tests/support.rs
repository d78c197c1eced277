use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::provider::{
    Capability, DependencyDagMap, DependencyMap, EvaluateResponse, FileChange, Incident,
    InitConfig, InitResult, Provider, ProviderError,
};
use crate::rpc::RpcError;

/// Scripted in-process provider for engine tests: each capability maps to
/// a canned behavior, and every evaluate is counted.
pub struct ScriptedProvider {
    name: String,
    capabilities: Vec<Capability>,
    behaviors: HashMap<String, Behavior>,
    pub evaluate_calls: AtomicUsize,
    pub payloads: parking_lot::Mutex<Vec<(String, Value)>>,
    pub dependencies: DependencyMap,
}

#[derive(Clone)]
pub enum Behavior {
    Match(Vec<Incident>, Map<String, Value>),
    NoMatch,
    TransportError,
    /// Echoes the payload it was dispatched with inside templateContext,
    /// under the key "payload".
    EchoPayload,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            capabilities: Vec::new(),
            behaviors: HashMap::new(),
            evaluate_calls: AtomicUsize::new(0),
            payloads: parking_lot::Mutex::new(Vec::new()),
            dependencies: DependencyMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: &str, behavior: Behavior) -> Self {
        self.capabilities.push(Capability::new(capability));
        self.behaviors.insert(capability.to_owned(), behavior);
        self
    }

    pub fn with_dependencies(mut self, dependencies: DependencyMap) -> Self {
        if !self
            .capabilities
            .iter()
            .any(|capability| capability.name == crate::rule::DEPENDENCY_CAPABILITY)
        {
            self.capabilities
                .push(Capability::new(crate::rule::DEPENDENCY_CAPABILITY));
        }
        self.dependencies = dependencies;
        self
    }

    pub fn calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }
}

pub fn incident_at(uri: &str, line: u32) -> Incident {
    Incident {
        file_uri: uri.to_owned(),
        line_number: Some(line),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        _configs: Vec<InitConfig>,
    ) -> Result<InitResult, ProviderError> {
        Ok(InitResult::default())
    }

    async fn evaluate(
        &self,
        _cancel: &CancellationToken,
        capability: &str,
        payload: Value,
    ) -> Result<EvaluateResponse, ProviderError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .push((capability.to_owned(), payload.clone()));
        match self.behaviors.get(capability) {
            Some(Behavior::Match(incidents, template_context)) => Ok(EvaluateResponse {
                matched: true,
                incidents: incidents.clone(),
                template_context: template_context.clone(),
            }),
            Some(Behavior::NoMatch) => Ok(EvaluateResponse::default()),
            Some(Behavior::TransportError) => {
                Err(ProviderError::Rpc(RpcError::ConnectionClosed))
            }
            Some(Behavior::EchoPayload) => {
                let mut template_context = Map::new();
                template_context.insert("payload".to_owned(), payload);
                Ok(EvaluateResponse {
                    matched: true,
                    incidents: Vec::new(),
                    template_context,
                })
            }
            None => Err(ProviderError::UnknownCapability {
                provider: self.name.clone(),
                capability: capability.to_owned(),
            }),
        }
    }

    async fn get_dependencies(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<DependencyMap, ProviderError> {
        Ok(self.dependencies.clone())
    }

    async fn get_dependencies_dag(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<DependencyDagMap, ProviderError> {
        Ok(DependencyDagMap::new())
    }

    async fn notify_file_changes(
        &self,
        _cancel: &CancellationToken,
        _changes: Vec<FileChange>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn prepare(
        &self,
        _cancel: &CancellationToken,
        _conditions: Vec<Value>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// Convenience: a one-ruleset fixture around handwritten rules.
pub fn ruleset_of(rules: Vec<crate::rule::Rule>) -> crate::rule::RuleSet {
    crate::rule::RuleSet {
        name: "fixture".to_owned(),
        description: None,
        source: std::path::PathBuf::from("fixture.yaml"),
        labels: Vec::new(),
        tags: Vec::new(),
        rules,
    }
}

pub fn rule(id: &str, when: crate::rule::ConditionEntry) -> crate::rule::Rule {
    crate::rule::Rule {
        id: id.to_owned(),
        description: Some(format!("{id} description")),
        category: None,
        effort: None,
        labels: Vec::new(),
        message: None,
        tags: Vec::new(),
        links: Vec::new(),
        custom_variables: Vec::new(),
        when,
    }
}

pub fn engine_with<P: Provider + 'static>(providers: Vec<Arc<P>>) -> crate::Engine {
    let mut engine = crate::Engine::new(
        crate::EngineOptions::default(),
        crate::ProgressBus::default(),
    );
    for provider in providers {
        engine.register_provider(provider).unwrap();
    }
    engine
}
