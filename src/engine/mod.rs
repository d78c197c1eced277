use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use itertools::Itertools;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::EngineOptions;
use crate::output::{finalize, DependencyOutput, RuleSetOutput, Violation};
use crate::progress::{ProgressBus, ProgressEvent, Stage};
use crate::provider::{
    BuiltinProvider, CapabilityRegistry, Provider, ProviderError, TagStore, BUILTIN_PROVIDER_NAME,
    CAP_HAS_TAGS,
};
use crate::rule::{LabelSelector, Rule, RuleSet, SelectorError};

mod condition;
mod incident;
mod template;

pub use condition::{compare_versions, ConditionOutcome, Evaluator};
pub use incident::{dedup, IncidentPostProcessor};
pub use template::TemplateRenderer;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Settings(#[from] crate::config::SettingsError),

    #[error(transparent)]
    Rules(#[from] crate::rule::RuleParserError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("couldn't write artifact: {0}")]
    Artifact(#[from] std::io::Error),
}

enum RuleResult {
    Matched(Box<Violation>),
    Unmatched,
    Skipped,
    Errored(String),
}

struct RuleTask {
    ruleset_index: usize,
    rule: Rule,
}

/// The scheduler: owns the started providers, fans rules out to a bounded
/// worker pool, and aggregates per-ruleset output. Construction order is
/// `new` → `register_*` → `init_providers` → `run_rules` → `stop`.
pub struct Engine {
    providers: HashMap<String, Arc<dyn Provider>>,
    builtin: Option<Arc<BuiltinProvider>>,
    registry: Arc<CapabilityRegistry>,
    options: EngineOptions,
    progress: ProgressBus,
    tags: TagStore,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(options: EngineOptions, progress: ProgressBus) -> Self {
        Self {
            providers: HashMap::new(),
            builtin: None,
            registry: Arc::new(CapabilityRegistry::default()),
            options,
            progress,
            tags: TagStore::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tag_store(&self) -> TagStore {
        self.tags.clone()
    }

    /// Cancellation root for the whole evaluation; cancelling it makes
    /// every in-flight provider call return at its next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let registry = Arc::get_mut(&mut self.registry)
            .expect("providers are registered before evaluation begins");
        registry.register(provider.name(), provider.capabilities())?;
        self.providers.insert(provider.name().to_owned(), provider);
        Ok(())
    }

    /// Pre-established channels skip capability probing; every capability
    /// reads as supported and misuse surfaces at call time.
    pub fn register_provider_assume_works(&mut self, provider: Arc<dyn Provider>) {
        let registry = Arc::get_mut(&mut self.registry)
            .expect("providers are registered before evaluation begins");
        registry.register_assume_works(provider.name());
        self.providers.insert(provider.name().to_owned(), provider);
    }

    pub fn register_builtin(&mut self, builtin: Arc<BuiltinProvider>) -> Result<(), ProviderError> {
        self.builtin = Some(builtin.clone());
        self.register_provider(builtin)
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    /// Distribute init configs to every registered provider, feeding any
    /// returned extra configs to the builtin provider. Provider init
    /// strictly precedes any evaluate call.
    #[instrument(skip_all)]
    pub async fn init_providers(
        &self,
        configs: &[crate::config::ProviderConfig],
    ) -> Result<(), ProviderError> {
        let total = configs.len() as u64;
        let mut extra_builtin_configs = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            let Some(provider) = self.providers.get(&config.name) else {
                debug!(provider = %config.name, "no rules reference this provider");
                continue;
            };
            self.progress.emit(
                ProgressEvent::new(Stage::ProviderInit)
                    .with_message(config.name.clone())
                    .with_counts(index as u64 + 1, total),
            );
            let result = provider
                .init(&self.cancel, config.init_config.clone())
                .await?;
            extra_builtin_configs.extend(result.builtin_configs);
        }
        if let Some(builtin) = &self.builtin {
            builtin.absorb_configs(extra_builtin_configs);
        }
        Ok(())
    }

    /// Evaluate every rule of every ruleset. Selector-excluded rules land
    /// in `skipped`; non-dependency rules run before dependency rules; the
    /// final artifact is deterministically ordered.
    #[instrument(skip_all, fields(rulesets = rulesets.len()))]
    pub async fn run_rules(
        &self,
        rulesets: &[RuleSet],
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<RuleSetOutput>, EngineError> {
        let incident_selector = self
            .options
            .incident_selector
            .as_deref()
            .map(LabelSelector::parse)
            .transpose()?;
        let dep_selector = self
            .options
            .dep_label_selector
            .as_deref()
            .map(LabelSelector::parse)
            .transpose()?;

        let evaluator = Arc::new(Evaluator::new(
            self.providers.clone(),
            self.registry.clone(),
            dep_selector,
        ));

        let mut outputs: Vec<RuleSetOutput> = rulesets
            .iter()
            .map(|ruleset| RuleSetOutput {
                name: ruleset.name.clone(),
                description: ruleset.description.clone(),
                tags: ruleset.tags.clone(),
                ..Default::default()
            })
            .collect();

        // 1. selector pass and capability validation
        let mut immediate_tasks = Vec::new();
        let mut deferred_tasks = Vec::new();
        for (ruleset_index, ruleset) in rulesets.iter().enumerate() {
            for rule in &ruleset.rules {
                if let Some(selector) = selector {
                    let mut labels = rule.labels.clone();
                    labels.extend(ruleset.labels.iter().cloned());
                    if !selector.matches(&labels) {
                        outputs[ruleset_index].skipped.push(rule.id.clone());
                        continue;
                    }
                }
                if let Some(problem) = self.unknown_capability(rule) {
                    outputs[ruleset_index].errors.insert(rule.id.clone(), problem);
                    continue;
                }
                let task = RuleTask {
                    ruleset_index,
                    rule: rule.clone(),
                };
                if is_deferred(&task.rule) {
                    deferred_tasks.push(task);
                } else {
                    immediate_tasks.push(task);
                }
            }
        }

        // 2. warm every provider with the union of conditions
        self.prepare_providers(rulesets).await;

        // 3. evaluation, dependency-scoped rules strictly after the rest
        self.run_wave(
            Stage::RuleExecution,
            immediate_tasks,
            &evaluator,
            incident_selector.as_ref(),
            &mut outputs,
        )
        .await;
        self.run_wave(
            Stage::DependencyAnalysis,
            deferred_tasks,
            &evaluator,
            incident_selector.as_ref(),
            &mut outputs,
        )
        .await;

        self.progress.emit(ProgressEvent::new(Stage::Complete));
        Ok(finalize(outputs))
    }

    /// Gather every provider's resolved dependencies into the dependency
    /// artifact, applying the dependency label selector when configured.
    /// Provider failures are logged and skipped; dependency analysis never
    /// fails the run.
    #[instrument(skip_all)]
    pub async fn collect_dependencies(&self) -> Result<Vec<DependencyOutput>, EngineError> {
        self.progress
            .emit(ProgressEvent::new(Stage::DependencyAnalysis));
        let dep_selector = self
            .options
            .dep_label_selector
            .as_deref()
            .map(LabelSelector::parse)
            .transpose()?;

        let mut entries = Vec::new();
        for (name, provider) in self
            .providers
            .iter()
            .sorted_by_key(|(name, _)| name.as_str())
        {
            let file_dependencies = match provider.get_dependencies(&self.cancel).await {
                Ok(file_dependencies) => file_dependencies,
                Err(error) => {
                    warn!(provider = %name, %error, "dependency resolution failed");
                    continue;
                }
            };
            for (file_uri, mut dependencies) in file_dependencies {
                if let Some(selector) = &dep_selector {
                    dependencies.retain(|dependency| {
                        dependency.labels.is_empty() || selector.matches_raw(&dependency.labels)
                    });
                }
                if dependencies.is_empty() {
                    continue;
                }
                entries.push(DependencyOutput {
                    provider: name.clone(),
                    file_uri,
                    dependencies,
                });
            }
        }
        entries.sort_by(|a, b| (&a.provider, &a.file_uri).cmp(&(&b.provider, &b.file_uri)));
        Ok(entries)
    }

    /// Stop the engine: cancel the evaluation root and tear down every
    /// provider. Workers drain before this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for (_, provider) in self
            .providers
            .iter()
            .sorted_by_key(|(name, _)| name.as_str())
        {
            provider.stop().await;
        }
    }

    fn unknown_capability(&self, rule: &Rule) -> Option<String> {
        for (provider, capability) in rule.when.condition.referenced_calls() {
            if !self.registry.knows_provider(provider) {
                return Some(format!("rule references unknown provider {provider:?}"));
            }
            if !self.registry.has(provider, capability) {
                return Some(format!(
                    "rule references unknown capability {provider}.{capability}"
                ));
            }
        }
        None
    }

    async fn prepare_providers(&self, rulesets: &[RuleSet]) {
        let mut all_conditions = Vec::new();
        for ruleset in rulesets {
            for rule in &ruleset.rules {
                collect_conditions(&rule.when, &mut all_conditions);
            }
        }
        for (name, provider) in self
            .providers
            .iter()
            .sorted_by_key(|(name, _)| name.as_str())
        {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(error) = provider.prepare(&self.cancel, all_conditions.clone()).await {
                // warm-up is advisory; evaluation proceeds cold
                warn!(provider = %name, %error, "prepare failed");
            }
        }
    }

    async fn run_wave(
        &self,
        stage: Stage,
        tasks: Vec<RuleTask>,
        evaluator: &Arc<Evaluator>,
        incident_selector: Option<&LabelSelector>,
        outputs: &mut [RuleSetOutput],
    ) {
        if tasks.is_empty() {
            return;
        }
        let total = tasks.len() as u64;

        let mut completions = futures::stream::iter(tasks.into_iter().map(|task| {
            let evaluator = evaluator.clone();
            let cancel = self.cancel.clone();
            let options = &self.options;
            let selector = incident_selector;
            async move {
                let result =
                    evaluate_rule(&evaluator, &cancel, options, selector, &task.rule).await;
                (task, result)
            }
        }))
        .buffer_unordered(self.options.workers.max(1));

        let mut completed = 0u64;
        while let Some((task, result)) = completions.next().await {
            completed += 1;
            self.progress.emit(
                ProgressEvent::new(stage)
                    .with_message(task.rule.id.clone())
                    .with_counts(completed, total),
            );
            let output = &mut outputs[task.ruleset_index];
            match result {
                RuleResult::Matched(violation) => {
                    for tag in &task.rule.tags {
                        self.tags.insert(tag.clone());
                        output.tags.push(tag.clone());
                    }
                    output.violations.insert(task.rule.id.clone(), *violation);
                }
                RuleResult::Unmatched => output.unmatched.push(task.rule.id.clone()),
                RuleResult::Skipped => output.skipped.push(task.rule.id.clone()),
                RuleResult::Errored(message) => {
                    output.errors.insert(task.rule.id.clone(), message);
                }
            }
        }
    }
}

/// Dependency rules run after code-scan rules so providers are warm and
/// dependency output is at its most informative; tag queries defer for the
/// same reason.
fn is_deferred(rule: &Rule) -> bool {
    rule.is_dependency_scoped()
        || rule
            .when
            .condition
            .referenced_calls()
            .iter()
            .any(|(provider, capability)| {
                *provider == BUILTIN_PROVIDER_NAME && *capability == CAP_HAS_TAGS
            })
}

fn collect_conditions(entry: &crate::rule::ConditionEntry, out: &mut Vec<Value>) {
    match &entry.condition {
        crate::rule::Condition::Call {
            provider,
            capability,
            payload,
        } => out.push(serde_json::json!({
            "provider": provider,
            "capability": capability,
            "payload": payload,
        })),
        crate::rule::Condition::And(children)
        | crate::rule::Condition::Or(children)
        | crate::rule::Condition::Chain(children) => {
            for child in children {
                collect_conditions(child, out);
            }
        }
        crate::rule::Condition::Not(child) => collect_conditions(child, out),
    }
}

async fn evaluate_rule(
    evaluator: &Evaluator,
    cancel: &CancellationToken,
    options: &EngineOptions,
    incident_selector: Option<&LabelSelector>,
    rule: &Rule,
) -> RuleResult {
    if cancel.is_cancelled() {
        return RuleResult::Skipped;
    }
    let mut scope = Map::new();
    let outcome = match evaluator.evaluate_root(cancel, &rule.when, &mut scope).await {
        Ok(outcome) => outcome,
        Err(ProviderError::Cancelled) => return RuleResult::Skipped,
        Err(error) => return RuleResult::Errored(error.to_string()),
    };
    if !outcome.matched {
        return RuleResult::Unmatched;
    }

    let processor = IncidentPostProcessor::new(options, incident_selector);
    let produced = outcome.incidents.len();
    let incidents = processor.process(rule, outcome.incidents);
    incident::warn_on_oversized_result(&rule.id, incidents.len(), produced);

    let message = rule.message.as_deref().map(|template| {
        evaluator
            .renderer()
            .render(template, &scope)
            .unwrap_or_else(|error| {
                // template failures degrade to the raw message, never drop
                // the violation
                warn!(rule = %rule.id, %error, "message template failed");
                template.to_owned()
            })
    });

    RuleResult::Matched(Box::new(Violation {
        description: rule.description.clone(),
        category: rule.category,
        labels: rule.labels.iter().map(|label| label.to_string()).collect(),
        effort: rule.effort,
        message,
        incidents,
        links: rule.links.clone(),
    }))
}
