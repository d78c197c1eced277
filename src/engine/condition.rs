use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::lsp::default_symbol_match;
use crate::provider::{CapabilityRegistry, Incident, Provider, ProviderError};
use crate::rule::{Condition, ConditionEntry, LabelSelector, DEPENDENCY_CAPABILITY};

use super::template::TemplateRenderer;

/// Result of evaluating one condition subtree.
#[derive(Clone, Debug, Default)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub incidents: Vec<Incident>,
    pub template_context: Map<String, Value>,
}

/// Walks a rule's condition tree, dispatching leaves to providers and
/// threading chain context. One evaluator is shared by all workers; it
/// holds no per-rule state.
pub struct Evaluator {
    providers: HashMap<String, Arc<dyn Provider>>,
    registry: Arc<CapabilityRegistry>,
    renderer: TemplateRenderer,
    dep_selector: Option<LabelSelector>,
}

impl Evaluator {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        registry: Arc<CapabilityRegistry>,
        dep_selector: Option<LabelSelector>,
    ) -> Self {
        Self {
            providers,
            registry,
            renderer: TemplateRenderer::default(),
            dep_selector,
        }
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Evaluate a rule's root entry. `scope` accumulates `as`-published
    /// context and is what the message template renders against afterwards.
    pub async fn evaluate_root(
        &self,
        cancel: &CancellationToken,
        entry: &ConditionEntry,
        scope: &mut Map<String, Value>,
    ) -> Result<ConditionOutcome, ProviderError> {
        let outcome = self.evaluate(cancel, entry, scope).await?;
        if outcome.matched {
            if let Some(alias) = &entry.alias {
                scope.insert(
                    alias.clone(),
                    Value::Object(outcome.template_context.clone()),
                );
            } else {
                merge_context(scope, &outcome.template_context);
            }
        }
        Ok(outcome)
    }

    fn evaluate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        entry: &'a ConditionEntry,
        scope: &'a mut Map<String, Value>,
    ) -> futures::future::BoxFuture<'a, Result<ConditionOutcome, ProviderError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let mut outcome = match &entry.condition {
                Condition::Call {
                    provider,
                    capability,
                    payload,
                } => {
                    self.evaluate_call(cancel, entry, provider, capability, payload, scope)
                        .await?
                }
                Condition::And(children) => self.evaluate_and(cancel, children, scope).await?,
                Condition::Or(children) => self.evaluate_or(cancel, children, scope).await?,
                Condition::Chain(children) => self.evaluate_chain(cancel, children, scope).await?,
                Condition::Not(child) => {
                    let inner = self.evaluate(cancel, child, scope).await?;
                    // inversion has no located evidence to carry
                    ConditionOutcome {
                        matched: !inner.matched,
                        incidents: Vec::new(),
                        template_context: Map::new(),
                    }
                }
            };
            if entry.negated {
                outcome = ConditionOutcome {
                    matched: !outcome.matched,
                    incidents: Vec::new(),
                    template_context: Map::new(),
                };
            }
            Ok(outcome)
        })
    }

    #[instrument(skip_all, fields(provider = provider, capability = capability))]
    async fn evaluate_call(
        &self,
        cancel: &CancellationToken,
        entry: &ConditionEntry,
        provider: &str,
        capability: &str,
        payload: &Value,
        scope: &Map<String, Value>,
    ) -> Result<ConditionOutcome, ProviderError> {
        // a `from` child gets its payload rendered against the chain scope
        let payload = if entry.from.is_some() {
            self.renderer.render_payload(payload, scope)
        } else {
            payload.clone()
        };

        if capability == DEPENDENCY_CAPABILITY {
            return self.evaluate_dependency(cancel, provider, &payload).await;
        }

        self.registry.validate_payload(provider, capability, &payload)?;
        let provider_impl =
            self.providers
                .get(provider)
                .ok_or_else(|| ProviderError::UnknownCapability {
                    provider: provider.to_owned(),
                    capability: capability.to_owned(),
                })?;
        let response = provider_impl.evaluate(cancel, capability, payload).await?;
        trace!(
            matched = response.matched,
            incidents = response.incidents.len(),
            "call evaluated"
        );
        Ok(ConditionOutcome {
            matched: response.matched,
            incidents: response.incidents,
            template_context: response.template_context,
        })
    }

    /// Short-circuits on the first unmatched child; later children are
    /// never invoked.
    async fn evaluate_and(
        &self,
        cancel: &CancellationToken,
        children: &[ConditionEntry],
        scope: &mut Map<String, Value>,
    ) -> Result<ConditionOutcome, ProviderError> {
        let mut combined = ConditionOutcome {
            matched: true,
            ..Default::default()
        };
        for child in children {
            let outcome = self.evaluate(cancel, child, scope).await?;
            if !outcome.matched {
                combined.matched = false;
                break;
            }
            publish_alias(scope, child, &outcome);
            combined.incidents.extend(outcome.incidents);
            merge_context(&mut combined.template_context, &outcome.template_context);
        }
        Ok(combined)
    }

    /// Short-circuits on the first matched child.
    async fn evaluate_or(
        &self,
        cancel: &CancellationToken,
        children: &[ConditionEntry],
        scope: &mut Map<String, Value>,
    ) -> Result<ConditionOutcome, ProviderError> {
        let mut combined = ConditionOutcome::default();
        for child in children {
            let outcome = self.evaluate(cancel, child, scope).await?;
            if outcome.matched {
                publish_alias(scope, child, &outcome);
                combined.matched = true;
                combined.incidents.extend(outcome.incidents);
                merge_context(&mut combined.template_context, &outcome.template_context);
                break;
            }
        }
        Ok(combined)
    }

    /// Children run in declaration order. A matched child publishes its
    /// context under its alias for later siblings; an erroring child kills
    /// the chain unless it is ignorable.
    async fn evaluate_chain(
        &self,
        cancel: &CancellationToken,
        children: &[ConditionEntry],
        scope: &mut Map<String, Value>,
    ) -> Result<ConditionOutcome, ProviderError> {
        let mut combined = ConditionOutcome {
            matched: true,
            ..Default::default()
        };
        for child in children {
            let outcome = match self.evaluate(cancel, child, scope).await {
                Ok(outcome) => outcome,
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(error) if child.ignorable => {
                    debug!(%error, "ignorable chain child failed");
                    continue;
                }
                Err(error) => return Err(error),
            };
            if !outcome.matched {
                if child.ignorable {
                    continue;
                }
                combined.matched = false;
                break;
            }
            publish_alias(scope, child, &outcome);
            combined.incidents.extend(outcome.incidents);
            merge_context(&mut combined.template_context, &outcome.template_context);
        }
        Ok(combined)
    }

    /// `dependency` leaves resolve against the provider's dependency
    /// subsystem rather than an `evaluate` call.
    async fn evaluate_dependency(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        payload: &Value,
    ) -> Result<ConditionOutcome, ProviderError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DependencyCondition {
            name: String,
            #[serde(default)]
            lowerbound: Option<String>,
            #[serde(default)]
            upperbound: Option<String>,
        }
        let condition: DependencyCondition = serde_json::from_value(payload.clone())
            .map_err(|error| ProviderError::Evaluation(format!("bad dependency payload: {error}")))?;
        let provider_impl =
            self.providers
                .get(provider)
                .ok_or_else(|| ProviderError::UnknownCapability {
                    provider: provider.to_owned(),
                    capability: DEPENDENCY_CAPABILITY.to_owned(),
                })?;

        let dependencies = provider_impl.get_dependencies(cancel).await?;
        let mut outcome = ConditionOutcome::default();
        for (file_uri, dependencies) in &dependencies {
            for dependency in dependencies {
                if let Some(selector) = &self.dep_selector {
                    if !dependency.labels.is_empty() && !selector.matches_raw(&dependency.labels) {
                        continue;
                    }
                }
                if !default_symbol_match(&dependency.name, &condition.name) {
                    continue;
                }
                let version = dependency.version.as_deref().unwrap_or_default();
                if let Some(lowerbound) = &condition.lowerbound {
                    if compare_versions(version, lowerbound).is_lt() {
                        continue;
                    }
                }
                if let Some(upperbound) = &condition.upperbound {
                    if compare_versions(version, upperbound).is_gt() {
                        continue;
                    }
                }

                let mut variables = Map::new();
                variables.insert("name".to_owned(), Value::String(dependency.name.clone()));
                if let Some(version) = &dependency.version {
                    variables.insert("version".to_owned(), Value::String(version.clone()));
                }
                if outcome.template_context.is_empty() {
                    outcome.template_context = variables.clone();
                }
                outcome.incidents.push(Incident {
                    file_uri: dependency
                        .file_uri_prefix
                        .clone()
                        .unwrap_or_else(|| file_uri.clone()),
                    variables,
                    ..Default::default()
                });
            }
        }
        outcome.matched = !outcome.incidents.is_empty();
        Ok(outcome)
    }
}

fn publish_alias(scope: &mut Map<String, Value>, child: &ConditionEntry, outcome: &ConditionOutcome) {
    if let Some(alias) = &child.alias {
        scope.insert(
            alias.clone(),
            Value::Object(outcome.template_context.clone()),
        );
    }
}

fn merge_context(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        into.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Segment-wise version comparison: numeric segments compare numerically,
/// the rest lexically. Range prefixes (`^`, `~`, `>=`, `v`) are stripped.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let segments = |version: &str| -> Vec<String> {
        version
            .trim_start_matches(['^', '~', '=', '>', '<', 'v', ' '])
            .split(|c: char| !c.is_alphanumeric())
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect()
    };
    let a_segments = segments(a);
    let b_segments = segments(b);
    for (left, right) in a_segments.iter().zip(b_segments.iter()) {
        let ordering = match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(left), Ok(right)) => left.cmp(&right),
            _ => left.cmp(right),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    a_segments.len().cmp(&b_segments.len())
}
