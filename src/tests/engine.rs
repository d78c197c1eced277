use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::provider::{
    Capability, DependencyDagMap, DependencyMap, Dependency, EvaluateResponse, FileChange,
    InitConfig, InitResult, Provider, ProviderError,
};
use crate::rule::{Condition, ConditionEntry, Label, LabelSelector};
use crate::{Engine, EngineOptions, ProgressBus};

use super::support::{engine_with, incident_at, rule, ruleset_of, Behavior, ScriptedProvider};

fn leaf(provider: &str, capability: &str, payload: Value) -> ConditionEntry {
    ConditionEntry::leaf(provider, capability, payload)
}

#[tokio::test]
async fn label_selected_out_rules_are_skipped_not_evaluated() {
    let provider = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(vec![incident_at("file:///work/a.ts", 3)], Map::new()),
    ));
    let engine = engine_with(vec![provider.clone()]);

    let mut selected = rule("rule-a", leaf("nodejs", "referenced", json!({"pattern": "x"})));
    selected.labels = vec![Label::parse("konveyor.io/source=nodejs")];
    let mut excluded = rule("rule-b", leaf("nodejs", "referenced", json!({"pattern": "y"})));
    excluded.labels = vec![Label::parse("konveyor.io/source=java")];

    let selector = LabelSelector::parse("konveyor.io/source=nodejs").unwrap();
    let outputs = engine
        .run_rules(&[ruleset_of(vec![selected, excluded])], Some(&selector))
        .await
        .unwrap();

    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].violations.contains_key("rule-a"));
    assert!(!outputs[0].violations.contains_key("rule-b"));
    assert_eq!(outputs[0].skipped, vec!["rule-b"]);
    // the excluded rule never reached the provider
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn chain_substitutes_published_context_into_downstream_payloads() {
    let mut published = Map::new();
    published.insert("name".to_owned(), Value::String("pg".to_owned()));
    let provider = Arc::new(
        ScriptedProvider::new("nodejs")
            .with_capability("referenced", Behavior::Match(Vec::new(), published))
            .with_capability("filecontent", Behavior::EchoPayload),
    );
    let engine = engine_with(vec![provider.clone()]);

    let mut first = leaf("nodejs", "referenced", json!({"pattern": "Pool"}));
    first.alias = Some("pkg".to_owned());
    let mut second = leaf("nodejs", "filecontent", json!({"pattern": "{{pkg.name}}"}));
    second.from = Some("pkg".to_owned());

    let chained = rule(
        "chain-rule",
        ConditionEntry {
            condition: Condition::Chain(vec![first, second]),
            alias: None,
            from: None,
            ignorable: false,
            negated: false,
        },
    );
    let outputs = engine
        .run_rules(&[ruleset_of(vec![chained])], None)
        .await
        .unwrap();

    assert!(outputs[0].violations.contains_key("chain-rule"));
    let payloads = provider.payloads.lock();
    assert_eq!(payloads.len(), 2);
    // the second leaf's payload was dispatched with the first's output
    // substituted in
    assert_eq!(payloads[1].1, json!({"pattern": "pg"}));
}

#[tokio::test]
async fn and_short_circuits_before_the_erroring_child() {
    let provider = Arc::new(
        ScriptedProvider::new("nodejs")
            .with_capability("referenced", Behavior::NoMatch)
            .with_capability("filecontent", Behavior::TransportError),
    );
    let engine = engine_with(vec![provider.clone()]);

    let both = rule(
        "and-rule",
        ConditionEntry {
            condition: Condition::And(vec![
                leaf("nodejs", "referenced", json!({"pattern": "A"})),
                leaf("nodejs", "filecontent", json!({"pattern": "B"})),
            ]),
            alias: None,
            from: None,
            ignorable: false,
            negated: false,
        },
    );
    let outputs = engine
        .run_rules(&[ruleset_of(vec![both])], None)
        .await
        .unwrap();

    assert_eq!(outputs[0].unmatched, vec!["and-rule"]);
    assert!(outputs[0].errors.is_empty());
    // B was never invoked
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn or_short_circuits_after_the_first_match() {
    let provider = Arc::new(
        ScriptedProvider::new("nodejs")
            .with_capability(
                "referenced",
                Behavior::Match(vec![incident_at("file:///a.ts", 1)], Map::new()),
            )
            .with_capability("filecontent", Behavior::TransportError),
    );
    let engine = engine_with(vec![provider.clone()]);

    let either = rule(
        "or-rule",
        ConditionEntry {
            condition: Condition::Or(vec![
                leaf("nodejs", "referenced", json!({"pattern": "A"})),
                leaf("nodejs", "filecontent", json!({"pattern": "B"})),
            ]),
            alias: None,
            from: None,
            ignorable: false,
            negated: false,
        },
    );
    let outputs = engine.run_rules(&[ruleset_of(vec![either])], None).await.unwrap();

    assert!(outputs[0].violations.contains_key("or-rule"));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn incident_limit_caps_in_ascending_position_order() {
    let incidents: Vec<_> = (1..=7)
        .rev()
        .map(|line| incident_at("file:///work/a.ts", line))
        .collect();
    let provider = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(incidents, Map::new()),
    ));

    let run_with_limit = |limit: usize| {
        let provider = provider.clone();
        async move {
            let mut engine = Engine::new(
                EngineOptions {
                    incident_limit: Some(limit),
                    ..Default::default()
                },
                ProgressBus::default(),
            );
            engine.register_provider(provider).unwrap();
            let matched = rule(
                "cap-rule",
                leaf("nodejs", "referenced", json!({"pattern": "x"})),
            );
            engine
                .run_rules(&[ruleset_of(vec![matched])], None)
                .await
                .unwrap()
        }
    };

    let capped = run_with_limit(3).await;
    let lines: Vec<u32> = capped[0].violations["cap-rule"]
        .incidents
        .iter()
        .map(|incident| incident.line_number.unwrap())
        .collect();
    assert_eq!(lines, vec![1, 2, 3]);

    let generous = run_with_limit(100).await;
    assert_eq!(generous[0].violations["cap-rule"].incidents.len(), 7);
}

#[tokio::test]
async fn transport_errors_land_in_the_errors_map_and_other_rulesets_succeed() {
    let flaky = Arc::new(
        ScriptedProvider::new("java").with_capability("referenced", Behavior::TransportError),
    );
    let healthy = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(vec![incident_at("file:///a.ts", 1)], Map::new()),
    ));
    let engine = engine_with(vec![flaky, healthy]);

    let mut broken_set = ruleset_of(vec![rule(
        "java-rule",
        leaf("java", "referenced", json!({"pattern": "x"})),
    )]);
    broken_set.name = "broken".to_owned();
    let mut healthy_set = ruleset_of(vec![rule(
        "node-rule",
        leaf("nodejs", "referenced", json!({"pattern": "x"})),
    )]);
    healthy_set.name = "healthy".to_owned();

    let outputs = engine
        .run_rules(&[broken_set, healthy_set], None)
        .await
        .unwrap();

    // deterministic order: "broken" sorts before "healthy"
    assert_eq!(outputs[0].name, "broken");
    let error = &outputs[0].errors["java-rule"];
    assert!(error.contains("transport"), "got: {error}");
    assert!(outputs[1].violations.contains_key("node-rule"));
}

/// Cancels the engine's root token from inside its first evaluate call.
struct CancellingProvider {
    cancel: CancellationToken,
}

#[async_trait]
impl Provider for CancellingProvider {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new("referenced")]
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
        _capability: &str,
        _payload: Value,
    ) -> Result<EvaluateResponse, ProviderError> {
        self.cancel.cancel();
        Ok(EvaluateResponse {
            matched: true,
            ..Default::default()
        })
    }

    async fn get_dependencies(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<DependencyMap, ProviderError> {
        Ok(DependencyMap::new())
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

#[tokio::test]
async fn cancellation_mid_run_skips_unvisited_rules() {
    let mut engine = Engine::new(
        EngineOptions {
            workers: 1,
            ..Default::default()
        },
        ProgressBus::default(),
    );
    let cancelling = Arc::new(CancellingProvider {
        cancel: engine.cancellation_token(),
    });
    engine.register_provider(cancelling).unwrap();

    let rules = vec![
        rule("r-1", leaf("cancelling", "referenced", json!({"pattern": "x"}))),
        rule("r-2", leaf("cancelling", "referenced", json!({"pattern": "x"}))),
        rule("r-3", leaf("cancelling", "referenced", json!({"pattern": "x"}))),
    ];
    let outputs = engine.run_rules(&[ruleset_of(rules)], None).await.unwrap();

    // the first rule completed; the rest were skipped without further RPCs
    assert!(outputs[0].violations.contains_key("r-1"));
    assert_eq!(outputs[0].skipped, vec!["r-2", "r-3"]);
}

#[tokio::test]
async fn dependency_rules_run_against_provider_dependency_output() {
    let provider = Arc::new(ScriptedProvider::new("nodejs").with_dependencies(
        DependencyMap::from([(
            "file:///work/package.json".to_owned(),
            vec![
                Dependency {
                    name: "pg".to_owned(),
                    version: Some("8.1.0".to_owned()),
                    ..Default::default()
                },
                Dependency {
                    name: "express".to_owned(),
                    version: Some("4.17.0".to_owned()),
                    ..Default::default()
                },
            ],
        )]),
    ));
    let engine = engine_with(vec![provider]);

    let hit = rule(
        "dep-hit",
        leaf(
            "nodejs",
            "dependency",
            json!({"name": "pg", "lowerbound": "8.0.0"}),
        ),
    );
    let miss = rule(
        "dep-miss",
        leaf(
            "nodejs",
            "dependency",
            json!({"name": "pg", "upperbound": "7.0.0"}),
        ),
    );
    let outputs = engine
        .run_rules(&[ruleset_of(vec![hit, miss])], None)
        .await
        .unwrap();

    let violation = &outputs[0].violations["dep-hit"];
    assert_eq!(violation.incidents.len(), 1);
    assert_eq!(
        violation.incidents[0].variables["version"],
        json!("8.1.0")
    );
    assert_eq!(outputs[0].unmatched, vec!["dep-miss"]);
}

#[tokio::test]
async fn unknown_capability_is_reported_before_evaluation() {
    let provider =
        Arc::new(ScriptedProvider::new("nodejs").with_capability("referenced", Behavior::NoMatch));
    let engine = engine_with(vec![provider.clone()]);

    let bogus = rule("bogus", leaf("nodejs", "quacks", json!({})));
    let outputs = engine.run_rules(&[ruleset_of(vec![bogus])], None).await.unwrap();

    assert!(outputs[0].errors["bogus"].contains("quacks"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn negated_leaf_inverts_and_drops_incidents() {
    let provider = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(vec![incident_at("file:///a.ts", 1)], Map::new()),
    ));
    let engine = engine_with(vec![provider]);

    let mut inverted_leaf = leaf("nodejs", "referenced", json!({"pattern": "x"}));
    inverted_leaf.negated = true;
    let inverted = rule("not-rule", inverted_leaf);
    let outputs = engine
        .run_rules(&[ruleset_of(vec![inverted])], None)
        .await
        .unwrap();

    assert_eq!(outputs[0].unmatched, vec!["not-rule"]);
}

#[tokio::test]
async fn message_templates_render_against_chain_context() {
    let mut published = Map::new();
    published.insert("name".to_owned(), Value::String("pg".to_owned()));
    let provider = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(vec![incident_at("file:///a.ts", 1)], published),
    ));
    let engine = engine_with(vec![provider]);

    let mut aliased_leaf = leaf("nodejs", "referenced", json!({"pattern": "Pool"}));
    aliased_leaf.alias = Some("pkg".to_owned());
    let mut templated = rule("msg-rule", aliased_leaf);
    templated.message = Some("Replace {{pkg.name}} usage".to_owned());

    let outputs = engine
        .run_rules(&[ruleset_of(vec![templated])], None)
        .await
        .unwrap();
    assert_eq!(
        outputs[0].violations["msg-rule"].message.as_deref(),
        Some("Replace pg usage")
    );
}

#[tokio::test]
async fn ignorable_chain_children_do_not_kill_the_chain() {
    let provider = Arc::new(
        ScriptedProvider::new("nodejs")
            .with_capability("referenced", Behavior::TransportError)
            .with_capability(
                "filecontent",
                Behavior::Match(vec![incident_at("file:///a.ts", 2)], Map::new()),
            ),
    );
    let engine = engine_with(vec![provider]);

    let mut flaky = leaf("nodejs", "referenced", json!({"pattern": "A"}));
    flaky.ignorable = true;
    let chained = rule(
        "tolerant-chain",
        ConditionEntry {
            condition: Condition::Chain(vec![
                flaky,
                leaf("nodejs", "filecontent", json!({"pattern": "B"})),
            ]),
            alias: None,
            from: None,
            ignorable: false,
            negated: false,
        },
    );
    let outputs = engine
        .run_rules(&[ruleset_of(vec![chained])], None)
        .await
        .unwrap();

    let violation = &outputs[0].violations["tolerant-chain"];
    assert_eq!(violation.incidents.len(), 1);
}

#[tokio::test]
async fn tag_rules_feed_deferred_has_tags_queries() {
    let mut engine = Engine::new(EngineOptions::default(), ProgressBus::default());
    let builtin = Arc::new(crate::BuiltinProvider::new(engine.tag_store()));
    engine.register_builtin(builtin).unwrap();
    let scripted = Arc::new(ScriptedProvider::new("nodejs").with_capability(
        "referenced",
        Behavior::Match(vec![incident_at("file:///a.ts", 1)], Map::new()),
    ));
    engine.register_provider(scripted).unwrap();

    let mut tagger = rule(
        "tagger",
        leaf("nodejs", "referenced", json!({"pattern": "SpringBean"})),
    );
    tagger.tags = vec!["Spring".to_owned()];
    let tag_query = rule(
        "tag-query",
        leaf("builtin", "hasTags", json!({"tags": ["Spring"]})),
    );

    let outputs = engine
        .run_rules(&[ruleset_of(vec![tag_query, tagger])], None)
        .await
        .unwrap();

    // the hasTags rule ran in the deferred wave, after the tagger published
    assert!(outputs[0].violations.contains_key("tagger"));
    assert!(outputs[0].violations.contains_key("tag-query"));
    assert!(outputs[0].tags.contains(&"Spring".to_owned()));
}

#[tokio::test]
async fn artifact_is_identical_across_runs() {
    let build = || async {
        let provider = Arc::new(ScriptedProvider::new("nodejs").with_capability(
            "referenced",
            Behavior::Match(
                vec![
                    incident_at("file:///b.ts", 2),
                    incident_at("file:///a.ts", 9),
                ],
                Map::new(),
            ),
        ));
        let engine = engine_with(vec![provider]);
        let rules = vec![
            rule("z-rule", leaf("nodejs", "referenced", json!({"pattern": "x"}))),
            rule("a-rule", leaf("nodejs", "referenced", json!({"pattern": "y"}))),
        ];
        let outputs = engine.run_rules(&[ruleset_of(rules)], None).await.unwrap();
        crate::render_artifact(&outputs, crate::OutputFormat::Yaml).unwrap()
    };
    assert_eq!(build().await, build().await);
}
