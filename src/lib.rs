mod config;
mod engine;
mod file_search;
mod lsp;
mod output;
mod progress;
mod provider;
mod rpc;
mod rule;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{info_span, instrument, warn};

pub use config::{
    load_provider_settings, Args, EngineOptions, EngineOptionsBuilder, OutputFormat,
    ProviderConfig, SettingsError,
};
pub use engine::{
    compare_versions, ConditionOutcome, Engine, EngineError, Evaluator, IncidentPostProcessor,
    TemplateRenderer,
};
pub use file_search::{normalize_path, FileSearcher, SearchConstraints, SearchError};
pub use lsp::{
    default_symbol_match, range_contains, range_length_key, smallest_enclosing, AwaitCache,
    DefaultOverlay, DefinitionSymbol, LanguageOverlay, LspProvider, LspServiceClient, NodeOverlay,
    PopulationPipeline, ReferencedCondition, SymbolCache, WorkspaceSymbol,
    WorkspaceSymbolDefinitionsPair, YamlOverlay, CAP_REFERENCED,
};
pub use output::{
    finalize, to_string as render_artifact, write_artifact, write_dependency_artifact,
    DependencyOutput, RuleSetOutput, Violation,
};
pub use progress::{
    ChannelReporter, NoopReporter, ProgressBus, ProgressEvent, ProgressReporter, Stage,
    TextReporter,
};
pub use provider::{
    AnalysisMode, BackoffPolicy, BackoffTable, BuiltinProvider, Capability, CapabilityRegistry,
    CodeLocation, Dependency, DependencyDagMap, DependencyMap, DependencyNode, EvaluateResponse,
    ExternalLink, FileChange, Incident, InitConfig, InitResult, Position, PrepareProgress,
    Provider, ProviderError, ProviderServer, ProxyConfig, RpcProvider, Supervisor,
    SupervisorOptions, SupervisorOptionsBuilder, TagStore, TransportKind, BUILTIN_PROVIDER_NAME,
};
pub use rpc::{
    Connection, ConnectionHandlers, ConnectionOptions, GrpcTransport, Message, MessageReceiver,
    MessageSender, PipeTransport, ResponseError, RpcError, StdioTransport, Transport,
};
pub use rule::{
    Category, Condition, ConditionEntry, CustomVariable, Label, LabelSelector, ParseOutcome, Rule,
    RuleParser, RuleParserError, RuleSet, SelectorError, Severity, ValidationMessage,
    DEPENDENCY_CAPABILITY,
};

pub enum ExitStatus {
    Ok,
    FoundViolations,
}

/// Run a full analysis from parsed CLI args: load settings, parse rules,
/// start the referenced providers, evaluate, and tear everything down.
#[instrument(skip_all)]
pub async fn run(args: &Args) -> Result<Vec<RuleSetOutput>, EngineError> {
    let progress = ProgressBus::new(vec![Arc::new(TextReporter) as Arc<dyn ProgressReporter>]);
    progress.emit(ProgressEvent::new(Stage::Init));

    let settings = load_provider_settings(&args.provider_settings)?;

    progress.emit(ProgressEvent::new(Stage::RuleParsing));
    let outcome = RuleParser::new().load_paths(&args.rules)?;
    for message in &outcome.messages {
        match message.severity {
            Severity::Error => warn!(
                file = ?message.file,
                rule = ?message.rule_id,
                "{}", message.message
            ),
            Severity::Warning => tracing::debug!(
                file = ?message.file,
                rule = ?message.rule_id,
                "{}", message.message
            ),
        }
    }

    let selector = args
        .label_selector
        .as_deref()
        .map(LabelSelector::parse)
        .transpose()?;

    let location_prefixes: Vec<String> = settings
        .iter()
        .flat_map(|config| &config.init_config)
        .map(|init| init.location.clone())
        .collect();
    let options = EngineOptions::from_args(args, location_prefixes);

    let mut engine = Engine::new(options, progress.clone());
    let builtin = Arc::new(BuiltinProvider::new(engine.tag_store()));
    engine.register_builtin(builtin)?;

    let needed = outcome.referenced_providers();
    let mut supervisors: Vec<Arc<Supervisor>> = Vec::new();
    let span = info_span!("starting providers", needed = needed.len()).entered();
    for config in &settings {
        if config.name == BUILTIN_PROVIDER_NAME || !needed.contains(&config.name) {
            continue;
        }
        if config.is_in_process_lsp() {
            let provider = Arc::new(LspProvider::new(
                config.name.clone(),
                language_id_for(&config.name),
                overlay_for(&config.name),
            ));
            let bus = progress.clone();
            provider.on_prepare_progress(Arc::new(move |update: PrepareProgress| {
                bus.emit(
                    ProgressEvent::new(Stage::ProviderInit)
                        .with_message(update.provider_name.clone())
                        .with_counts(update.files_processed, update.total_files),
                );
            }));
            engine.register_provider(provider)?;
        } else {
            let supervisor = Arc::new(Supervisor::new(
                config.clone(),
                SupervisorOptions::default(),
            ));
            let provider = supervisor
                .start(prepare_progress_handlers(progress.clone()))
                .await?;
            engine.register_provider(provider)?;
            supervisors.push(supervisor);
        }
    }
    span.exit();

    let init_configs = init_configs_with_builtin(&settings);
    engine.init_providers(&init_configs).await?;

    let outputs = engine.run_rules(&outcome.rulesets, selector.as_ref()).await;

    if let Some(dep_output_file) = &args.dep_output_file {
        match engine.collect_dependencies().await {
            Ok(dependencies) => {
                write_dependency_artifact(&dependencies, args.format, dep_output_file)?;
            }
            Err(error) => warn!(%error, "dependency artifact not written"),
        }
    }

    engine.stop().await;
    for supervisor in &supervisors {
        supervisor.stop().await;
    }
    outputs
}

#[instrument(skip_all)]
pub async fn run_and_output(args: Args) -> Result<ExitStatus, EngineError> {
    let outputs = run(&args).await?;
    write_artifact(&outputs, args.format, args.output_file.as_deref())?;
    let found_violations = outputs.iter().any(|output| !output.violations.is_empty());
    Ok(if found_violations {
        ExitStatus::FoundViolations
    } else {
        ExitStatus::Ok
    })
}

/// Forward a provider's streamed prepare progress into the bus; everything
/// else a provider pushes at us is ignorable.
fn prepare_progress_handlers(progress: ProgressBus) -> ConnectionHandlers {
    ConnectionHandlers {
        on_notification: Some(Box::new(move |method, params| {
            if method == "prepare/progress" {
                if let Some(update) = params
                    .and_then(|params| serde_json::from_value::<PrepareProgress>(params).ok())
                {
                    progress.emit(
                        ProgressEvent::new(Stage::ProviderInit)
                            .with_message(update.provider_name.clone())
                            .with_counts(update.files_processed, update.total_files),
                    );
                }
            }
        })),
        on_request: None,
    }
}

/// The builtin provider indexes every configured location, whether or not
/// the settings file lists it explicitly.
fn init_configs_with_builtin(settings: &[ProviderConfig]) -> Vec<ProviderConfig> {
    let mut configs: Vec<ProviderConfig> = settings.to_vec();
    if !configs
        .iter()
        .any(|config| config.name == BUILTIN_PROVIDER_NAME)
    {
        let init_config: Vec<InitConfig> = settings
            .iter()
            .flat_map(|config| &config.init_config)
            .map(|init| InitConfig {
                location: init.location.clone(),
                ..Default::default()
            })
            .collect();
        configs.push(ProviderConfig {
            name: BUILTIN_PROVIDER_NAME.to_owned(),
            binary_path: None,
            args: Vec::new(),
            address: None,
            transport: TransportKind::Stdio,
            init_config,
        });
    }
    configs
}

fn overlay_for(provider_name: &str) -> Arc<dyn LanguageOverlay> {
    match provider_name {
        "nodejs" | "javascript" | "typescript" => Arc::new(NodeOverlay),
        "yaml" => Arc::new(YamlOverlay),
        _ => Arc::new(DefaultOverlay),
    }
}

fn language_id_for(provider_name: &str) -> String {
    match provider_name {
        "nodejs" => "javascript".to_owned(),
        other => other.to_owned(),
    }
}
