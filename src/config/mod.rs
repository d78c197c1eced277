use std::path::PathBuf;

use clap::Parser;
use derive_builder::Builder;

mod settings_file;

pub use settings_file::{load_provider_settings, ProviderConfig, SettingsError};

/// Command-line surface of the thin `lsp-lint` binary. Everything here maps
/// onto [`EngineOptions`] or input file locations.
#[derive(Debug, Parser)]
pub struct Args {
    /// Provider settings JSON file.
    #[arg(long = "provider-settings")]
    pub provider_settings: PathBuf,

    /// Rule files or directories; may be repeated.
    #[arg(long = "rules", required = true)]
    pub rules: Vec<PathBuf>,

    /// Label-selector expression applied to rule labels.
    #[arg(long = "label-selector")]
    pub label_selector: Option<String>,

    /// Selector applied to incident variables after evaluation.
    #[arg(long = "incident-selector")]
    pub incident_selector: Option<String>,

    /// Selector applied to dependency labels during dependency analysis.
    #[arg(long = "dep-label-selector")]
    pub dep_label_selector: Option<String>,

    /// Cap on incidents kept per rule.
    #[arg(long = "limit-incidents")]
    pub incident_limit: Option<usize>,

    /// Source lines of context attached around each incident.
    #[arg(long = "context-lines")]
    pub context_lines: Option<usize>,

    /// Rule evaluation workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Where to write the output artifact; stdout when omitted.
    #[arg(long = "output-file")]
    pub output_file: Option<PathBuf>,

    /// Also write the resolved-dependency artifact here.
    #[arg(long = "dep-output-file")]
    pub dep_output_file: Option<PathBuf>,

    /// Artifact format.
    #[arg(long, value_enum, default_value = "yaml")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Engine construction parameters; see the scheduler for how each is
/// applied.
#[derive(Builder, Clone, Debug)]
#[builder(default, setter(into, strip_option))]
pub struct EngineOptions {
    pub workers: usize,

    pub incident_limit: Option<usize>,

    pub context_lines: usize,

    pub incident_selector: Option<String>,

    pub dep_label_selector: Option<String>,

    /// Incidents whose URI does not start with one of these prefixes are
    /// discarded. Populated from the configured provider locations.
    pub location_prefixes: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            incident_limit: None,
            context_lines: 10,
            incident_selector: None,
            dep_label_selector: None,
            location_prefixes: Vec::new(),
        }
    }
}

impl EngineOptions {
    pub fn from_args(args: &Args, location_prefixes: Vec<String>) -> Self {
        let defaults = Self::default();
        Self {
            workers: args.workers.unwrap_or(defaults.workers),
            incident_limit: args.incident_limit,
            context_lines: args.context_lines.unwrap_or(defaults.context_lines),
            incident_selector: args.incident_selector.clone(),
            dep_label_selector: args.dep_label_selector.clone(),
            location_prefixes,
        }
    }
}
