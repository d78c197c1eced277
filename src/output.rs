use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::OutputFormat;
use crate::provider::{Dependency, ExternalLink, Incident};
use crate::rule::Category;

/// A rule's aggregated result within one ruleset.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub incidents: Vec<Incident>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ExternalLink>,
}

/// One ruleset of the final artifact. Violations and errors are keyed by
/// rule ID; map keys serialize sorted, which keeps the artifact
/// byte-identical across runs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub violations: BTreeMap<String, Violation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

/// Stable ordering over the whole artifact: rulesets by name, the lists
/// within each ruleset sorted, incidents by (URI, line, character).
pub fn finalize(mut outputs: Vec<RuleSetOutput>) -> Vec<RuleSetOutput> {
    for output in &mut outputs {
        output.tags.sort();
        output.tags.dedup();
        output.unmatched.sort();
        output.unmatched.dedup();
        output.skipped.sort();
        output.skipped.dedup();
        for violation in output.violations.values_mut() {
            violation.incidents.sort_by(incident_order);
        }
    }
    outputs.sort_by(|a, b| a.name.cmp(&b.name));
    outputs
}

pub fn incident_order(a: &Incident, b: &Incident) -> std::cmp::Ordering {
    let key = |incident: &Incident| {
        (
            incident.file_uri.clone(),
            incident.line_number.unwrap_or(0),
            incident
                .code_location
                .map(|location| location.start_position.character)
                .unwrap_or(0),
        )
    };
    key(a).cmp(&key(b))
}

/// One provider's resolved dependencies for one manifest file, as emitted
/// in the dependency artifact.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyOutput {
    pub provider: String,
    #[serde(rename = "fileURI")]
    pub file_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

pub fn write_dependency_artifact(
    entries: &[DependencyOutput],
    format: OutputFormat,
    destination: &Path,
) -> std::io::Result<()> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(entries)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?,
        OutputFormat::Json => serde_json::to_string_pretty(entries)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?,
    };
    std::fs::write(destination, rendered)
}

pub fn to_string(
    outputs: &[RuleSetOutput],
    format: OutputFormat,
) -> Result<String, serde_yaml::Error> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(outputs),
        OutputFormat::Json => {
            // serde_json never fails on this shape; route through yaml's
            // error type to keep one signature
            Ok(serde_json::to_string_pretty(outputs).expect("artifact serializes"))
        }
    }
}

pub fn write_artifact(
    outputs: &[RuleSetOutput],
    format: OutputFormat,
    destination: Option<&Path>,
) -> std::io::Result<()> {
    let rendered = to_string(outputs, format)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
    match destination {
        Some(path) => std::fs::write(path, rendered),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(rendered.as_bytes())
        }
    }
}
