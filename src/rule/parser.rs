use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use tracing::instrument;

use crate::provider::ExternalLink;

use super::{Category, Condition, ConditionEntry, CustomVariable, Label, Rule, RuleSet};

pub const RULESET_MANIFEST: &str = "ruleset.yaml";

#[derive(Debug, thiserror::Error)]
pub enum RuleParserError {
    #[error("couldn't read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no rule files found under {0:?}")]
    NoRules(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One entry of the structured validation report. Errors drop the offending
/// rule; warnings keep it.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationMessage {
    pub file: PathBuf,
    pub rule_id: Option<String>,
    pub severity: Severity,
    pub message: String,
}

pub struct ParseOutcome {
    pub rulesets: Vec<RuleSet>,
    pub messages: Vec<ValidationMessage>,
}

impl ParseOutcome {
    /// Providers the engine must start for the parsed rules.
    pub fn referenced_providers(&self) -> BTreeSet<String> {
        self.rulesets
            .iter()
            .flat_map(|ruleset| &ruleset.rules)
            .flat_map(|rule| rule.referenced_providers())
            .map(str::to_owned)
            .collect()
    }

    /// Every `provider.capability` pair across all rules, serialized the way
    /// providers receive them in `prepare`.
    pub fn all_conditions(&self) -> Vec<serde_json::Value> {
        let mut conditions = Vec::new();
        for ruleset in &self.rulesets {
            for rule in &ruleset.rules {
                collect_condition_payloads(&rule.when, &mut conditions);
            }
        }
        conditions
    }
}

fn collect_condition_payloads(entry: &ConditionEntry, out: &mut Vec<serde_json::Value>) {
    match &entry.condition {
        Condition::Call {
            provider,
            capability,
            payload,
        } => out.push(serde_json::json!({
            "provider": provider,
            "capability": capability,
            "payload": payload,
        })),
        Condition::And(children) | Condition::Or(children) | Condition::Chain(children) => {
            for child in children {
                collect_condition_payloads(child, out);
            }
        }
        Condition::Not(child) => collect_condition_payloads(child, out),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuleSetManifest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Loads YAML rules from files or directories. A directory becomes one
/// ruleset (named by its `ruleset.yaml` manifest when present), collecting
/// every nested `*.yaml`/`*.yml` rule file in path order; a lone file
/// becomes a ruleset named after its stem.
#[derive(Default)]
pub struct RuleParser;

impl RuleParser {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip_all, fields(paths = ?paths))]
    pub fn load_paths(&self, paths: &[PathBuf]) -> Result<ParseOutcome, RuleParserError> {
        let mut rulesets = Vec::new();
        let mut messages = Vec::new();
        for path in paths {
            if path.is_dir() {
                rulesets.push(self.load_directory(path, &mut messages)?);
            } else {
                rulesets.push(self.load_file(path, &mut messages)?);
            }
        }
        if rulesets.iter().all(|ruleset| ruleset.rules.is_empty()) && !paths.is_empty() {
            // every file may still have failed validation; the report says why
            if messages.iter().all(|m| m.severity != Severity::Error) {
                return Err(RuleParserError::NoRules(paths[0].clone()));
            }
        }
        Ok(ParseOutcome { rulesets, messages })
    }

    fn load_directory(
        &self,
        dir: &Path,
        messages: &mut Vec<ValidationMessage>,
    ) -> Result<RuleSet, RuleParserError> {
        let mut rule_files = Vec::new();
        let mut manifest: Option<RuleSetManifest> = None;
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|source| RuleParserError::Read {
                path: dir.to_owned(),
                source: source.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(RULESET_MANIFEST) {
                let contents = read(path)?;
                match serde_yaml::from_str(&contents) {
                    Ok(parsed) => manifest = Some(parsed),
                    Err(error) => messages.push(ValidationMessage {
                        file: path.to_owned(),
                        rule_id: None,
                        severity: Severity::Error,
                        message: format!("unparseable ruleset manifest: {error}"),
                    }),
                }
                continue;
            }
            if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                rule_files.push(path.to_owned());
            }
        }
        rule_files.sort();

        let mut rules = Vec::new();
        for file in &rule_files {
            self.parse_rule_file(file, &mut rules, messages)?;
        }
        let (name, description, labels, tags) = match manifest {
            Some(manifest) => (
                manifest.name,
                manifest.description,
                manifest.labels.iter().map(|raw| Label::parse(raw)).collect(),
                manifest.tags,
            ),
            None => (default_ruleset_name(dir), None, Vec::new(), Vec::new()),
        };
        Ok(RuleSet {
            name,
            description,
            source: dir.to_owned(),
            labels,
            tags,
            rules,
        })
    }

    fn load_file(
        &self,
        file: &Path,
        messages: &mut Vec<ValidationMessage>,
    ) -> Result<RuleSet, RuleParserError> {
        let mut rules = Vec::new();
        self.parse_rule_file(file, &mut rules, messages)?;
        Ok(RuleSet {
            name: default_ruleset_name(file),
            description: None,
            source: file.to_owned(),
            labels: Vec::new(),
            tags: Vec::new(),
            rules,
        })
    }

    fn parse_rule_file(
        &self,
        file: &Path,
        rules: &mut Vec<Rule>,
        messages: &mut Vec<ValidationMessage>,
    ) -> Result<(), RuleParserError> {
        let contents = read(file)?;
        let document: YamlValue = match serde_yaml::from_str(&contents) {
            Ok(document) => document,
            Err(error) => {
                messages.push(ValidationMessage {
                    file: file.to_owned(),
                    rule_id: None,
                    severity: Severity::Error,
                    message: format!("unparseable YAML: {error}"),
                });
                return Ok(());
            }
        };
        let documents: Vec<YamlValue> = match document {
            YamlValue::Sequence(sequence) => sequence,
            mapping @ YamlValue::Mapping(_) => vec![mapping],
            YamlValue::Null => Vec::new(),
            _ => {
                messages.push(ValidationMessage {
                    file: file.to_owned(),
                    rule_id: None,
                    severity: Severity::Error,
                    message: "rule file must contain a rule or list of rules".to_owned(),
                });
                return Ok(());
            }
        };
        for document in documents {
            match parse_rule(&document, file, messages) {
                Some(rule) => rules.push(rule),
                None => {}
            }
        }
        Ok(())
    }
}

fn default_ruleset_name(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ruleset".to_owned())
}

fn read(path: &Path) -> Result<String, RuleParserError> {
    fs::read_to_string(path).map_err(|source| RuleParserError::Read {
        path: path.to_owned(),
        source,
    })
}

fn parse_rule(
    document: &YamlValue,
    file: &Path,
    messages: &mut Vec<ValidationMessage>,
) -> Option<Rule> {
    let mut error = |rule_id: Option<String>, message: String| {
        messages.push(ValidationMessage {
            file: file.to_owned(),
            rule_id,
            severity: Severity::Error,
            message,
        });
    };

    let mapping = match document.as_mapping() {
        Some(mapping) => mapping,
        None => {
            error(None, "rule must be a mapping".to_owned());
            return None;
        }
    };
    let get = |key: &str| mapping.get(YamlValue::String(key.to_owned()));

    // a rule without a stable ID is a hard error
    let id = match get("ruleID").and_then(YamlValue::as_str) {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => {
            error(None, "rule is missing ruleID".to_owned());
            return None;
        }
    };

    let mut warn = |message: String| {
        messages.push(ValidationMessage {
            file: file.to_owned(),
            rule_id: Some(id.clone()),
            severity: Severity::Warning,
            message,
        });
    };

    let description = get("description")
        .and_then(YamlValue::as_str)
        .map(str::to_owned);
    if description.is_none() {
        warn("rule has no description".to_owned());
    }

    let category = match get("category") {
        None => None,
        Some(value) => match serde_yaml::from_value::<Category>(value.clone()) {
            Ok(category) => Some(category),
            Err(_) => {
                warn(format!("unrecognized category {value:?}"));
                None
            }
        },
    };

    let effort = get("effort").and_then(YamlValue::as_u64).map(|e| e as u32);

    let labels: Vec<Label> = get("labels")
        .and_then(YamlValue::as_sequence)
        .map(|sequence| {
            sequence
                .iter()
                .filter_map(YamlValue::as_str)
                .map(Label::parse)
                .collect()
        })
        .unwrap_or_default();
    if labels.is_empty() {
        warn("rule has no labels".to_owned());
    }

    let message = get("message").and_then(YamlValue::as_str).map(str::to_owned);

    let tags: Vec<String> = get("tag")
        .and_then(YamlValue::as_sequence)
        .map(|sequence| {
            sequence
                .iter()
                .filter_map(YamlValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let links: Vec<ExternalLink> = match get("links") {
        None => Vec::new(),
        Some(value) => match serde_yaml::from_value(value.clone()) {
            Ok(links) => links,
            Err(parse_error) => {
                warn(format!("unparseable links: {parse_error}"));
                Vec::new()
            }
        },
    };

    let custom_variables: Vec<CustomVariable> = match get("customVariables") {
        None => Vec::new(),
        Some(value) => match serde_yaml::from_value(value.clone()) {
            Ok(variables) => variables,
            Err(parse_error) => {
                warn(format!("unparseable customVariables: {parse_error}"));
                Vec::new()
            }
        },
    };

    let when = match get("when") {
        None => {
            messages.push(ValidationMessage {
                file: file.to_owned(),
                rule_id: Some(id),
                severity: Severity::Error,
                message: "rule has no when block".to_owned(),
            });
            return None;
        }
        Some(value) => match parse_condition_entry(value) {
            Ok(when) => when,
            Err(condition_error) => {
                messages.push(ValidationMessage {
                    file: file.to_owned(),
                    rule_id: Some(id),
                    severity: Severity::Error,
                    message: format!("malformed condition: {condition_error}"),
                });
                return None;
            }
        },
    };

    let mut dataflow_errors = Vec::new();
    validate_dataflow(&when, &mut Vec::new(), &mut dataflow_errors);
    if !dataflow_errors.is_empty() {
        for dataflow_error in dataflow_errors {
            messages.push(ValidationMessage {
                file: file.to_owned(),
                rule_id: Some(id.clone()),
                severity: Severity::Error,
                message: dataflow_error,
            });
        }
        return None;
    }

    Some(Rule {
        id,
        description,
        category,
        effort,
        labels,
        message,
        tags,
        links,
        custom_variables,
        when,
    })
}

const KEY_AS: &str = "as";
const KEY_FROM: &str = "from";
const KEY_IGNORABLE: &str = "ignorable";
const KEY_NOT: &str = "not";

fn parse_condition_entry(value: &YamlValue) -> Result<ConditionEntry, String> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| "condition must be a mapping".to_owned())?;

    let mut alias = None;
    let mut from = None;
    let mut ignorable = false;
    let mut negated = false;
    let mut primary: Option<(String, &YamlValue)> = None;

    for (key, entry_value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| "condition keys must be strings".to_owned())?;
        match key {
            KEY_AS => {
                alias = Some(
                    entry_value
                        .as_str()
                        .ok_or_else(|| "`as` must be a string".to_owned())?
                        .to_owned(),
                );
            }
            KEY_FROM => {
                from = Some(
                    entry_value
                        .as_str()
                        .ok_or_else(|| "`from` must be a string".to_owned())?
                        .to_owned(),
                );
            }
            KEY_IGNORABLE => {
                ignorable = entry_value
                    .as_bool()
                    .ok_or_else(|| "`ignorable` must be a boolean".to_owned())?;
            }
            // `not: true` negates a sibling leaf; `not: {…}` is the
            // boolean-composite form
            KEY_NOT => match entry_value {
                YamlValue::Bool(flag) => negated = *flag,
                other => {
                    if primary.is_some() {
                        return Err("condition has more than one operation".to_owned());
                    }
                    primary = Some((KEY_NOT.to_owned(), other));
                }
            },
            other => {
                if primary.is_some() {
                    return Err(format!(
                        "condition has more than one operation (second: {other:?})"
                    ));
                }
                primary = Some((other.to_owned(), entry_value));
            }
        }
    }

    let (key, operand) = primary.ok_or_else(|| "condition has no operation".to_owned())?;
    let condition = match key.as_str() {
        "and" => Condition::And(parse_children(operand, "and")?),
        "or" => Condition::Or(parse_children(operand, "or")?),
        "chain" => Condition::Chain(parse_children(operand, "chain")?),
        KEY_NOT => Condition::Not(Box::new(parse_condition_entry(operand)?)),
        call => {
            let (provider, capability) = call
                .split_once('.')
                .filter(|(provider, capability)| !provider.is_empty() && !capability.is_empty())
                .ok_or_else(|| {
                    format!("condition key {call:?} is not of the form provider.capability")
                })?;
            let payload = yaml_to_json(operand)?;
            Condition::Call {
                provider: provider.to_owned(),
                capability: capability.to_owned(),
                payload,
            }
        }
    };

    Ok(ConditionEntry {
        condition,
        alias,
        from,
        ignorable,
        negated,
    })
}

fn parse_children(value: &YamlValue, operator: &str) -> Result<Vec<ConditionEntry>, String> {
    let sequence = value
        .as_sequence()
        .ok_or_else(|| format!("`{operator}` requires a list of conditions"))?;
    if sequence.is_empty() {
        return Err(format!("`{operator}` requires at least one condition"));
    }
    sequence.iter().map(parse_condition_entry).collect()
}

fn yaml_to_json(value: &YamlValue) -> Result<serde_json::Value, String> {
    serde_yaml::from_value(value.clone())
        .map_err(|error| format!("condition payload is not plain data: {error}"))
}

/// Every `from` must resolve to an `as` published by an earlier sibling in
/// scope; anything else is a parse error, never a runtime one.
fn validate_dataflow(
    entry: &ConditionEntry,
    available: &mut Vec<String>,
    errors: &mut Vec<String>,
) {
    if let Some(from) = &entry.from {
        if !available.contains(from) {
            errors.push(format!(
                "`from: {from}` does not resolve to an earlier `as` in its chain"
            ));
        }
    }
    match &entry.condition {
        Condition::And(children) | Condition::Or(children) | Condition::Chain(children) => {
            let scope_depth = available.len();
            for child in children {
                validate_dataflow(child, available, errors);
                if let Some(alias) = &child.alias {
                    available.push(alias.clone());
                }
            }
            available.truncate(scope_depth);
        }
        Condition::Not(child) => validate_dataflow(child, available, errors),
        Condition::Call { .. } => {}
    }
}
