use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::ExternalLink;

mod parser;
mod selector;

pub use parser::{ParseOutcome, RuleParser, RuleParserError, Severity, ValidationMessage};
pub use selector::{LabelSelector, SelectorError};

/// The capability name the engine resolves itself against a provider's
/// dependency subsystem; rules querying it are scheduled after all others.
pub const DEPENDENCY_CAPABILITY: &str = "dependency";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mandatory,
    Optional,
    Potential,
}

/// A `key=value` (or bare `key`) rule label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    pub key: String,
    pub value: Option<String>,
}

impl Label {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => Self {
                key: key.trim().to_owned(),
                value: Some(value.trim().to_owned()),
            },
            None => Self {
                key: raw.trim().to_owned(),
                value: None,
            },
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => write!(f, "{}", self.key),
        }
    }
}

/// A named capture evaluated against each incident's matched line.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomVariable {
    pub name: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// One node of a rule's `when` tree plus its dataflow attributes. `alias`
/// publishes the node's template context under a name; `from` renders the
/// node's payload against an earlier sibling's published context.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionEntry {
    pub condition: Condition,
    pub alias: Option<String>,
    pub from: Option<String>,
    pub ignorable: bool,
    pub negated: bool,
}

impl ConditionEntry {
    pub fn leaf(provider: impl Into<String>, capability: impl Into<String>, payload: Value) -> Self {
        Self {
            condition: Condition::Call {
                provider: provider.into(),
                capability: capability.into(),
                payload,
            },
            alias: None,
            from: None,
            ignorable: false,
            negated: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Call {
        provider: String,
        capability: String,
        payload: Value,
    },
    And(Vec<ConditionEntry>),
    Or(Vec<ConditionEntry>),
    Not(Box<ConditionEntry>),
    /// Sequential evaluation with `alias`/`from` context threading; a
    /// failing child is fatal to the chain unless marked ignorable.
    Chain(Vec<ConditionEntry>),
}

impl Condition {
    /// Every `provider.capability` pair referenced under this node.
    pub fn referenced_calls(&self) -> Vec<(&str, &str)> {
        let mut calls = Vec::new();
        self.collect_calls(&mut calls);
        calls
    }

    fn collect_calls<'a>(&'a self, calls: &mut Vec<(&'a str, &'a str)>) {
        match self {
            Condition::Call {
                provider,
                capability,
                ..
            } => calls.push((provider, capability)),
            Condition::And(children) | Condition::Or(children) | Condition::Chain(children) => {
                for child in children {
                    child.condition.collect_calls(calls);
                }
            }
            Condition::Not(child) => child.condition.collect_calls(calls),
        }
    }
}

/// Immutable once the parser hands it out.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub id: String,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub effort: Option<u32>,
    pub labels: Vec<Label>,
    pub message: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<ExternalLink>,
    pub custom_variables: Vec<CustomVariable>,
    pub when: ConditionEntry,
}

impl Rule {
    pub fn referenced_providers(&self) -> BTreeSet<&str> {
        self.when
            .condition
            .referenced_calls()
            .into_iter()
            .map(|(provider, _)| provider)
            .collect()
    }

    pub fn is_dependency_scoped(&self) -> bool {
        self.when
            .condition
            .referenced_calls()
            .iter()
            .any(|(_, capability)| *capability == DEPENDENCY_CAPABILITY)
    }
}

/// An ordered collection of rules loaded from one directory or file.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleSet {
    pub name: String,
    pub description: Option<String>,
    pub source: PathBuf,
    pub labels: Vec<Label>,
    pub tags: Vec<String>,
    pub rules: Vec<Rule>,
}
