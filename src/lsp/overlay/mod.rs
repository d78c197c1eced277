use std::path::Path;

use lsp_types::{Position, Range, Url};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::file_search::{FileSearcher, SearchConstraints, SearchError};
use crate::provider::DependencyMap;

mod node;
mod yaml;

pub use node::NodeOverlay;
pub use yaml::YamlOverlay;

/// The one serialized shape of a `referenced` condition payload. Provider
/// context never rides along; chains thread their template maps separately.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedCondition {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepaths: Option<Vec<String>>,
}

impl ReferencedCondition {
    /// Pull this provider's `referenced` payloads out of the union of
    /// conditions handed to `prepare`.
    pub fn from_prepare_conditions(conditions: &[Value], provider: &str) -> Vec<Self> {
        conditions
            .iter()
            .filter(|condition| {
                condition["provider"] == provider && condition["capability"] == "referenced"
            })
            .filter_map(|condition| {
                serde_json::from_value(condition["payload"].clone()).ok()
            })
            .collect()
    }
}

/// Language-specific hooks the service-client base calls into. Overlays are
/// stateless and hold no reference back to the base.
pub trait LanguageOverlay: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate files for symbol population.
    fn get_document_uris(
        &self,
        root: &Path,
        conditions: &[ReferencedCondition],
    ) -> Result<Vec<Url>, SearchError>;

    /// Language-specific pre-filter over raw file content; returned ranges
    /// feed the definition-chasing pipeline.
    fn match_file_content_by_conditions(
        &self,
        content: &str,
        conditions: &[ReferencedCondition],
    ) -> Vec<Range>;

    /// Language-specific symbol-name comparison.
    fn match_symbol_by_patterns(&self, symbol_name: &str, patterns: &[String]) -> bool {
        patterns
            .iter()
            .any(|pattern| default_symbol_match(symbol_name, pattern))
    }

    /// Resolve the project's declared dependencies from its manifest, keyed
    /// by the manifest's file URI. Languages without a manifest story
    /// resolve nothing.
    fn resolve_dependencies(&self, _root: &Path) -> DependencyMap {
        DependencyMap::new()
    }
}

/// Directories no overlay wants to chase symbols into.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    ".git",
    "dist",
    "build",
    "target",
    ".venv",
    "venv",
];

pub(crate) fn default_excluded_constraints() -> SearchConstraints {
    SearchConstraints {
        included: Vec::new(),
        excluded: DEFAULT_EXCLUDED_DIRS.iter().map(|d| (*d).to_owned()).collect(),
    }
}

pub(crate) fn condition_filepaths(conditions: &[ReferencedCondition]) -> Option<Vec<String>> {
    let filepaths: Vec<String> = conditions
        .iter()
        .filter_map(|condition| condition.filepaths.as_ref())
        .flatten()
        .cloned()
        .collect();
    if filepaths.is_empty() {
        None
    } else {
        Some(filepaths)
    }
}

pub(crate) fn search_document_uris(
    root: &Path,
    conditions: &[ReferencedCondition],
    rule_constraints: Option<&SearchConstraints>,
) -> Result<Vec<Url>, SearchError> {
    let mut searcher =
        FileSearcher::new(root).with_provider_constraints(&default_excluded_constraints());
    if let Some(constraints) = rule_constraints {
        searcher = searcher.with_rule_constraints(constraints);
    }
    let filepaths = condition_filepaths(conditions);
    let paths = searcher.search(filepaths.as_deref())?;
    Ok(paths
        .into_iter()
        .filter_map(|path| Url::from_file_path(&path).ok())
        .collect())
}

/// The query is a case-insensitive regex when it carries regex
/// metacharacters, otherwise a case-insensitive exact name match.
pub fn default_symbol_match(symbol_name: &str, pattern: &str) -> bool {
    if has_regex_metacharacters(pattern) {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(|regex| regex.is_match(symbol_name))
            .unwrap_or(false)
    } else {
        symbol_name.eq_ignore_ascii_case(pattern)
    }
}

pub(crate) fn has_regex_metacharacters(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|c| matches!(c, '.' | '*' | '+' | '?' | '[' | ']' | '(' | ')' | '|' | '^' | '$' | '\\' | '{' | '}'))
}

/// Compile a condition pattern for content scanning; invalid regexes fall
/// back to a literal search.
pub(crate) fn content_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|_| {
        Regex::new(&regex::escape(pattern)).expect("escaped literal always compiles")
    })
}

pub(crate) fn scan_content(content: &str, patterns: &[Regex]) -> Vec<Range> {
    let mut ranges = Vec::new();
    for (line_index, line) in content.lines().enumerate() {
        for pattern in patterns {
            for found in pattern.find_iter(line) {
                let start_character = line[..found.start()].chars().count() as u32;
                let matched_characters = found.as_str().chars().count() as u32;
                ranges.push(Range {
                    start: Position {
                        line: line_index as u32,
                        character: start_character,
                    },
                    end: Position {
                        line: line_index as u32,
                        character: start_character + matched_characters,
                    },
                });
            }
        }
    }
    ranges
}

/// The fallback overlay: plain regex scanning and the default symbol
/// matcher.
#[derive(Default)]
pub struct DefaultOverlay;

impl LanguageOverlay for DefaultOverlay {
    fn name(&self) -> &str {
        "default"
    }

    fn get_document_uris(
        &self,
        root: &Path,
        conditions: &[ReferencedCondition],
    ) -> Result<Vec<Url>, SearchError> {
        search_document_uris(root, conditions, None)
    }

    fn match_file_content_by_conditions(
        &self,
        content: &str,
        conditions: &[ReferencedCondition],
    ) -> Vec<Range> {
        let patterns: Vec<Regex> = conditions
            .iter()
            .map(|condition| content_regex(&condition.pattern))
            .collect();
        scan_content(content, &patterns)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_symbol_match_switches_on_metacharacters() {
        assert!(default_symbol_match("HttpClient", "httpclient"));
        assert!(!default_symbol_match("HttpClientFactory", "httpclient"));
        assert!(default_symbol_match("HttpClientFactory", "HttpClient.*"));
        assert!(!default_symbol_match("Socket", "HttpClient.*"));
    }

    #[test]
    fn content_scan_reports_line_and_character() {
        let content = "let a = createPool();\nlet b = createPool();\n";
        let ranges = scan_content(content, &[content_regex("createPool")]);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, Position { line: 0, character: 8 });
        assert_eq!(ranges[1].start, Position { line: 1, character: 8 });
    }

    #[test]
    fn referenced_conditions_filter_by_provider() {
        let conditions = vec![
            serde_json::json!({
                "provider": "nodejs",
                "capability": "referenced",
                "payload": {"pattern": "Pool"},
            }),
            serde_json::json!({
                "provider": "java",
                "capability": "referenced",
                "payload": {"pattern": "DataSource"},
            }),
            serde_json::json!({
                "provider": "nodejs",
                "capability": "dependency",
                "payload": {"name": "pg"},
            }),
        ];
        let parsed = ReferencedCondition::from_prepare_conditions(&conditions, "nodejs");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].pattern, "Pool");
    }
}
