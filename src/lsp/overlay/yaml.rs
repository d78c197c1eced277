use std::path::Path;

use jsonschema::JSONSchema;
use lsp_types::{Range, Url};
use serde::Deserialize;
use serde_json::json;

use crate::file_search::{SearchConstraints, SearchError};

use super::{
    content_regex, scan_content, search_document_uris, LanguageOverlay, ReferencedCondition,
};

/// YAML overlay. Instead of treating the query as a symbol name, it
/// compiles a JSON Schema that rejects any document containing the query as
/// a key or scalar and validates each parsed document against it; a failing
/// validation marks the file as matching, and the concrete ranges come from
/// a text scan over the same content.
#[derive(Default)]
pub struct YamlOverlay;

/// Schema that fails validation wherever `query` appears as a mapping key
/// or scalar value, at any depth.
fn rejecting_schema(query: &str) -> serde_json::Value {
    json!({
        "definitions": {
            "clean": {
                "allOf": [
                    {"not": {"const": query}},
                    {
                        "if": {"type": "object"},
                        "then": {
                            "propertyNames": {"not": {"const": query}},
                            "additionalProperties": {"$ref": "#/definitions/clean"},
                        },
                    },
                    {
                        "if": {"type": "array"},
                        "then": {"items": {"$ref": "#/definitions/clean"}},
                    },
                ],
            },
        },
        "$ref": "#/definitions/clean",
    })
}

fn document_contains(query: &str, document: &serde_json::Value) -> bool {
    match JSONSchema::compile(&rejecting_schema(query)) {
        Ok(schema) => !schema.is_valid(document),
        Err(_) => false,
    }
}

impl LanguageOverlay for YamlOverlay {
    fn name(&self) -> &str {
        "yaml"
    }

    fn get_document_uris(
        &self,
        root: &Path,
        conditions: &[ReferencedCondition],
    ) -> Result<Vec<Url>, SearchError> {
        let constraints = SearchConstraints {
            included: vec![r"\.ya?ml$".to_owned()],
            excluded: Vec::new(),
        };
        search_document_uris(root, conditions, Some(&constraints))
    }

    fn match_file_content_by_conditions(
        &self,
        content: &str,
        conditions: &[ReferencedCondition],
    ) -> Vec<Range> {
        let mut matching_queries = Vec::new();
        for condition in conditions {
            // every YAML document in the file must be checked; one schema
            // rejection is enough to count the query as present
            let present = serde_yaml::Deserializer::from_str(content).any(|document| {
                serde_json::Value::deserialize(document)
                    .map(|value| document_contains(&condition.pattern, &value))
                    .unwrap_or(false)
            });
            if present {
                matching_queries.push(content_regex(&regex::escape(&condition.pattern)));
            }
        }
        if matching_queries.is_empty() {
            return Vec::new();
        }
        // comment-only occurrences never validate against the schema, so
        // drop ranges on lines where the query sits behind a '#'
        scan_content(content, &matching_queries)
            .into_iter()
            .filter(|range| {
                content
                    .lines()
                    .nth(range.start.line as usize)
                    .map(|line| !is_commented_at(line, range.start.character as usize))
                    .unwrap_or(false)
            })
            .collect()
    }
}

fn is_commented_at(line: &str, character: usize) -> bool {
    line.chars().take(character).any(|c| c == '#')
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn matches(content: &str, query: &str) -> Vec<Range> {
        YamlOverlay.match_file_content_by_conditions(
            content,
            &[ReferencedCondition {
                pattern: query.to_owned(),
                ..Default::default()
            }],
        )
    }

    #[test]
    fn finds_the_query_as_a_value() {
        let ranges = matches("kind: Deployment\nname: api\n", "Deployment");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start.line, 0);
    }

    #[test]
    fn finds_the_query_as_a_nested_key() {
        let ranges = matches("spec:\n  replicas: 2\n  strategy: {}\n", "strategy");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start.line, 2);
    }

    #[test]
    fn comment_only_occurrences_do_not_match() {
        let ranges = matches("# strategy lives elsewhere\nspec:\n  replicas: 2\n", "strategy");
        assert!(ranges.is_empty());
    }

    #[test]
    fn absent_queries_match_nothing() {
        assert!(matches("kind: Service\n", "Deployment").is_empty());
    }
}
