use std::path::Path;

use lsp_types::{Range, Url};
use regex::Regex;

use crate::file_search::{normalize_path, SearchConstraints, SearchError};
use crate::provider::{Dependency, DependencyMap};

use super::{
    content_regex, default_symbol_match, scan_content, search_document_uris, LanguageOverlay,
    ReferencedCondition,
};

/// JS/TS overlay. Patterns may take the `@scope/pkg#Type.sub` form; only
/// the `#…` tail participates in symbol-name matching, the package half is
/// resolved by the import pre-scan.
#[derive(Default)]
pub struct NodeOverlay;

const SOURCE_FILE_PATTERNS: &[&str] = &[
    r"\.js$", r"\.jsx$", r"\.ts$", r"\.tsx$", r"\.mjs$", r"\.cjs$",
];

fn split_package_pattern(pattern: &str) -> (Option<&str>, &str) {
    match pattern.split_once('#') {
        Some((package, tail)) if !tail.is_empty() => (Some(package), tail),
        _ => (None, pattern),
    }
}

impl LanguageOverlay for NodeOverlay {
    fn name(&self) -> &str {
        "nodejs"
    }

    fn get_document_uris(
        &self,
        root: &Path,
        conditions: &[ReferencedCondition],
    ) -> Result<Vec<Url>, SearchError> {
        let constraints = SearchConstraints {
            included: SOURCE_FILE_PATTERNS.iter().map(|p| (*p).to_owned()).collect(),
            excluded: Vec::new(),
        };
        search_document_uris(root, conditions, Some(&constraints))
    }

    /// Pre-scan for import/require sites of the queried packages alongside
    /// bare occurrences of the symbol tail.
    fn match_file_content_by_conditions(
        &self,
        content: &str,
        conditions: &[ReferencedCondition],
    ) -> Vec<Range> {
        let mut patterns: Vec<Regex> = Vec::new();
        for condition in conditions {
            let (package, tail) = split_package_pattern(&condition.pattern);
            if let Some(package) = package {
                let escaped = regex::escape(package);
                if let Ok(import_pattern) = Regex::new(&format!(
                    r#"(?:require\s*\(\s*|from\s+|import\s+)['"]{escaped}['"]"#
                )) {
                    patterns.push(import_pattern);
                }
            }
            patterns.push(content_regex(tail));
        }
        scan_content(content, &patterns)
    }

    fn match_symbol_by_patterns(&self, symbol_name: &str, patterns: &[String]) -> bool {
        patterns.iter().any(|pattern| {
            let (_, tail) = split_package_pattern(pattern);
            if default_symbol_match(symbol_name, tail) {
                return true;
            }
            // `Type.sub` tails also answer to their final segment
            tail.rsplit('.')
                .next()
                .map(|segment| default_symbol_match(symbol_name, segment))
                .unwrap_or(false)
        })
    }

    /// package.json dependencies and devDependencies, keyed by the manifest
    /// URI. devDependencies count as indirect.
    fn resolve_dependencies(&self, root: &Path) -> DependencyMap {
        let manifest = root.join("package.json");
        let Ok(contents) = std::fs::read_to_string(&manifest) else {
            return DependencyMap::new();
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&contents) else {
            return DependencyMap::new();
        };

        let mut dependencies = Vec::new();
        for (section, indirect) in [("dependencies", false), ("devDependencies", true)] {
            let Some(entries) = parsed.get(section).and_then(|v| v.as_object()) else {
                continue;
            };
            for (name, version) in entries {
                let version = version.as_str().map(str::to_owned);
                dependencies.push(Dependency {
                    name: name.clone(),
                    resolved_identifier: version
                        .as_ref()
                        .map(|version| format!("{name}@{version}")),
                    version,
                    classifier: Some("npm".to_owned()),
                    indirect,
                    labels: Vec::new(),
                    file_uri_prefix: None,
                });
            }
        }
        if dependencies.is_empty() {
            return DependencyMap::new();
        }
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        let uri = format!("file://{}", normalize_path(&manifest.to_string_lossy()));
        DependencyMap::from([(uri, dependencies)])
    }
}
