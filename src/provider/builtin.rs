use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use globset::Glob;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::file_search::{normalize_path, FileSearcher};

use super::{
    Capability, DependencyDagMap, DependencyMap, EvaluateResponse, FileChange, Incident,
    InitConfig, InitResult, Provider, ProviderError,
};

pub const BUILTIN_PROVIDER_NAME: &str = "builtin";

pub const CAP_FILE: &str = "file";
pub const CAP_FILECONTENT: &str = "filecontent";
pub const CAP_HAS_TAGS: &str = "hasTags";

/// Tags collected from matched rules, visible to later `hasTags` queries.
#[derive(Clone, Default)]
pub struct TagStore {
    tags: Arc<RwLock<BTreeSet<String>>>,
}

impl TagStore {
    pub fn insert(&self, tag: impl Into<String>) {
        self.tags.write().insert(tag.into());
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.read().contains(tag)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.tags.read().clone()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileContentPayload {
    pattern: String,
    #[serde(default)]
    file_pattern: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePayload {
    pattern: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HasTagsPayload {
    tags: Vec<String>,
}

/// The in-process provider: regex and filename queries over the configured
/// locations, plus tag lookups. It also absorbs the extra init configs other
/// providers return from their own `init`.
pub struct BuiltinProvider {
    configs: RwLock<Vec<InitConfig>>,
    tags: TagStore,
}

impl BuiltinProvider {
    pub fn new(tags: TagStore) -> Self {
        Self {
            configs: RwLock::new(Vec::new()),
            tags,
        }
    }

    pub fn absorb_configs(&self, configs: Vec<InitConfig>) {
        if !configs.is_empty() {
            debug!(count = configs.len(), "absorbing extra init configs");
            self.configs.write().extend(configs);
        }
    }

    fn locations(&self) -> Vec<String> {
        self.configs
            .read()
            .iter()
            .map(|config| config.location.clone())
            .collect()
    }

    #[instrument(skip_all)]
    fn evaluate_filecontent(
        &self,
        cancel: &CancellationToken,
        payload: FileContentPayload,
    ) -> Result<EvaluateResponse, ProviderError> {
        let pattern = Regex::new(&payload.pattern)
            .map_err(|error| ProviderError::Evaluation(format!("bad pattern: {error}")))?;
        let file_filter = payload
            .file_pattern
            .as_deref()
            .map(compile_file_filter)
            .transpose()?;

        let mut incidents = Vec::new();
        for location in self.locations() {
            let files = FileSearcher::new(&location)
                .search(None)
                .map_err(|error| ProviderError::Evaluation(error.to_string()))?;
            for file in files {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                if let Some(filter) = &file_filter {
                    if !filter.matches(&normalize_path(&file.to_string_lossy())) {
                        continue;
                    }
                }
                let Ok(content) = std::fs::read_to_string(&file) else {
                    // binary or unreadable files are not an error here
                    continue;
                };
                scan_lines(&pattern, &file, &content, &mut incidents);
            }
        }

        Ok(EvaluateResponse {
            matched: !incidents.is_empty(),
            incidents,
            template_context: Map::new(),
        })
    }

    fn evaluate_file(
        &self,
        cancel: &CancellationToken,
        payload: FilePayload,
    ) -> Result<EvaluateResponse, ProviderError> {
        let filter = compile_file_filter(&payload.pattern)?;
        let mut incidents = Vec::new();
        let mut matched_paths = Vec::new();
        for location in self.locations() {
            let files = FileSearcher::new(&location)
                .search(None)
                .map_err(|error| ProviderError::Evaluation(error.to_string()))?;
            for file in files {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                let normalized = normalize_path(&file.to_string_lossy());
                if filter.matches(&normalized) {
                    incidents.push(Incident {
                        file_uri: format!("file://{normalized}"),
                        ..Default::default()
                    });
                    matched_paths.push(Value::String(normalized));
                }
            }
        }
        let mut template_context = Map::new();
        template_context.insert("filepaths".to_owned(), Value::Array(matched_paths));
        Ok(EvaluateResponse {
            matched: !incidents.is_empty(),
            incidents,
            template_context,
        })
    }

    fn evaluate_has_tags(&self, payload: HasTagsPayload) -> EvaluateResponse {
        let matched = !payload.tags.is_empty()
            && payload.tags.iter().all(|tag| self.tags.contains(tag));
        let mut template_context = Map::new();
        template_context.insert(
            "tags".to_owned(),
            Value::Array(payload.tags.into_iter().map(Value::String).collect()),
        );
        EvaluateResponse {
            matched,
            incidents: Vec::new(),
            template_context,
        }
    }
}

enum FileFilter {
    Glob(globset::GlobMatcher),
    Regex(Regex),
}

impl FileFilter {
    fn matches(&self, normalized_path: &str) -> bool {
        match self {
            FileFilter::Glob(glob) => glob.is_match(normalized_path),
            FileFilter::Regex(regex) => regex.is_match(normalized_path),
        }
    }
}

fn compile_file_filter(pattern: &str) -> Result<FileFilter, ProviderError> {
    if let Ok(glob) = Glob::new(pattern) {
        return Ok(FileFilter::Glob(glob.compile_matcher()));
    }
    Regex::new(pattern)
        .map(FileFilter::Regex)
        .map_err(|error| ProviderError::Evaluation(format!("bad file pattern: {error}")))
}

fn scan_lines(pattern: &Regex, file: &Path, content: &str, incidents: &mut Vec<Incident>) {
    let normalized = normalize_path(&file.to_string_lossy());
    for (index, line) in content.lines().enumerate() {
        for captures in pattern.captures_iter(line) {
            let mut variables = Map::new();
            variables.insert(
                "matchingText".to_owned(),
                Value::String(captures.get(0).map(|m| m.as_str()).unwrap_or(line).to_owned()),
            );
            for name in pattern.capture_names().flatten() {
                if let Some(capture) = captures.name(name) {
                    variables.insert(name.to_owned(), Value::String(capture.as_str().to_owned()));
                }
            }
            incidents.push(Incident {
                file_uri: format!("file://{normalized}"),
                line_number: Some(index as u32 + 1),
                variables,
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl Provider for BuiltinProvider {
    fn name(&self) -> &str {
        BUILTIN_PROVIDER_NAME
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::with_schema(
                CAP_FILE,
                json!({
                    "type": "object",
                    "required": ["pattern"],
                    "properties": {"pattern": {"type": "string"}},
                }),
            ),
            Capability::with_schema(
                CAP_FILECONTENT,
                json!({
                    "type": "object",
                    "required": ["pattern"],
                    "properties": {
                        "pattern": {"type": "string"},
                        "filePattern": {"type": "string"},
                    },
                }),
            ),
            Capability::with_schema(
                CAP_HAS_TAGS,
                json!({
                    "type": "object",
                    "required": ["tags"],
                    "properties": {"tags": {"type": "array", "items": {"type": "string"}}},
                }),
            ),
        ]
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        configs: Vec<InitConfig>,
    ) -> Result<InitResult, ProviderError> {
        *self.configs.write() = configs;
        Ok(InitResult::default())
    }

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        capability: &str,
        payload: Value,
    ) -> Result<EvaluateResponse, ProviderError> {
        fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ProviderError> {
            serde_json::from_value(payload)
                .map_err(|error| ProviderError::Evaluation(format!("bad payload: {error}")))
        }
        match capability {
            CAP_FILECONTENT => self.evaluate_filecontent(cancel, parse(payload)?),
            CAP_FILE => self.evaluate_file(cancel, parse(payload)?),
            CAP_HAS_TAGS => Ok(self.evaluate_has_tags(parse(payload)?)),
            other => Err(ProviderError::UnknownCapability {
                provider: BUILTIN_PROVIDER_NAME.to_owned(),
                capability: other.to_owned(),
            }),
        }
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

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    async fn provider_rooted_at(dir: &Path) -> BuiltinProvider {
        let provider = BuiltinProvider::new(TagStore::default());
        provider
            .init(
                &CancellationToken::new(),
                vec![InitConfig {
                    location: dir.display().to_string(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        provider
    }

    #[tokio::test]
    async fn filecontent_reports_line_numbers_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("app.js"),
            "const a = require('fs');\nconst b = require('http');\n",
        )
        .unwrap();
        let provider = provider_rooted_at(dir.path()).await;

        let response = provider
            .evaluate(
                &CancellationToken::new(),
                CAP_FILECONTENT,
                json!({"pattern": r"require\('(?P<module>\w+)'\)"}),
            )
            .await
            .unwrap();
        assert!(response.matched);
        assert_eq!(response.incidents.len(), 2);
        assert_eq!(response.incidents[0].line_number, Some(1));
        assert_eq!(
            response.incidents[1].variables["module"],
            json!("http")
        );
    }

    #[tokio::test]
    async fn file_matches_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("web.xml"), "").unwrap();
        fs::write(dir.path().join("app.js"), "").unwrap();
        let provider = provider_rooted_at(dir.path()).await;

        let response = provider
            .evaluate(
                &CancellationToken::new(),
                CAP_FILE,
                json!({"pattern": "**/*.xml"}),
            )
            .await
            .unwrap();
        assert!(response.matched);
        assert_eq!(response.incidents.len(), 1);
        assert!(response.incidents[0].file_uri.ends_with("web.xml"));
    }

    #[tokio::test]
    async fn has_tags_requires_every_tag() {
        let tags = TagStore::default();
        tags.insert("Spring");
        let provider = BuiltinProvider::new(tags);

        let hit = provider
            .evaluate(
                &CancellationToken::new(),
                CAP_HAS_TAGS,
                json!({"tags": ["Spring"]}),
            )
            .await
            .unwrap();
        assert!(hit.matched);

        let miss = provider
            .evaluate(
                &CancellationToken::new(),
                CAP_HAS_TAGS,
                json!({"tags": ["Spring", "Hibernate"]}),
            )
            .await
            .unwrap();
        assert!(!miss.matched);
    }
}
