use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use walkdir::WalkDir;

/// Include/exclude lists mixing literal paths and regex patterns, as they
/// appear in provider configs and rule scopes.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConstraints {
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
}

impl SearchConstraints {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("walk failed under {path:?}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
}

/// One constraint entry, matched three ways: normalized equality, descendant
/// of a directory entry, or compiled regex. Entries that do not compile as
/// regex simply lose the regex arm.
struct CompiledPattern {
    normalized: String,
    regex: Option<Regex>,
}

impl CompiledPattern {
    fn new(entry: &str) -> Self {
        Self {
            normalized: normalize_path(entry),
            regex: Regex::new(entry).ok(),
        }
    }

    fn matches(&self, normalized_path: &str) -> bool {
        if normalized_path == self.normalized
            || normalized_path.starts_with(&format!("{}/", self.normalized))
        {
            return true;
        }
        self.regex
            .as_ref()
            .map(|regex| regex.is_match(normalized_path))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct CompiledConstraints {
    include: Vec<CompiledPattern>,
    exclude: Vec<CompiledPattern>,
}

impl CompiledConstraints {
    fn new(constraints: &SearchConstraints) -> Self {
        Self {
            include: constraints.included.iter().map(|e| CompiledPattern::new(e)).collect(),
            exclude: constraints.excluded.iter().map(|e| CompiledPattern::new(e)).collect(),
        }
    }

    /// Empty include admits everything; exclude always wins.
    fn admits(&self, normalized_path: &str) -> bool {
        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|pattern| pattern.matches(normalized_path))
        {
            return false;
        }
        !self
            .exclude
            .iter()
            .any(|pattern| pattern.matches(normalized_path))
    }

    fn excludes(&self, normalized_path: &str) -> bool {
        self.exclude
            .iter()
            .any(|pattern| pattern.matches(normalized_path))
    }
}

/// Constraint engine over directory trees. Walks the base and any
/// additional paths, applies the provider-config and rule-scope constraint
/// sets plus optional per-condition filepaths, and returns a deduplicated,
/// sorted list of absolute paths.
pub struct FileSearcher {
    base: PathBuf,
    additional: Vec<PathBuf>,
    provider_constraints: CompiledConstraints,
    rule_constraints: CompiledConstraints,
    fail_fast: bool,
}

impl FileSearcher {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            additional: Vec::new(),
            provider_constraints: Default::default(),
            rule_constraints: Default::default(),
            fail_fast: false,
        }
    }

    pub fn with_additional_paths(
        mut self,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        self.additional.extend(paths);
        self
    }

    pub fn with_provider_constraints(mut self, constraints: &SearchConstraints) -> Self {
        self.provider_constraints = CompiledConstraints::new(constraints);
        self
    }

    pub fn with_rule_constraints(mut self, constraints: &SearchConstraints) -> Self {
        self.rule_constraints = CompiledConstraints::new(constraints);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[instrument(skip_all, fields(base = ?self.base))]
    pub fn search(
        &self,
        condition_filepaths: Option<&[String]>,
    ) -> Result<Vec<PathBuf>, SearchError> {
        let condition_patterns: Option<Vec<CompiledPattern>> = condition_filepaths
            .filter(|filepaths| !filepaths.is_empty())
            .map(|filepaths| filepaths.iter().map(|e| CompiledPattern::new(e)).collect());

        let mut results: BTreeSet<PathBuf> = BTreeSet::new();
        for root in std::iter::once(&self.base).chain(self.additional.iter()) {
            let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
                // prune excluded directories early
                !(entry.file_type().is_dir()
                    && {
                        let normalized = normalize_entry_path(entry.path());
                        self.provider_constraints.excludes(&normalized)
                            || self.rule_constraints.excludes(&normalized)
                    })
            });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(source) => {
                        if self.fail_fast {
                            return Err(SearchError::Walk {
                                path: root.clone(),
                                source,
                            });
                        }
                        warn!(root = ?root, %source, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let normalized = normalize_entry_path(entry.path());
                if !self.provider_constraints.admits(&normalized)
                    || !self.rule_constraints.admits(&normalized)
                {
                    continue;
                }
                if let Some(condition_patterns) = &condition_patterns {
                    let tail_match = condition_patterns.iter().any(|pattern| {
                        pattern.matches(&normalized)
                            || normalized.ends_with(&pattern.normalized)
                    });
                    if !tail_match {
                        continue;
                    }
                }
                results.insert(entry.into_path());
            }
        }
        Ok(results.into_iter().collect())
    }
}

fn normalize_entry_path(path: &Path) -> String {
    normalize_path(&path.to_string_lossy())
}

/// Normalize a path or file URI to a canonical comparable form: URI scheme
/// stripped, separators forward-slashed, `.`/`..` resolved lexically, and
/// case folded on case-insensitive platforms. Idempotent.
pub fn normalize_path(raw: &str) -> String {
    let mut stripped = raw;
    for prefix in ["file://", "file:"] {
        if let Some(rest) = stripped.strip_prefix(prefix) {
            stripped = rest;
            break;
        }
    }
    let forward = stripped.replace('\\', "/");

    let absolute = forward.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in forward.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().map_or(false, |last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            segment => segments.push(segment),
        }
    }
    let joined = segments.join("/");
    let normalized = if absolute {
        format!("/{joined}")
    } else {
        joined
    };

    if cfg!(windows) {
        normalized.to_lowercase()
    } else {
        normalized
    }
}
