use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::provider::{InitConfig, TransportKind};

/// One provider entry from the settings file: how to reach it and how to
/// initialize it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub init_config: Vec<InitConfig>,
}

impl ProviderConfig {
    /// Providers configured with an `lspServerPath` and no process of their
    /// own run in-process, wrapping the named language server directly.
    pub fn is_in_process_lsp(&self) -> bool {
        self.binary_path.is_none()
            && self.address.is_none()
            && self.init_config.iter().any(|config| {
                config
                    .provider_specific_config
                    .contains_key("lspServerPath")
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("couldn't read provider settings at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't parse provider settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid provider settings: {0}")]
    Invalid(String),
}

/// Load and sanity-check the provider settings document: a JSON list of
/// [`ProviderConfig`]. Invalid settings are fatal to the engine.
#[instrument]
pub fn load_provider_settings(path: &Path) -> Result<Vec<ProviderConfig>, SettingsError> {
    let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let configs: Vec<ProviderConfig> = serde_json::from_str(&contents)?;

    let mut seen = HashSet::new();
    for config in &configs {
        if config.name.is_empty() {
            return Err(SettingsError::Invalid("provider with empty name".to_owned()));
        }
        if !seen.insert(config.name.clone()) {
            return Err(SettingsError::Invalid(format!(
                "duplicate provider name {:?}",
                config.name
            )));
        }
        if config.binary_path.is_none()
            && config.address.is_none()
            && !config.is_in_process_lsp()
            && config.name != crate::provider::BUILTIN_PROVIDER_NAME
        {
            return Err(SettingsError::Invalid(format!(
                "provider {:?} has neither binaryPath, address, nor lspServerPath",
                config.name
            )));
        }
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_settings(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_a_minimal_settings_file() {
        let file = write_settings(
            r#"[
                {
                    "name": "nodejs",
                    "binaryPath": "/usr/local/bin/node-provider",
                    "initConfig": [{"location": "/work/app", "analysisMode": "full"}]
                },
                {
                    "name": "java",
                    "address": "http://127.0.0.1:9000",
                    "transport": "grpc",
                    "initConfig": [{"location": "/work/app"}]
                }
            ]"#,
        );
        let configs = load_provider_settings(file.path()).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "nodejs");
        assert_eq!(configs[1].transport, TransportKind::Grpc);
        assert_eq!(configs[0].init_config[0].location, "/work/app");
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let file = write_settings(
            r#"[
                {"name": "go", "binaryPath": "/bin/a"},
                {"name": "go", "binaryPath": "/bin/b"}
            ]"#,
        );
        let err = load_provider_settings(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn rejects_unreachable_provider() {
        let file = write_settings(r#"[{"name": "go"}]"#);
        assert!(load_provider_settings(file.path()).is_err());
    }
}
