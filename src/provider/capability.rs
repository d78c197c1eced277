use std::collections::HashMap;

use jsonschema::JSONSchema;
use serde_json::Value;

use super::{Capability, ProviderError};

struct CompiledCapability {
    capability: Capability,
    schema: Option<JSONSchema>,
}

/// Static dispatch surface for `provider.capability` condition leaves. Every
/// provider registers its advertised capability list once, after startup;
/// payloads are validated against the advertised input schema before any
/// call goes over the wire.
#[derive(Default)]
pub struct CapabilityRegistry {
    providers: HashMap<String, Vec<CompiledCapability>>,
    assume_works: HashMap<String, bool>,
}

impl CapabilityRegistry {
    pub fn register(
        &mut self,
        provider: &str,
        capabilities: Vec<Capability>,
    ) -> Result<(), ProviderError> {
        let mut compiled = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let schema = match &capability.input_schema {
                Some(schema) => Some(JSONSchema::compile(schema).map_err(|error| {
                    ProviderError::Startup(format!(
                        "capability {:?} has an uncompilable input schema: {error}",
                        capability.name
                    ))
                })?),
                None => None,
            };
            compiled.push(CompiledCapability { capability, schema });
        }
        self.providers.insert(provider.to_owned(), compiled);
        Ok(())
    }

    /// A pre-established channel registered this way reports every
    /// capability as supported; misuse surfaces at call time instead.
    pub fn register_assume_works(&mut self, provider: &str) {
        self.assume_works.insert(provider.to_owned(), true);
    }

    pub fn knows_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider) || self.assume_works.contains_key(provider)
    }

    pub fn has(&self, provider: &str, capability: &str) -> bool {
        if self.assume_works.contains_key(provider) {
            return true;
        }
        self.providers
            .get(provider)
            .map(|capabilities| {
                capabilities
                    .iter()
                    .any(|compiled| compiled.capability.name == capability)
            })
            .unwrap_or(false)
    }

    pub fn capabilities(&self, provider: &str) -> Vec<&Capability> {
        self.providers
            .get(provider)
            .map(|capabilities| {
                capabilities
                    .iter()
                    .map(|compiled| &compiled.capability)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn validate_payload(
        &self,
        provider: &str,
        capability: &str,
        payload: &Value,
    ) -> Result<(), ProviderError> {
        if self.assume_works.contains_key(provider) {
            return Ok(());
        }
        let compiled = self
            .providers
            .get(provider)
            .and_then(|capabilities| {
                capabilities
                    .iter()
                    .find(|compiled| compiled.capability.name == capability)
            })
            .ok_or_else(|| ProviderError::UnknownCapability {
                provider: provider.to_owned(),
                capability: capability.to_owned(),
            })?;
        if let Some(schema) = &compiled.schema {
            if let Err(errors) = schema.validate(payload) {
                let reason = errors
                    .map(|error| error.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ProviderError::InvalidPayload {
                    capability: capability.to_owned(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry_with_pattern_schema() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::default();
        registry
            .register(
                "nodejs",
                vec![Capability::with_schema(
                    "referenced",
                    json!({
                        "type": "object",
                        "required": ["pattern"],
                        "properties": {"pattern": {"type": "string"}},
                    }),
                )],
            )
            .unwrap();
        registry
    }

    #[test]
    fn validates_payload_against_input_schema() {
        let registry = registry_with_pattern_schema();
        assert!(registry
            .validate_payload("nodejs", "referenced", &json!({"pattern": "Foo"}))
            .is_ok());
        let err = registry
            .validate_payload("nodejs", "referenced", &json!({"pattern": 7}))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidPayload { .. }));
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let registry = registry_with_pattern_schema();
        assert!(!registry.has("nodejs", "dependency"));
        let err = registry
            .validate_payload("nodejs", "dependency", &json!({}))
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownCapability { .. }));
    }

    #[test]
    fn assume_works_advertises_everything() {
        let mut registry = CapabilityRegistry::default();
        registry.register_assume_works("preopened");
        assert!(registry.has("preopened", "anything-at-all"));
        assert!(registry
            .validate_payload("preopened", "anything-at-all", &json!({}))
            .is_ok());
    }
}
