use handlebars::Handlebars;
use serde_json::{Map, Value};
use tracing::debug;

/// Renders rule message templates and chain payloads against accumulated
/// template context, `{{alias.field}}` style.
pub struct TemplateRenderer {
    registry: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }
}

impl TemplateRenderer {
    pub fn render(
        &self,
        template: &str,
        context: &Map<String, Value>,
    ) -> Result<String, handlebars::RenderError> {
        if !template.contains("{{") {
            return Ok(template.to_owned());
        }
        self.registry
            .render_template(template, &Value::Object(context.clone()))
    }

    /// Substitute template expressions in every string of a payload. A
    /// string that fails to render is passed through untouched; the
    /// provider sees the raw expression and can reject it itself.
    pub fn render_payload(&self, payload: &Value, context: &Map<String, Value>) -> Value {
        match payload {
            Value::String(text) => match self.render(text, context) {
                Ok(rendered) => Value::String(rendered),
                Err(error) => {
                    debug!(%error, template = text, "payload render failed");
                    Value::String(text.clone())
                }
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_payload(item, context))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), self.render_payload(value, context)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn context_with(alias: &str, fields: Value) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert(alias.to_owned(), fields);
        context
    }

    #[test]
    fn renders_dotted_paths() {
        let renderer = TemplateRenderer::default();
        let context = context_with("pkg", json!({"name": "pg", "version": "8.1.0"}));
        assert_eq!(
            renderer
                .render("Found {{pkg.name}}@{{pkg.version}}", &context)
                .unwrap(),
            "Found pg@8.1.0"
        );
    }

    #[test]
    fn payload_strings_are_substituted_recursively() {
        let renderer = TemplateRenderer::default();
        let context = context_with("pool", json!({"name": "createPool"}));
        let payload = json!({
            "pattern": "{{pool.name}}",
            "filepaths": ["src/{{pool.name}}.ts"],
            "depth": 2,
        });
        assert_eq!(
            renderer.render_payload(&payload, &context),
            json!({
                "pattern": "createPool",
                "filepaths": ["src/createPool.ts"],
                "depth": 2,
            })
        );
    }

    #[test]
    fn template_free_strings_pass_straight_through() {
        let renderer = TemplateRenderer::default();
        assert_eq!(
            renderer.render("no placeholders here", &Map::new()).unwrap(),
            "no placeholders here"
        );
    }
}
