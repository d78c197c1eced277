use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::EngineOptions;
use crate::file_search::normalize_path;
use crate::output::incident_order;
use crate::provider::Incident;
use crate::rule::{LabelSelector, Rule};

/// Post-processing for a matched rule's incidents: location-prefix filter,
/// incident selector, custom-variable extraction, dedup, cap, snippets.
pub struct IncidentPostProcessor<'a> {
    options: &'a EngineOptions,
    selector: Option<&'a LabelSelector>,
    normalized_prefixes: Vec<String>,
}

impl<'a> IncidentPostProcessor<'a> {
    pub fn new(options: &'a EngineOptions, selector: Option<&'a LabelSelector>) -> Self {
        Self {
            options,
            selector,
            normalized_prefixes: options
                .location_prefixes
                .iter()
                .map(|prefix| normalize_path(prefix))
                .collect(),
        }
    }

    pub fn process(&self, rule: &Rule, mut incidents: Vec<Incident>) -> Vec<Incident> {
        incidents.retain(|incident| self.within_configured_locations(incident));
        if let Some(selector) = self.selector {
            incidents.retain(|incident| selector.matches_variables(&incident.variables));
        }
        for incident in &mut incidents {
            apply_custom_variables(rule, incident);
        }
        incidents.sort_by(incident_order);
        let mut incidents = dedup(incidents);
        if let Some(limit) = self.options.incident_limit {
            incidents.truncate(limit);
        }
        for incident in &mut incidents {
            attach_code_snip(incident, self.options.context_lines);
        }
        incidents
    }

    /// Incidents outside the configured provider locations are discarded.
    /// No configured prefixes means no filtering.
    fn within_configured_locations(&self, incident: &Incident) -> bool {
        if self.normalized_prefixes.is_empty() {
            return true;
        }
        let normalized = normalize_path(&incident.file_uri);
        self.normalized_prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
    }
}

/// Dedup by the canonical (URI, line, variables) JSON fingerprint. Running
/// it twice is the same as running it once.
pub fn dedup(incidents: Vec<Incident>) -> Vec<Incident> {
    let mut seen: HashSet<String> = HashSet::new();
    incidents
        .into_iter()
        .filter(|incident| seen.insert(fingerprint(incident)))
        .collect()
}

fn fingerprint(incident: &Incident) -> String {
    // serde_json maps order keys deterministically, making this canonical
    json!({
        "uri": normalize_path(&incident.file_uri),
        "line": incident.line_number,
        "variables": incident.variables,
    })
    .to_string()
}

/// Evaluate the rule's custom variables against the incident's matched
/// text, falling back to declared defaults.
fn apply_custom_variables(rule: &Rule, incident: &mut Incident) {
    if rule.custom_variables.is_empty() {
        return;
    }
    let matched_text = incident
        .variables
        .get("matchingText")
        .and_then(Value::as_str)
        .map(str::to_owned);
    for custom in &rule.custom_variables {
        let extracted = matched_text.as_deref().and_then(|text| {
            let pattern = Regex::new(&custom.pattern).ok()?;
            let captures = pattern.captures(text)?;
            captures
                .name(&custom.name)
                .or_else(|| captures.get(1))
                .map(|capture| capture.as_str().trim().to_owned())
        });
        let value = extracted.or_else(|| custom.default_value.clone());
        if let Some(value) = value {
            incident
                .variables
                .insert(custom.name.clone(), Value::String(value));
        }
    }
}

/// Surrounding source lines, when the file is readable; failures leave the
/// snippet empty and the incident intact.
fn attach_code_snip(incident: &mut Incident, context_lines: usize) {
    let Some(line_number) = incident.line_number else {
        return;
    };
    let path = normalize_path(&incident.file_uri);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(error) => {
            debug!(%path, %error, "snippet source unreadable");
            return;
        }
    };
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return;
    }
    // line numbers are 1-based in incidents
    let target = (line_number.max(1) as usize - 1).min(lines.len() - 1);
    let start = target.saturating_sub(context_lines);
    let end = (target + context_lines).min(lines.len() - 1);

    let width = (end + 1).to_string().len();
    let mut snippet = String::new();
    for (offset, line) in lines[start..=end].iter().enumerate() {
        let number = start + offset + 1;
        let marker = if number == target + 1 { ">" } else { " " };
        snippet.push_str(&format!("{marker}{number:>width$}  {line}\n"));
    }
    incident.code_snip = Some(snippet);
}

pub fn warn_on_oversized_result(rule_id: &str, kept: usize, produced: usize) {
    if produced > kept {
        warn!(
            rule = rule_id,
            produced,
            kept,
            "incident limit trimmed results"
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    use crate::rule::CustomVariable;

    use super::*;

    fn incident_at(uri: &str, line: u32, variables: Map<String, Value>) -> Incident {
        Incident {
            file_uri: uri.to_owned(),
            line_number: Some(line),
            variables,
            ..Default::default()
        }
    }

    fn bare_rule() -> Rule {
        Rule {
            id: "r".to_owned(),
            description: None,
            category: None,
            effort: None,
            labels: vec![],
            message: None,
            tags: vec![],
            links: vec![],
            custom_variables: vec![],
            when: crate::rule::ConditionEntry::leaf("builtin", "file", json!({"pattern": "x"})),
        }
    }

    #[test]
    fn dedup_is_idempotent() {
        let incidents = vec![
            incident_at("file:///a.ts", 3, Map::new()),
            incident_at("file:///a.ts", 3, Map::new()),
            incident_at("file:///a.ts", 4, Map::new()),
        ];
        let once = dedup(incidents);
        assert_eq!(once.len(), 2);
        let twice = dedup(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn uri_scheme_does_not_defeat_dedup() {
        let incidents = vec![
            incident_at("file:///work/a.ts", 3, Map::new()),
            incident_at("/work/a.ts", 3, Map::new()),
        ];
        assert_eq!(dedup(incidents).len(), 1);
    }

    #[test]
    fn prefix_filter_discards_foreign_locations() {
        let options = EngineOptions {
            location_prefixes: vec!["/work/app".to_owned()],
            ..Default::default()
        };
        let processor = IncidentPostProcessor::new(&options, None);
        let kept = processor.process(
            &bare_rule(),
            vec![
                incident_at("file:///work/app/src/a.ts", 1, Map::new()),
                incident_at("file:///elsewhere/b.ts", 1, Map::new()),
            ],
        );
        assert_eq!(kept.len(), 1);
        assert!(kept[0].file_uri.contains("/work/app/"));
    }

    #[test]
    fn incident_cap_keeps_the_lowest_positions() {
        let options = EngineOptions {
            incident_limit: Some(3),
            ..Default::default()
        };
        let processor = IncidentPostProcessor::new(&options, None);
        let incidents = (1..=7)
            .rev()
            .map(|line| incident_at("file:///a.ts", line, Map::new()))
            .collect();
        let kept = processor.process(&bare_rule(), incidents);
        assert_eq!(
            kept.iter().map(|i| i.line_number.unwrap()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn incident_selector_filters_on_variables() {
        let options = EngineOptions::default();
        let selector = LabelSelector::parse("package=fs").unwrap();
        let processor = IncidentPostProcessor::new(&options, Some(&selector));
        let mut matching = Map::new();
        matching.insert("package".to_owned(), Value::String("fs".to_owned()));
        let mut other = Map::new();
        other.insert("package".to_owned(), Value::String("http".to_owned()));
        let kept = processor.process(
            &bare_rule(),
            vec![
                incident_at("file:///a.ts", 1, matching),
                incident_at("file:///a.ts", 2, other),
            ],
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].line_number, Some(1));
    }

    #[test]
    fn custom_variables_extract_from_matched_text() {
        let mut rule = bare_rule();
        rule.custom_variables = vec![CustomVariable {
            name: "module".to_owned(),
            pattern: r"require\('(?P<module>\w+)'\)".to_owned(),
            default_value: Some("unknown".to_owned()),
        }];
        let options = EngineOptions::default();
        let processor = IncidentPostProcessor::new(&options, None);

        let mut variables = Map::new();
        variables.insert(
            "matchingText".to_owned(),
            Value::String("require('http')".to_owned()),
        );
        let kept = processor.process(
            &rule,
            vec![
                incident_at("file:///a.ts", 1, variables),
                incident_at("file:///a.ts", 2, Map::new()),
            ],
        );
        assert_eq!(kept[0].variables["module"], json!("http"));
        // no matched text falls back to the default
        assert_eq!(kept[1].variables["module"], json!("unknown"));
    }

    #[test]
    fn snippets_mark_the_incident_line() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "one\ntwo\nthree\nfour\nfive\n").unwrap();
        let options = EngineOptions {
            context_lines: 1,
            ..Default::default()
        };
        let processor = IncidentPostProcessor::new(&options, None);
        let kept = processor.process(
            &bare_rule(),
            vec![incident_at(
                &format!("file://{}", file.display()),
                3,
                Map::new(),
            )],
        );
        let snippet = kept[0].code_snip.as_ref().unwrap();
        assert!(snippet.contains(">3  three"));
        assert!(snippet.contains(" 2  two"));
        assert!(snippet.contains(" 4  four"));
    }
}
