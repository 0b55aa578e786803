use std::collections::HashMap;

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::DiagnosticSeverity;

use crate::loopdata::PrefixStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Ignore,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleSettings {
    pub severity: Option<SeverityLevel>,
    /// Per-code exclusion globs, matched against the document URI.
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationSettings {
    pub enabled: bool,
    /// Glob patterns matched against the document URI; matching documents
    /// are excluded from validation entirely.
    pub excluded: Vec<String>,
    /// Per-diagnostic-code overrides, keyed by error code.
    #[serde(flatten)]
    pub rules: HashMap<String, RuleSettings>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded: Vec::new(),
            rules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuteSettings {
    pub validation: ValidationSettings,
    /// One of `none`, `<alias_>`, `<alias?>`, or a literal prefix.
    pub iteration_metadata_prefix: String,
}

impl Default for QuteSettings {
    fn default() -> Self {
        Self {
            validation: ValidationSettings::default(),
            iteration_metadata_prefix: "<alias_>".to_string(),
        }
    }
}

impl QuteSettings {
    /// Accepts either the settings object directly or wrapped under a
    /// `qute` key, as editors send both shapes. Malformed payloads fall
    /// back to defaults.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let value = value.get("qute").unwrap_or(value);
        match serde_json::from_value(value.clone()) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("ignoring malformed qute settings: {err}");
                QuteSettings::default()
            }
        }
    }

    pub fn prefix_strategy(&self) -> PrefixStrategy {
        PrefixStrategy::from_setting(&self.iteration_metadata_prefix)
    }

    /// The effective severity for a diagnostic code on a document, or
    /// `None` when the diagnostic is suppressed.
    pub fn severity_for(&self, code: &str, uri: &str) -> Option<DiagnosticSeverity> {
        if !self.validation.enabled {
            return None;
        }
        if self
            .validation
            .excluded
            .iter()
            .any(|glob| glob_matches(glob, uri))
        {
            return None;
        }
        let rule = self.validation.rules.get(code);
        if let Some(rule) = rule {
            if rule.excluded.iter().any(|glob| glob_matches(glob, uri)) {
                return None;
            }
        }
        let level = rule
            .and_then(|rule| rule.severity)
            .unwrap_or_else(|| default_severity(code));
        match level {
            SeverityLevel::Ignore => None,
            SeverityLevel::Warning => Some(DiagnosticSeverity::WARNING),
            SeverityLevel::Error => Some(DiagnosticSeverity::ERROR),
        }
    }
}

fn default_severity(code: &str) -> SeverityLevel {
    match code {
        "unknown-section-tag" | "unknown-object" | "duplicate-parameter" => SeverityLevel::Warning,
        _ => SeverityLevel::Error,
    }
}

/// Minimal glob matching: `**` crosses path separators, `*` stays within a
/// segment, `?` matches one character.
fn glob_matches(glob: &str, uri: &str) -> bool {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    match Regex::new(&pattern) {
        // Globs usually name a path suffix; accept a match anywhere at a
        // path boundary as well as a full match.
        Ok(regex) => {
            regex.is_match(uri)
                || uri
                    .rsplit_once('/')
                    .map(|_| {
                        uri.match_indices('/').any(|(idx, _)| {
                            regex.is_match(&uri[idx + 1..])
                        })
                    })
                    .unwrap_or(false)
        }
        Err(err) => {
            warn!("invalid exclusion glob `{glob}`: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let settings = QuteSettings::default();
        assert!(settings.validation.enabled);
        assert_eq!(settings.iteration_metadata_prefix, "<alias_>");
        assert_eq!(
            settings.severity_for("unknown-property", "file:///t.html"),
            Some(DiagnosticSeverity::ERROR)
        );
        assert_eq!(
            settings.severity_for("unknown-section-tag", "file:///t.html"),
            Some(DiagnosticSeverity::WARNING)
        );
    }

    #[test]
    fn severity_override_and_disable() {
        let settings = QuteSettings::from_json(&json!({
            "qute": {
                "validation": {
                    "unknown-property": { "severity": "warning" },
                    "unknown-section-tag": { "severity": "ignore" }
                }
            }
        }));
        assert_eq!(
            settings.severity_for("unknown-property", "file:///t.html"),
            Some(DiagnosticSeverity::WARNING)
        );
        assert_eq!(
            settings.severity_for("unknown-section-tag", "file:///t.html"),
            None
        );

        let disabled = QuteSettings::from_json(&json!({
            "validation": { "enabled": false }
        }));
        assert_eq!(
            disabled.severity_for("unknown-property", "file:///t.html"),
            None
        );
    }

    #[test]
    fn excluded_globs_suppress_documents() {
        let settings = QuteSettings::from_json(&json!({
            "validation": { "excluded": ["**/generated/*.html"] }
        }));
        assert_eq!(
            settings.severity_for(
                "unknown-property",
                "file:///project/generated/index.html"
            ),
            None
        );
        assert_eq!(
            settings.severity_for("unknown-property", "file:///project/src/index.html"),
            Some(DiagnosticSeverity::ERROR)
        );
    }

    #[test]
    fn per_code_exclusions_are_independent() {
        let settings = QuteSettings::from_json(&json!({
            "validation": {
                "unknown-object": { "excluded": ["**/drafts/*.html"] }
            }
        }));
        assert_eq!(
            settings.severity_for("unknown-object", "file:///p/drafts/a.html"),
            None
        );
        // Other codes still apply to the excluded document.
        assert_eq!(
            settings.severity_for("unknown-property", "file:///p/drafts/a.html"),
            Some(DiagnosticSeverity::ERROR)
        );
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        assert!(glob_matches("*.html", "page.html"));
        assert!(!glob_matches("*.html", "a/b/page.css"));
        assert!(glob_matches("**/page.html", "file:///a/b/page.html"));
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let settings = QuteSettings::from_json(&json!({ "validation": "nope" }));
        assert_eq!(settings, QuteSettings::default());
    }
}
