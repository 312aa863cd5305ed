//! Admin-owned policy data.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directive::Directive;

/// Global CSP switches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicySettings {
    pub is_enabled: bool,
    pub is_report_only: bool,
    pub is_allow_list_enabled: bool,
    pub allow_list_url: Option<String>,
    pub is_upgrade_insecure_requests_enabled: bool,
    pub is_nonce_enabled: bool,
    pub is_strict_dynamic_enabled: bool,
    pub modified: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
}

impl PolicySettings {
    /// Settings with the policy switched on and everything else at defaults.
    pub fn enabled() -> Self {
        Self {
            is_enabled: true,
            ..Self::default()
        }
    }

    /// The allow-list URL, only when the feature is switched on and configured.
    pub fn active_allow_list_url(&self) -> Option<&str> {
        if !self.is_allow_list_enabled {
            return None;
        }
        self.allow_list_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

/// A source and the directives it is permitted under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub source: String,
    pub directives: BTreeSet<Directive>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_by: Option<String>,
}

impl PermissionRule {
    /// Create a rule with a fresh identifier.
    pub fn new(source: impl Into<String>, directives: impl IntoIterator<Item = Directive>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            directives: directives.into_iter().collect(),
            modified: None,
            modified_by: None,
        }
    }

    /// Check if this rule grants the given directive.
    pub fn grants(&self, directive: Directive) -> bool {
        self.directives.contains(&directive)
    }

    /// Union a directive into the rule. Returns `true` if the rule changed.
    pub fn grant(&mut self, directive: Directive) -> bool {
        self.directives.insert(directive)
    }

    /// Whether this rule is for the given source, ignoring ASCII case.
    pub fn is_for_source(&self, source: &str) -> bool {
        self.source.eq_ignore_ascii_case(source)
    }

    /// Stamp the audit fields.
    pub fn touch(&mut self, modified_by: &str) {
        self.modified = Some(Utc::now());
        self.modified_by = Some(modified_by.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_allow_list_url() {
        let mut settings = PolicySettings::enabled();
        settings.allow_list_url = Some("https://lists.example.com/allow.json".to_string());
        assert_eq!(settings.active_allow_list_url(), None);

        settings.is_allow_list_enabled = true;
        assert_eq!(
            settings.active_allow_list_url(),
            Some("https://lists.example.com/allow.json")
        );

        settings.allow_list_url = Some("  ".to_string());
        assert_eq!(settings.active_allow_list_url(), None);
    }

    #[test]
    fn test_grant_is_union() {
        let mut rule = PermissionRule::new("https://cdn.example.com", [Directive::ScriptSrc]);
        assert!(!rule.grant(Directive::ScriptSrc));
        assert!(rule.grant(Directive::StyleSrc));
        assert_eq!(rule.directives.len(), 2);
        assert!(rule.is_for_source("HTTPS://CDN.EXAMPLE.COM"));
    }

    #[test]
    fn test_rule_deserialize_without_id() {
        let rule: PermissionRule =
            serde_json::from_str(r#"{"source":"self","directives":["default-src"]}"#).unwrap();
        assert!(rule.grants(Directive::DefaultSrc));
        assert!(rule.modified.is_none());
    }
}
