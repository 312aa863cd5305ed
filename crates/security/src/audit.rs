//! Append-only trail of policy changes.
//!
//! Every committed write to admin-owned data produces one [`AuditEntry`]
//! listing the fields whose values changed, with the acting user and time.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SecurityResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::headers::SecurityHeaderSettings;
use crate::policy::{PermissionRule, PolicySettings};
use crate::sandbox::SandboxSettings;

/// What happened to the audited record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOperation {
    Added,
    Modified,
    Deleted,
}

/// One field's transition. `None` means the field did not exist on that side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub record_type: String,
    pub identifier: String,
    pub operation: AuditOperation,
    pub changes: Vec<AuditChange>,
    pub timestamp: DateTime<Utc>,
}

/// A record whose changes are audited.
pub trait Auditable {
    const RECORD_TYPE: &'static str;

    /// Human-readable key of this record within its type.
    fn audit_identifier(&self) -> String;

    /// The audited fields and their rendered values. Modification stamps are excluded.
    fn audit_fields(&self) -> Vec<(&'static str, String)>;
}

impl AuditEntry {
    /// Describe the transition from `old` to `new`.
    ///
    /// `None` when both sides are absent or no audited field changed.
    pub fn diff<T: Auditable>(actor: &str, old: Option<&T>, new: Option<&T>) -> Option<Self> {
        let (operation, identifier) = match (old, new) {
            (None, None) => return None,
            (None, Some(n)) => (AuditOperation::Added, n.audit_identifier()),
            (Some(o), None) => (AuditOperation::Deleted, o.audit_identifier()),
            (Some(_), Some(n)) => (AuditOperation::Modified, n.audit_identifier()),
        };

        let before: BTreeMap<_, _> = old.map(|o| o.audit_fields()).unwrap_or_default().into_iter().collect();
        let after: BTreeMap<_, _> = new.map(|n| n.audit_fields()).unwrap_or_default().into_iter().collect();

        let changes: Vec<AuditChange> = before
            .keys()
            .chain(after.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|field| {
                let old_value = before.get(field).cloned();
                let new_value = after.get(field).cloned();
                (old_value != new_value).then(|| AuditChange {
                    field: field.to_string(),
                    old_value,
                    new_value,
                })
            })
            .collect();

        if changes.is_empty() {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4(),
            actor: actor.to_string(),
            record_type: T::RECORD_TYPE.to_string(),
            identifier,
            operation,
            changes,
            timestamp: Utc::now(),
        })
    }
}

/// Where audit entries are kept.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> SecurityResult<()>;

    /// The newest `limit` entries, newest first.
    async fn recent(&self, limit: usize) -> SecurityResult<Vec<AuditEntry>>;
}

/// Process-local audit log. The oldest entries are dropped past `capacity`.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> SecurityResult<()> {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> SecurityResult<Vec<AuditEntry>> {
        Ok(self.entries.read().iter().rev().take(limit).cloned().collect())
    }
}

fn flag(value: bool) -> String {
    value.to_string()
}

impl Auditable for PolicySettings {
    const RECORD_TYPE: &'static str = "CSP Settings";

    fn audit_identifier(&self) -> String {
        "settings".to_string()
    }

    fn audit_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("is_enabled", flag(self.is_enabled)),
            ("is_report_only", flag(self.is_report_only)),
            ("is_allow_list_enabled", flag(self.is_allow_list_enabled)),
            ("allow_list_url", self.allow_list_url.clone().unwrap_or_default()),
            ("is_upgrade_insecure_requests_enabled", flag(self.is_upgrade_insecure_requests_enabled)),
            ("is_nonce_enabled", flag(self.is_nonce_enabled)),
            ("is_strict_dynamic_enabled", flag(self.is_strict_dynamic_enabled)),
        ]
    }
}

impl Auditable for PermissionRule {
    const RECORD_TYPE: &'static str = "CSP Source";

    fn audit_identifier(&self) -> String {
        self.source.clone()
    }

    fn audit_fields(&self) -> Vec<(&'static str, String)> {
        let directives: Vec<String> = self.directives.iter().map(|d| d.to_string()).collect();
        vec![("source", self.source.clone()), ("directives", directives.join(","))]
    }
}

impl Auditable for SecurityHeaderSettings {
    const RECORD_TYPE: &'static str = "Security Headers";

    fn audit_identifier(&self) -> String {
        "headers".to_string()
    }

    fn audit_fields(&self) -> Vec<(&'static str, String)> {
        let literal = |value: Option<&'static str>| value.unwrap_or("none").to_string();
        vec![
            ("x_content_type_options", literal(self.x_content_type_options.header_value())),
            ("xss_protection", literal(self.xss_protection.header_value())),
            ("x_frame_options", literal(self.x_frame_options.header_value())),
            ("referrer_policy", literal(self.referrer_policy.header_value())),
            ("cross_origin_embedder_policy", literal(self.cross_origin_embedder_policy.header_value())),
            ("cross_origin_opener_policy", literal(self.cross_origin_opener_policy.header_value())),
            ("cross_origin_resource_policy", literal(self.cross_origin_resource_policy.header_value())),
            ("is_strict_transport_security_enabled", flag(self.is_strict_transport_security_enabled)),
            (
                "is_strict_transport_security_sub_domains_enabled",
                flag(self.is_strict_transport_security_sub_domains_enabled),
            ),
            ("strict_transport_security_max_age", self.strict_transport_security_max_age.to_string()),
        ]
    }
}

impl Auditable for SandboxSettings {
    const RECORD_TYPE: &'static str = "CSP Sandbox";

    fn audit_identifier(&self) -> String {
        "sandbox".to_string()
    }

    fn audit_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("is_sandbox_enabled", flag(self.is_sandbox_enabled)),
            ("flags", self.flags.tokens().join(" ")),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Directive;

    fn change<'a>(entry: &'a AuditEntry, field: &str) -> Option<&'a AuditChange> {
        entry.changes.iter().find(|c| c.field == field)
    }

    #[test]
    fn test_added_rule_lists_every_field() {
        let rule = PermissionRule::new("https://cdn.example.com", [Directive::ScriptSrc, Directive::ImgSrc]);
        let entry = AuditEntry::diff("admin", None, Some(&rule)).unwrap();

        assert_eq!(entry.operation, AuditOperation::Added);
        assert_eq!(entry.record_type, "CSP Source");
        assert_eq!(entry.identifier, "https://cdn.example.com");
        assert_eq!(entry.actor, "admin");
        let directives = change(&entry, "directives").unwrap();
        assert_eq!(directives.old_value, None);
        assert_eq!(directives.new_value.as_deref(), Some("img-src,script-src"));
    }

    #[test]
    fn test_modified_lists_only_changed_fields() {
        let old = PolicySettings::default();
        let mut new = PolicySettings::enabled();
        new.modified = Some(Utc::now());
        new.modified_by = Some("admin".to_string());

        let entry = AuditEntry::diff("admin", Some(&old), Some(&new)).unwrap();
        assert_eq!(entry.operation, AuditOperation::Modified);
        assert_eq!(entry.changes.len(), 1);
        let enabled = change(&entry, "is_enabled").unwrap();
        assert_eq!(enabled.old_value.as_deref(), Some("false"));
        assert_eq!(enabled.new_value.as_deref(), Some("true"));
    }

    #[test]
    fn test_unchanged_record_is_not_audited() {
        let mut rule = PermissionRule::new("https://cdn.example.com", [Directive::ScriptSrc]);
        let before = rule.clone();
        rule.touch("someone-else");

        assert!(AuditEntry::diff("admin", Some(&before), Some(&rule)).is_none());
        assert!(AuditEntry::diff::<PermissionRule>("admin", None, None).is_none());
    }

    #[test]
    fn test_deleted_rule() {
        let rule = PermissionRule::new("https://cdn.example.com", [Directive::ScriptSrc]);
        let entry = AuditEntry::diff("admin", Some(&rule), None).unwrap();

        assert_eq!(entry.operation, AuditOperation::Deleted);
        let source = change(&entry, "source").unwrap();
        assert_eq!(source.old_value.as_deref(), Some("https://cdn.example.com"));
        assert_eq!(source.new_value, None);
    }

    #[tokio::test]
    async fn test_log_is_newest_first_and_bounded() {
        let log = InMemoryAuditLog::with_capacity(2);
        for source in ["https://a.example", "https://b.example", "https://c.example"] {
            let rule = PermissionRule::new(source, [Directive::ScriptSrc]);
            log.append(AuditEntry::diff("admin", None, Some(&rule)).unwrap())
                .await
                .unwrap();
        }

        assert_eq!(log.len(), 2);
        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent[0].identifier, "https://c.example");
        assert_eq!(recent[1].identifier, "https://b.example");
        assert_eq!(log.recent(1).await.unwrap().len(), 1);
    }
}
