//! Validated policy mutations for the admin surface.
//!
//! Every save validates first, commits second and invalidates the compiled
//! headers last. A rejected save has no side effect.

use std::sync::Arc;

use cache::CompiledHeaderCache;
use common::{SecurityError, SecurityResult};
use csp_security::{
    AuditEntry, AuditLog, Auditable, CompiledHeaderSet, CspSource, Directive, InMemoryAuditLog, PermissionRule,
    PolicySettings, PolicyStore, SandboxSettings, SecurityHeaderSettings,
};
use networking::AllowListService;
use reporting::RuleWriteLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Admin-facing read and write access to policy data.
pub struct PolicyAdmin {
    store: Arc<dyn PolicyStore>,
    allow_list: Arc<AllowListService>,
    cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
    cache_key: String,
    rule_lock: RuleWriteLock,
    audit: Arc<dyn AuditLog>,
}

impl PolicyAdmin {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        allow_list: Arc<AllowListService>,
        cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
        cache_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            allow_list,
            cache,
            cache_key: cache_key.into(),
            rule_lock: RuleWriteLock::default(),
            audit: Arc::new(InMemoryAuditLog::new()),
        }
    }

    /// Share the rule write lock with the allow-list reconciler.
    pub fn with_rule_lock(mut self, rule_lock: RuleWriteLock) -> Self {
        self.rule_lock = rule_lock;
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn settings(&self) -> SecurityResult<PolicySettings> {
        self.store.settings().await
    }

    /// Save the global switches.
    ///
    /// Enabling the allow list requires its URL to serve a valid document.
    /// Disabling it drops every cached allow-list fetch.
    pub async fn save_settings(&self, mut settings: PolicySettings, modified_by: &str) -> SecurityResult<()> {
        if settings.is_allow_list_enabled {
            let url = settings
                .allow_list_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| SecurityError::validation("an allow list URL is required"))?;
            self.allow_list
                .validate(url)
                .await
                .map_err(|e| SecurityError::validation(format!("allow list {} is not usable: {}", url, e)))?;
        }

        let previous = self.store.settings().await?;
        settings.modified = Some(chrono::Utc::now());
        settings.modified_by = Some(modified_by.to_string());
        self.store.save_settings(settings.clone()).await?;
        self.committed("settings");

        if !settings.is_allow_list_enabled {
            self.allow_list.clear_cache();
        }
        self.record_change(modified_by, Some(&previous), Some(&settings)).await;
        Ok(())
    }

    /// Every rule, plus an unsaved `'self'` default-src row when no rule
    /// covers `'self'`.
    pub async fn permissions(&self) -> SecurityResult<Vec<PermissionRule>> {
        let mut rules = self.store.permissions().await?;
        let has_self = rules
            .iter()
            .any(|r| CspSource::parse(&r.source).ok() == Some(CspSource::SELF));
        if !has_self {
            let mut synthetic = PermissionRule::new(CspSource::SELF.to_string(), [Directive::DefaultSrc]);
            synthetic.id = Uuid::nil();
            rules.insert(0, synthetic);
        }
        Ok(rules)
    }

    /// Create or replace a rule.
    ///
    /// The source is trimmed and must parse; the rule must grant at least one
    /// directive; no other rule may already hold the same source.
    pub async fn save_permission(&self, rule: PermissionRule, modified_by: &str) -> SecurityResult<PermissionRule> {
        let _guard = self.rule_lock.lock().await;
        self.save_permission_locked(rule, modified_by).await
    }

    /// Grant one directive to a source by name, creating the rule if needed.
    pub async fn add_permission(&self, source: &str, directive: &str, modified_by: &str) -> SecurityResult<PermissionRule> {
        let directive: Directive = directive.parse()?;
        let source = CspSource::parse(source.trim())?.to_string();

        let _guard = self.rule_lock.lock().await;
        let rule = match self.store.permission_for_source(&source).await? {
            Some(rule) if rule.grants(directive) => return Ok(rule),
            Some(mut rule) => {
                rule.grant(directive);
                rule
            }
            None => PermissionRule::new(source, [directive]),
        };
        self.save_permission_locked(rule, modified_by).await
    }

    pub async fn delete_permission(&self, id: Uuid, modified_by: &str) -> SecurityResult<()> {
        let _guard = self.rule_lock.lock().await;
        let previous = self.rule_by_id(id).await?;
        self.store.delete_permission(id).await?;
        self.committed("permission");
        self.record_change::<PermissionRule>(modified_by, previous.as_ref(), None).await;
        Ok(())
    }

    pub async fn header_settings(&self) -> SecurityResult<SecurityHeaderSettings> {
        self.store.header_settings().await
    }

    pub async fn save_header_settings(&self, mut settings: SecurityHeaderSettings, modified_by: &str) -> SecurityResult<()> {
        if settings.is_strict_transport_security_enabled && settings.strict_transport_security_max_age == 0 {
            return Err(SecurityError::validation(
                "Strict-Transport-Security needs a positive max-age",
            ));
        }

        let previous = self.store.header_settings().await?;
        settings.modified = Some(chrono::Utc::now());
        settings.modified_by = Some(modified_by.to_string());
        self.store.save_header_settings(settings.clone()).await?;
        self.committed("security headers");
        self.record_change(modified_by, Some(&previous), Some(&settings)).await;
        Ok(())
    }

    pub async fn sandbox(&self) -> SecurityResult<SandboxSettings> {
        self.store.sandbox().await
    }

    pub async fn save_sandbox(&self, mut sandbox: SandboxSettings, modified_by: &str) -> SecurityResult<()> {
        let previous = self.store.sandbox().await?;
        sandbox.modified = Some(chrono::Utc::now());
        sandbox.modified_by = Some(modified_by.to_string());
        self.store.save_sandbox(sandbox.clone()).await?;
        self.committed("sandbox");
        self.record_change(modified_by, Some(&previous), Some(&sandbox)).await;
        Ok(())
    }

    /// The newest `limit` audit entries, newest first.
    pub async fn history(&self, limit: usize) -> SecurityResult<Vec<AuditEntry>> {
        self.audit.recent(limit).await
    }

    // Caller holds `rule_lock`.
    async fn save_permission_locked(&self, mut rule: PermissionRule, modified_by: &str) -> SecurityResult<PermissionRule> {
        rule.source = CspSource::parse(rule.source.trim())?.to_string();
        if rule.directives.is_empty() {
            return Err(SecurityError::validation("a rule must grant at least one directive"));
        }
        if rule.id.is_nil() {
            rule.id = Uuid::new_v4();
        }

        if let Some(existing) = self.store.permission_for_source(&rule.source).await? {
            if existing.id != rule.id {
                return Err(SecurityError::validation(format!(
                    "a rule for {} already exists",
                    rule.source
                )));
            }
        }

        let previous = self.rule_by_id(rule.id).await?;
        rule.touch(modified_by);
        self.store.save_permission(rule.clone()).await?;
        self.committed("permission");
        self.record_change(modified_by, previous.as_ref(), Some(&rule)).await;
        Ok(rule)
    }

    async fn rule_by_id(&self, id: Uuid) -> SecurityResult<Option<PermissionRule>> {
        Ok(self.store.permissions().await?.into_iter().find(|r| r.id == id))
    }

    fn committed(&self, what: &str) {
        self.cache.invalidate(&self.cache_key);
        info!(key = %self.cache_key, "Saved {}", what);
    }

    // Runs after commit; a lost entry never undoes the write.
    async fn record_change<T: Auditable + Sync>(&self, actor: &str, old: Option<&T>, new: Option<&T>) {
        let Some(entry) = AuditEntry::diff(actor, old, new) else {
            return;
        };
        if let Err(e) = self.audit.append(entry).await {
            warn!(actor, "Failed to write audit entry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use csp_security::{AuditOperation, InMemoryPolicyStore};
    use networking::{AllowListConfig, ClientError, DocumentFetcher};
    use url::Url;

    struct Fetcher(Option<&'static str>);

    #[async_trait]
    impl DocumentFetcher for Fetcher {
        async fn fetch_text(&self, _url: &Url) -> Result<String, ClientError> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| ClientError::Connection("refused".to_string()))
        }
    }

    fn admin(store: Arc<InMemoryPolicyStore>, document: Option<&'static str>) -> (PolicyAdmin, Arc<CompiledHeaderCache<CompiledHeaderSet>>) {
        let cache = Arc::new(CompiledHeaderCache::new());
        let allow_list = Arc::new(AllowListService::new(
            Arc::new(Fetcher(document)),
            AllowListConfig::default(),
        ));
        (PolicyAdmin::new(store, allow_list, cache.clone(), "site"), cache)
    }

    async fn warm(cache: &CompiledHeaderCache<CompiledHeaderSet>) {
        cache
            .get_or_compute("site", |version| async move {
                Ok::<_, SecurityError>(CompiledHeaderSet {
                    version,
                    ..CompiledHeaderSet::default()
                })
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_permission_validates_and_stamps() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store.clone(), None);

        let saved = admin
            .save_permission(PermissionRule::new("  self ", [Directive::ScriptSrc]), "alice")
            .await
            .unwrap();
        assert_eq!(saved.source, "'self'");
        assert_eq!(saved.modified_by.as_deref(), Some("alice"));
        assert!(saved.modified.is_some());

        let err = admin
            .save_permission(PermissionRule::new("https://a b", [Directive::ScriptSrc]), "alice")
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = admin
            .save_permission(PermissionRule::new("https://cdn.example.com", Vec::<Directive>::new()), "alice")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.permissions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_source_is_rejected() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store, None);
        admin
            .save_permission(PermissionRule::new("https://cdn.example.com", [Directive::ImgSrc]), "alice")
            .await
            .unwrap();

        let err = admin
            .save_permission(PermissionRule::new("https://CDN.example.com", [Directive::FontSrc]), "bob")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_add_permission_unions_by_name() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store.clone(), None);

        admin.add_permission("https://cdn.example.com", "script-src", "alice").await.unwrap();
        let rule = admin.add_permission("https://cdn.example.com", "IMG-SRC", "alice").await.unwrap();
        assert!(rule.grants(Directive::ScriptSrc));
        assert!(rule.grants(Directive::ImgSrc));
        assert_eq!(store.permissions().await.unwrap().len(), 1);

        let err = admin
            .add_permission("https://cdn.example.com", "script-source", "alice")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_permissions_include_synthetic_self() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store.clone(), None);

        let rules = admin.permissions().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source, "'self'");
        assert!(rules[0].grants(Directive::DefaultSrc));
        assert!(store.permissions().await.unwrap().is_empty());

        admin.add_permission("'self'", "img-src", "alice").await.unwrap();
        let rules = admin.permissions().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].grants(Directive::ImgSrc));
    }

    #[tokio::test]
    async fn test_enabling_allow_list_requires_valid_document() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let mut settings = PolicySettings::enabled();
        settings.is_allow_list_enabled = true;
        settings.allow_list_url = Some("https://lists.example.com/allow.json".to_string());

        let (unreachable, _) = admin(store.clone(), None);
        let err = unreachable.save_settings(settings.clone(), "alice").await.unwrap_err();
        assert!(err.is_validation());
        assert!(!store.settings().await.unwrap().is_enabled);

        let (reachable, _) = admin(store.clone(), Some(r#"{"Entries":[]}"#));
        reachable.save_settings(settings, "alice").await.unwrap();
        let saved = store.settings().await.unwrap();
        assert!(saved.is_allow_list_enabled);
        assert_eq!(saved.modified_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_enabling_allow_list_without_url_fails() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store, Some(r#"{"Entries":[]}"#));
        let mut settings = PolicySettings::enabled();
        settings.is_allow_list_enabled = true;

        assert!(admin.save_settings(settings, "alice").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_hsts_needs_max_age() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store, None);
        let mut headers = SecurityHeaderSettings::default();
        headers.is_strict_transport_security_enabled = true;

        assert!(admin.save_header_settings(headers.clone(), "alice").await.unwrap_err().is_validation());
        headers.strict_transport_security_max_age = 3600;
        admin.save_header_settings(headers, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_saves_invalidate_and_failures_do_not() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, cache) = admin(store.clone(), None);

        warm(&cache).await;
        admin.save_sandbox(SandboxSettings::default(), "alice").await.unwrap();
        assert!(cache.peek("site").is_none());

        warm(&cache).await;
        store.set_offline(true);
        assert!(admin.save_sandbox(SandboxSettings::default(), "alice").await.is_err());
        assert!(cache.peek("site").is_some());
    }

    #[tokio::test]
    async fn test_delete_permission() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store.clone(), None);
        let rule = admin.add_permission("https://a.example", "img-src", "alice").await.unwrap();

        admin.delete_permission(rule.id, "alice").await.unwrap();
        assert!(store.permissions().await.unwrap().is_empty());
        assert!(admin.delete_permission(rule.id, "alice").await.is_err());
    }

    #[tokio::test]
    async fn test_changes_are_audited() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store, None);

        let rule = admin.add_permission("https://cdn.example.com", "script-src", "alice").await.unwrap();
        admin.add_permission("https://cdn.example.com", "img-src", "bob").await.unwrap();
        admin.delete_permission(rule.id, "carol").await.unwrap();

        let history = admin.history(10).await.unwrap();
        let summary: Vec<_> = history.iter().map(|e| (e.actor.as_str(), e.operation)).collect();
        assert_eq!(
            summary,
            vec![
                ("carol", AuditOperation::Deleted),
                ("bob", AuditOperation::Modified),
                ("alice", AuditOperation::Added),
            ]
        );
        let widened = &history[1];
        assert_eq!(widened.identifier, "https://cdn.example.com");
        assert_eq!(widened.changes.len(), 1);
        assert_eq!(widened.changes[0].field, "directives");
        assert_eq!(widened.changes[0].old_value.as_deref(), Some("script-src"));
        assert_eq!(widened.changes[0].new_value.as_deref(), Some("img-src,script-src"));
    }

    #[tokio::test]
    async fn test_settings_changes_are_audited() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (admin, _) = admin(store.clone(), None);

        admin.save_settings(PolicySettings::enabled(), "alice").await.unwrap();
        // Same values again: no entry.
        admin.save_settings(PolicySettings::enabled(), "alice").await.unwrap();
        let mut headers = SecurityHeaderSettings::default();
        headers.is_strict_transport_security_enabled = true;
        headers.strict_transport_security_max_age = 3600;
        admin.save_header_settings(headers, "bob").await.unwrap();

        let history = admin.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record_type, "Security Headers");
        assert_eq!(history[1].record_type, "CSP Settings");
        assert_eq!(history[1].changes[0].field, "is_enabled");

        // Rejected saves leave no trace.
        store.set_offline(true);
        assert!(admin.save_sandbox(SandboxSettings::default(), "alice").await.is_err());
        assert_eq!(admin.history(10).await.unwrap().len(), 2);
    }
}
