//! The self-healing loop: violations confirmed by the external allow list
//! become permission rules.

use std::sync::Arc;

use cache::CompiledHeaderCache;
use common::SecurityResult;
use csp_security::{
    AuditEntry, AuditLog, CompiledHeaderSet, CspSource, Directive, InMemoryAuditLog, PermissionRule, PolicyStore,
};
use networking::AllowListService;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ingest::Violation;
use crate::normalize::SourceNormalizer;
use crate::store::{ViolationRecord, ViolationStore};

/// Audit name stamped on rules created or widened automatically.
pub const ALLOW_LIST_ACTOR: &str = "allow-list";

/// Serializes read-modify-write of permission rules across every writer.
pub type RuleWriteLock = Arc<Mutex<()>>;

/// What happened to one violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Recorded only; the allow list is disabled or the source cannot be promoted.
    Recorded,
    /// Recorded; the allow list does not contain the source for this directive.
    NotListed,
    /// Recorded and promoted into the policy.
    Promoted,
    /// Recorded; the policy already grants it.
    AlreadyPermitted,
}

/// Records violations and promotes the allow-listed ones.
///
/// A violation report alone never changes the policy: promotion requires the
/// `(source, directive)` pair to be on the admin-published allow list.
pub struct AllowListReconciler {
    policies: Arc<dyn PolicyStore>,
    violations: Arc<dyn ViolationStore>,
    allow_list: Arc<AllowListService>,
    cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
    cache_key: String,
    normalizer: Arc<dyn SourceNormalizer>,
    rule_lock: RuleWriteLock,
    audit: Arc<dyn AuditLog>,
}

impl AllowListReconciler {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        violations: Arc<dyn ViolationStore>,
        allow_list: Arc<AllowListService>,
        cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
        cache_key: impl Into<String>,
        normalizer: Arc<dyn SourceNormalizer>,
    ) -> Self {
        Self {
            policies,
            violations,
            allow_list,
            cache,
            cache_key: cache_key.into(),
            normalizer,
            rule_lock: RuleWriteLock::default(),
            audit: Arc::new(InMemoryAuditLog::new()),
        }
    }

    /// Share the rule write lock with the other writers of permission rules.
    pub fn with_rule_lock(mut self, rule_lock: RuleWriteLock) -> Self {
        self.rule_lock = rule_lock;
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Record the violation, then promote it if the allow list confirms it.
    pub async fn reconcile(&self, violation: &Violation) -> SecurityResult<ReconcileOutcome> {
        self.record(violation).await?;
        self.promote(violation).await
    }

    /// Count the violation against its `(source, directive)` pair.
    pub async fn record(&self, violation: &Violation) -> SecurityResult<ViolationRecord> {
        let record = self.violations.record(violation).await?;
        debug!(
            source = %record.source,
            directive = %record.directive,
            count = record.violations,
            "Recorded violation"
        );
        Ok(record)
    }

    /// Promote an already recorded violation if the allow list confirms it.
    pub async fn promote(&self, violation: &Violation) -> SecurityResult<ReconcileOutcome> {
        let settings = self.policies.settings().await?;
        let Some(url) = settings.active_allow_list_url() else {
            return Ok(ReconcileOutcome::Recorded);
        };

        let Some(source) = self.normalizer.normalize(&violation.source) else {
            debug!(source = %violation.source, "Source is not promotable");
            return Ok(ReconcileOutcome::Recorded);
        };

        if !self.allow_list.is_on_allow_list(url, &source, violation.directive).await {
            return Ok(ReconcileOutcome::NotListed);
        }

        if self.add_from_allow_list_to_csp(&source, violation.directive).await? {
            Ok(ReconcileOutcome::Promoted)
        } else {
            Ok(ReconcileOutcome::AlreadyPermitted)
        }
    }

    /// Grant `directive` to `source`, creating the rule if needed.
    ///
    /// Idempotent. Returns `true` if the policy changed, in which case the
    /// compiled headers are invalidated after the save commits.
    pub async fn add_from_allow_list_to_csp(&self, source: &str, directive: Directive) -> SecurityResult<bool> {
        let source = CspSource::parse(source)?.to_string();

        let _guard = self.rule_lock.lock().await;

        let existing = self.policies.permission_for_source(&source).await?;
        let mut rule = match existing.clone() {
            Some(rule) if rule.grants(directive) => return Ok(false),
            Some(mut rule) => {
                rule.grant(directive);
                rule
            }
            None => PermissionRule::new(source.clone(), [directive]),
        };
        rule.touch(ALLOW_LIST_ACTOR);

        self.policies.save_permission(rule.clone()).await?;
        self.cache.invalidate(&self.cache_key);

        if let Some(entry) = AuditEntry::diff(ALLOW_LIST_ACTOR, existing.as_ref(), Some(&rule)) {
            if let Err(e) = self.audit.append(entry).await {
                warn!(source = %source, "Failed to write audit entry: {}", e);
            }
        }

        info!(source = %source, directive = %directive, "Promoted allow-listed source into policy");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::OriginNormalizer;
    use crate::store::InMemoryViolationStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use csp_security::{InMemoryPolicyStore, PolicySettings};
    use networking::{AllowListConfig, ClientError, DocumentFetcher};
    use url::Url;

    const LIST_URL: &str = "https://lists.example.com/allow.json";
    const LIST: &str = r#"{"Entries":[{"SourceUrl":"https://cdn.example.com","Directives":["script-src","img-src"]}]}"#;

    struct StaticFetcher;

    #[async_trait]
    impl DocumentFetcher for StaticFetcher {
        async fn fetch_text(&self, _url: &Url) -> Result<String, ClientError> {
            Ok(LIST.to_string())
        }
    }

    struct Fixture {
        policies: Arc<InMemoryPolicyStore>,
        violations: Arc<InMemoryViolationStore>,
        cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
        audit: Arc<InMemoryAuditLog>,
        reconciler: AllowListReconciler,
    }

    async fn fixture(allow_list_enabled: bool) -> Fixture {
        let policies = Arc::new(InMemoryPolicyStore::new());
        let mut settings = PolicySettings::enabled();
        settings.is_allow_list_enabled = allow_list_enabled;
        settings.allow_list_url = Some(LIST_URL.to_string());
        policies.save_settings(settings).await.unwrap();

        let violations = Arc::new(InMemoryViolationStore::new());
        let cache = Arc::new(CompiledHeaderCache::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let allow_list = Arc::new(AllowListService::new(
            Arc::new(StaticFetcher),
            AllowListConfig::default(),
        ));
        let reconciler = AllowListReconciler::new(
            policies.clone(),
            violations.clone(),
            allow_list,
            cache.clone(),
            "site",
            Arc::new(OriginNormalizer),
        )
        .with_audit_log(audit.clone());

        Fixture {
            policies,
            violations,
            cache,
            audit,
            reconciler,
        }
    }

    fn violation(source: &str, directive: Directive) -> Violation {
        Violation {
            source: source.to_string(),
            directive,
            reported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_disabled_allow_list_only_records() {
        let f = fixture(false).await;
        let outcome = f
            .reconciler
            .reconcile(&violation("https://cdn.example.com/app.js", Directive::ScriptSrc))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Recorded);
        assert_eq!(f.violations.len(), 1);
        assert!(f.policies.permissions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listed_violation_is_promoted() {
        let f = fixture(true).await;
        let outcome = f
            .reconciler
            .reconcile(&violation("https://cdn.example.com/app.js", Directive::ScriptSrc))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Promoted);

        let rule = f
            .policies
            .permission_for_source("https://cdn.example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(rule.grants(Directive::ScriptSrc));
        assert_eq!(rule.modified_by.as_deref(), Some(ALLOW_LIST_ACTOR));
    }

    #[tokio::test]
    async fn test_unlisted_directive_is_not_promoted() {
        let f = fixture(true).await;
        let outcome = f
            .reconciler
            .reconcile(&violation("https://cdn.example.com", Directive::FrameSrc))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::NotListed);
        assert!(f.policies.permissions().await.unwrap().is_empty());
        assert_eq!(f.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_is_idempotent_and_unions() {
        let f = fixture(true).await;
        assert!(f
            .reconciler
            .add_from_allow_list_to_csp("https://cdn.example.com", Directive::ScriptSrc)
            .await
            .unwrap());
        let once = f.policies.permissions().await.unwrap();

        assert!(!f
            .reconciler
            .add_from_allow_list_to_csp("https://cdn.example.com", Directive::ScriptSrc)
            .await
            .unwrap());
        assert_eq!(f.policies.permissions().await.unwrap(), once);

        f.reconciler
            .add_from_allow_list_to_csp("https://CDN.example.com", Directive::ImgSrc)
            .await
            .unwrap();
        let rules = f.policies.permissions().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].grants(Directive::ScriptSrc));
        assert!(rules[0].grants(Directive::ImgSrc));
    }

    #[tokio::test]
    async fn test_promotion_invalidates_cache() {
        let f = fixture(true).await;
        let first = f
            .cache
            .get_or_compute("site", |version| async move {
                Ok::<_, ()>(CompiledHeaderSet::new(version, &PolicySettings::enabled(), String::new(), Vec::new()))
            })
            .await
            .unwrap();

        f.reconciler
            .add_from_allow_list_to_csp("https://cdn.example.com", Directive::ScriptSrc)
            .await
            .unwrap();

        assert!(f.cache.peek("site").is_none());
        let second = f
            .cache
            .get_or_compute("site", |version| async move {
                Ok::<_, ()>(CompiledHeaderSet::new(version, &PolicySettings::enabled(), String::new(), Vec::new()))
            })
            .await
            .unwrap();
        assert!(second.version > first.version);
    }

    #[tokio::test]
    async fn test_invalid_source_is_rejected() {
        let f = fixture(true).await;
        let err = f
            .reconciler
            .add_from_allow_list_to_csp("https://bad source", Directive::ScriptSrc)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(f.policies.permissions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_is_audited() {
        let f = fixture(true).await;
        f.reconciler
            .reconcile(&violation("https://cdn.example.com/app.js", Directive::ScriptSrc))
            .await
            .unwrap();
        f.reconciler
            .reconcile(&violation("https://cdn.example.com/logo.png", Directive::ImgSrc))
            .await
            .unwrap();
        f.reconciler
            .reconcile(&violation("https://cdn.example.com/app.js", Directive::ScriptSrc))
            .await
            .unwrap();

        let history = f.audit.recent(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.actor == ALLOW_LIST_ACTOR));
        assert_eq!(history[1].operation, csp_security::AuditOperation::Added);
        assert_eq!(history[0].operation, csp_security::AuditOperation::Modified);
        let directives = history[0].changes.iter().find(|c| c.field == "directives").unwrap();
        assert_eq!(directives.old_value.as_deref(), Some("script-src"));
        assert_eq!(directives.new_value.as_deref(), Some("img-src,script-src"));
    }

    #[tokio::test]
    async fn test_promote_does_not_record() {
        let f = fixture(true).await;
        let outcome = f
            .reconciler
            .promote(&violation("https://cdn.example.com/app.js", Directive::ScriptSrc))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Promoted);
        assert!(f.violations.is_empty());
    }
}
