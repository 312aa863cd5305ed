//! Manager engine - wires the policy components together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cache::CompiledHeaderCache;
use csp_security::{AuditLog, CompiledHeaderSet, InMemoryAuditLog, InMemoryPolicyStore, PolicyStore};
use networking::client::HttpClientBuilder;
use networking::{AllowListService, DocumentFetcher};
use reporting::{
    AllowListReconciler, InMemoryViolationStore, OriginNormalizer, ReportEndpoint, RuleWriteLock,
    SourceNormalizer, ViolationReportService, ViolationStore,
};
use tracing::debug;

use crate::admin::PolicyAdmin;
use crate::compilation::HeaderCompilationService;
use crate::config::ManagerConfig;

/// The assembled manager. Every component shares one cache and one policy store.
pub struct CspManager {
    config: ManagerConfig,
    cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
    headers: HeaderCompilationService,
    admin: PolicyAdmin,
    reconciler: Arc<AllowListReconciler>,
    endpoint: ReportEndpoint,
    reports: ViolationReportService,
}

impl CspManager {
    /// Create a manager with in-memory stores and an HTTP allow-list fetcher.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        CspManagerBuilder::new(config).build()
    }

    pub fn builder(config: ManagerConfig) -> CspManagerBuilder {
        CspManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Compiled headers for outbound responses.
    pub fn headers(&self) -> &HeaderCompilationService {
        &self.headers
    }

    /// Validated policy mutations.
    pub fn admin(&self) -> &PolicyAdmin {
        &self.admin
    }

    /// Promotion of allow-listed violations. Shares the rule write lock with [`admin`](Self::admin).
    pub fn reconciler(&self) -> &Arc<AllowListReconciler> {
        &self.reconciler
    }

    /// The browser report endpoint.
    pub fn endpoint(&self) -> &ReportEndpoint {
        &self.endpoint
    }

    /// Violation summaries.
    pub fn reports(&self) -> &ViolationReportService {
        &self.reports
    }

    pub fn cache(&self) -> &Arc<CompiledHeaderCache<CompiledHeaderSet>> {
        &self.cache
    }
}

/// Builder for [`CspManager`]. Unset collaborators get in-process defaults.
pub struct CspManagerBuilder {
    config: ManagerConfig,
    policies: Option<Arc<dyn PolicyStore>>,
    violations: Option<Arc<dyn ViolationStore>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    normalizer: Option<Arc<dyn SourceNormalizer>>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl CspManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            policies: None,
            violations: None,
            fetcher: None,
            normalizer: None,
            audit: None,
        }
    }

    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(store);
        self
    }

    pub fn violation_store(mut self, store: Arc<dyn ViolationStore>) -> Self {
        self.violations = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn SourceNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> Result<CspManager> {
        let config = self.config;
        let key = config.cache.namespace.clone();

        let policies = self
            .policies
            .unwrap_or_else(|| Arc::new(InMemoryPolicyStore::new()) as Arc<dyn PolicyStore>);
        let violations = self
            .violations
            .unwrap_or_else(|| {
                let retention = chrono::Duration::days(i64::from(config.reporting.retention_days));
                Arc::new(InMemoryViolationStore::with_limits(config.reporting.max_records, retention))
                    as Arc<dyn ViolationStore>
            });
        let audit = self.audit.unwrap_or_else(|| {
            Arc::new(InMemoryAuditLog::with_capacity(config.reporting.audit_capacity)) as Arc<dyn AuditLog>
        });
        let normalizer = self
            .normalizer
            .unwrap_or_else(|| Arc::new(OriginNormalizer) as Arc<dyn SourceNormalizer>);
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let timeout = Duration::from_millis(config.allow_list.timeout_ms);
                let client = HttpClientBuilder::new()
                    .timeout(timeout)
                    .connect_timeout(timeout)
                    .build()
                    .context("failed to build allow list HTTP client")?;
                Arc::new(client) as Arc<dyn DocumentFetcher>
            }
        };

        let cache = Arc::new(CompiledHeaderCache::new());
        let allow_list = Arc::new(AllowListService::new(fetcher, config.allow_list_config()));

        let headers = HeaderCompilationService::new(
            policies.clone(),
            cache.clone(),
            key.clone(),
            config.compiler_options(),
            config.nonce.apply_to_styles,
        );
        // Admin edits and automatic promotions serialize on one lock.
        let rule_lock = RuleWriteLock::default();
        let admin = PolicyAdmin::new(policies.clone(), allow_list.clone(), cache.clone(), key.clone())
            .with_rule_lock(rule_lock.clone())
            .with_audit_log(audit.clone());
        let reconciler = Arc::new(
            AllowListReconciler::new(
                policies,
                violations.clone(),
                allow_list,
                cache.clone(),
                key.clone(),
                normalizer.clone(),
            )
            .with_rule_lock(rule_lock)
            .with_audit_log(audit),
        );
        let endpoint =
            ReportEndpoint::new(reconciler.clone()).with_queue_capacity(config.reporting.queue_capacity);
        let reports = ViolationReportService::new(violations, normalizer, config.reporting.retention_days);

        debug!(key = %key, "Manager assembled");

        Ok(CspManager {
            config,
            cache,
            headers,
            admin,
            reconciler,
            endpoint,
            reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csp_security::headers::names;
    use csp_security::{Directive, PermissionRule};

    #[tokio::test]
    async fn test_default_manager_serves_nothing() {
        let manager = CspManager::new(ManagerConfig::default()).unwrap();
        let response = manager.headers().headers().await;
        assert!(response.headers.get(names::CONTENT_SECURITY_POLICY).is_none());
    }

    #[tokio::test]
    async fn test_admin_changes_are_served() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let manager = CspManager::builder(ManagerConfig::default().with_report_uri("/csp/report"))
            .policy_store(store)
            .build()
            .unwrap();

        let mut settings = manager.admin().settings().await.unwrap();
        settings.is_enabled = true;
        manager.admin().save_settings(settings, "alice").await.unwrap();
        assert!(manager.headers().headers().await.headers.is_empty());

        manager
            .admin()
            .save_permission(PermissionRule::new("self", [Directive::DefaultSrc]), "alice")
            .await
            .unwrap();

        let response = manager.headers().headers().await;
        assert_eq!(
            response.headers.get(names::CONTENT_SECURITY_POLICY),
            Some("default-src 'self'; report-uri /csp/report")
        );
    }

    #[test]
    fn test_namespace_is_cache_key() {
        let manager = CspManager::new(ManagerConfig::default().with_namespace("tenant-9")).unwrap();
        assert_eq!(manager.headers().cache_key(), "tenant-9");
        assert_eq!(manager.config().cache.namespace, "tenant-9");
    }
}
