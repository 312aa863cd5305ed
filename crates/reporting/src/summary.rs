//! Violation summary for the admin surface.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::SecurityResult;
use csp_security::Directive;
use serde::Serialize;
use url::Url;

use crate::normalize::SourceNormalizer;
use crate::store::{ViolationRecord, ViolationStore};

/// Filters for [`ViolationReportService::summary`].
///
/// Text filters are case-insensitive substring matches. `since` defaults to
/// the start of the retention window.
#[derive(Clone, Debug, Default)]
pub struct SummaryQuery {
    pub source: Option<String>,
    pub directive: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl SummaryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, record: &ViolationRecord) -> bool {
        contains_ignore_case(&record.source, self.source.as_deref())
            && contains_ignore_case(record.directive.name(), self.directive.as_deref())
    }
}

fn contains_ignore_case(haystack: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        None | Some("") => true,
        Some(needle) => haystack
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase()),
    }
}

/// One row of the summary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationSummaryEntry {
    pub key: String,
    pub source: String,
    pub sanitized_source: String,
    pub source_suggestions: Vec<String>,
    pub directive: Directive,
    pub directive_suggestions: Vec<Directive>,
    pub violations: u64,
    pub last_violated: DateTime<Utc>,
}

impl ViolationSummaryEntry {
    fn from_record(record: ViolationRecord, normalizer: &dyn SourceNormalizer) -> Self {
        let sanitized_source = normalizer
            .normalize(&record.source)
            .unwrap_or_else(|| record.source.clone());

        let mut directive_suggestions = vec![record.directive];
        if record.directive.falls_back_to_default() {
            directive_suggestions.push(Directive::DefaultSrc);
        }

        Self {
            key: format!("{}|{}", record.source, record.directive),
            source_suggestions: source_suggestions(&sanitized_source),
            sanitized_source,
            source: record.source,
            directive: record.directive,
            directive_suggestions,
            violations: record.violations,
            last_violated: record.last_violated,
        }
    }
}

/// Sources an admin might grant instead of the exact one reported:
/// the origin itself, a wildcard over its parent domain, and its scheme.
fn source_suggestions(sanitized: &str) -> Vec<String> {
    let mut suggestions = vec![sanitized.to_string()];

    let Ok(url) = Url::parse(sanitized) else {
        return suggestions;
    };
    let Some(host) = url.host_str() else {
        return suggestions;
    };

    let scheme = url.scheme();
    let labels: Vec<&str> = host.split('.').collect();
    if url.domain().is_some() && labels.len() > 2 {
        suggestions.push(format!("{scheme}://*.{}", labels[1..].join(".")));
    }
    suggestions.push(format!("{scheme}:"));
    suggestions.dedup();
    suggestions
}

/// Read side of violation reporting.
pub struct ViolationReportService {
    store: Arc<dyn ViolationStore>,
    normalizer: Arc<dyn SourceNormalizer>,
    retention: Duration,
}

impl ViolationReportService {
    pub fn new(
        store: Arc<dyn ViolationStore>,
        normalizer: Arc<dyn SourceNormalizer>,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            normalizer,
            retention: Duration::days(i64::from(retention_days)),
        }
    }

    /// Oldest timestamp still inside the retention window.
    pub fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - self.retention
    }

    /// Filtered summary, most recently violated first.
    pub async fn summary(&self, query: &SummaryQuery) -> SecurityResult<Vec<ViolationSummaryEntry>> {
        let window_start = self.window_start();
        let since = query.since.map_or(window_start, |s| s.max(window_start));

        let mut records: Vec<ViolationRecord> = self
            .store
            .since(since)
            .await?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();

        records.sort_by(|a, b| {
            b.last_violated
                .cmp(&a.last_violated)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.directive.cmp(&b.directive))
        });

        Ok(records
            .into_iter()
            .map(|r| ViolationSummaryEntry::from_record(r, self.normalizer.as_ref()))
            .collect())
    }

    /// Drop records older than the retention window.
    pub async fn purge_expired(&self) -> SecurityResult<usize> {
        self.store.purge_before(self.window_start()).await
    }
}
