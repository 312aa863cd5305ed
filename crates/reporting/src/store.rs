//! Persistence of violation records.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::SecurityResult;
use csp_security::Directive;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ingest::Violation;

/// Aggregate of every report for one `(source, directive)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub source: String,
    pub directive: Directive,
    pub violations: u64,
    pub last_violated: DateTime<Utc>,
}

/// Stores violation records keyed by `(source, directive)`.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Upsert: create the record or bump its count and timestamp.
    async fn record(&self, violation: &Violation) -> SecurityResult<ViolationRecord>;

    /// Records last violated at or after `since`.
    async fn since(&self, since: DateTime<Utc>) -> SecurityResult<Vec<ViolationRecord>>;

    /// Delete records last violated before `cutoff`. Returns how many went.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SecurityResult<usize>;
}

/// Process-local violation store.
///
/// Holds at most `max_records` pairs. Making room for a new pair first drops
/// records older than the retention window, then the least recently violated.
#[derive(Debug)]
pub struct InMemoryViolationStore {
    records: RwLock<HashMap<(String, Directive), ViolationRecord>>,
    max_records: usize,
    retention: Duration,
}

impl InMemoryViolationStore {
    pub const DEFAULT_MAX_RECORDS: usize = 10_000;

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_MAX_RECORDS, Duration::days(30))
    }

    pub fn with_limits(max_records: usize, retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, source: &str, directive: Directive) -> Option<ViolationRecord> {
        self.records
            .read()
            .get(&(source.to_string(), directive))
            .cloned()
    }

    fn make_room(&self, records: &mut HashMap<(String, Directive), ViolationRecord>) {
        if records.len() < self.max_records {
            return;
        }

        let cutoff = Utc::now() - self.retention;
        let before = records.len();
        records.retain(|_, r| r.last_violated >= cutoff);
        let expired = before - records.len();

        let mut evicted = 0;
        while records.len() >= self.max_records {
            let Some(oldest) = records
                .iter()
                .min_by_key(|(_, r)| r.last_violated)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            records.remove(&oldest);
            evicted += 1;
        }

        debug!(expired, evicted, "Made room in violation store");
    }
}

impl Default for InMemoryViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ViolationStore for InMemoryViolationStore {
    async fn record(&self, violation: &Violation) -> SecurityResult<ViolationRecord> {
        let mut records = self.records.write();
        let key = (violation.source.clone(), violation.directive);
        if !records.contains_key(&key) {
            self.make_room(&mut records);
        }

        let record = records
            .entry(key)
            .or_insert_with(|| ViolationRecord {
                source: violation.source.clone(),
                directive: violation.directive,
                violations: 0,
                last_violated: violation.reported_at,
            });

        record.violations += 1;
        record.last_violated = record.last_violated.max(violation.reported_at);
        Ok(record.clone())
    }

    async fn since(&self, since: DateTime<Utc>) -> SecurityResult<Vec<ViolationRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.last_violated >= since)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SecurityResult<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.last_violated >= cutoff);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(source: &str, directive: Directive, at: DateTime<Utc>) -> Violation {
        Violation {
            source: source.to_string(),
            directive,
            reported_at: at,
        }
    }

    #[tokio::test]
    async fn test_record_upserts_and_counts() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        store.record(&violation("https://a.example", Directive::ScriptSrc, t0)).await.unwrap();
        let record = store
            .record(&violation("https://a.example", Directive::ScriptSrc, t1))
            .await
            .unwrap();
        store.record(&violation("https://a.example", Directive::ImgSrc, t0)).await.unwrap();

        assert_eq!(record.violations, 2);
        assert_eq!(record.last_violated, t1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_reports_keep_latest_timestamp() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        store.record(&violation("https://a.example", Directive::ScriptSrc, t0)).await.unwrap();
        let record = store
            .record(&violation("https://a.example", Directive::ScriptSrc, t0 - Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(record.last_violated, t0);
    }

    #[tokio::test]
    async fn test_since_and_purge() {
        let store = InMemoryViolationStore::new();
        let now = Utc::now();
        store
            .record(&violation("https://old.example", Directive::ImgSrc, now - Duration::days(40)))
            .await
            .unwrap();
        store.record(&violation("https://new.example", Directive::ImgSrc, now)).await.unwrap();

        let recent = store.since(now - Duration::days(30)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source, "https://new.example");

        assert_eq!(store.purge_before(now - Duration::days(30)).await.unwrap(), 1);
        assert!(store.get("https://old.example", Directive::ImgSrc).is_none());
    }

    #[tokio::test]
    async fn test_full_store_drops_expired_records_first() {
        let store = InMemoryViolationStore::with_limits(2, Duration::days(30));
        let now = Utc::now();
        store
            .record(&violation("https://old.example", Directive::ImgSrc, now - Duration::days(40)))
            .await
            .unwrap();
        store
            .record(&violation("https://kept.example", Directive::ImgSrc, now - Duration::days(1)))
            .await
            .unwrap();

        store.record(&violation("https://new.example", Directive::ImgSrc, now)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("https://old.example", Directive::ImgSrc).is_none());
        assert!(store.get("https://kept.example", Directive::ImgSrc).is_some());
    }

    #[tokio::test]
    async fn test_store_is_bounded() {
        let store = InMemoryViolationStore::with_limits(100, Duration::days(30));
        let start = Utc::now() - Duration::hours(1);
        for i in 0..500 {
            let at = start + Duration::seconds(i);
            store
                .record(&violation(&format!("https://host{}.example", i), Directive::ScriptSrc, at))
                .await
                .unwrap();
        }

        assert_eq!(store.len(), 100);
        assert!(store.get("https://host0.example", Directive::ScriptSrc).is_none());
        assert!(store.get("https://host499.example", Directive::ScriptSrc).is_some());

        // Existing pairs are updated in place without eviction.
        store
            .record(&violation("https://host499.example", Directive::ScriptSrc, Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.len(), 100);
        assert!(store.get("https://host400.example", Directive::ScriptSrc).is_some());
    }
}
