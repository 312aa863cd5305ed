//! Containment and validity checks against the configured allow list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cache::TtlCache;
use common::{SecurityError, SecurityResult};
use csp_security::Directive;
use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::allow_list::AllowListDocument;
use crate::client::{ClientError, DocumentFetcher};

/// Allow-list lookup settings.
#[derive(Clone, Debug)]
pub struct AllowListConfig {
    /// Upper bound on one fetch, regardless of the fetcher's own timeouts.
    pub timeout: Duration,
    /// How long a fetched document is reused.
    pub cache_ttl: Duration,
    /// How long a failed fetch is remembered before the URL is tried again.
    pub failure_ttl: Duration,
    /// Maximum number of distinct allow-list URLs kept.
    pub cache_capacity: usize,
}

impl Default for AllowListConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
            failure_ttl: Duration::from_secs(30),
            cache_capacity: 64,
        }
    }
}

/// Checks sources against an externally published allow list.
///
/// At most one fetch per URL is in flight; concurrent lookups wait for it.
pub struct AllowListService {
    fetcher: Arc<dyn DocumentFetcher>,
    documents: TtlCache<String, Arc<AllowListDocument>>,
    failures: TtlCache<String, String>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: AllowListConfig,
}

impl AllowListService {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, config: AllowListConfig) -> Self {
        Self {
            fetcher,
            documents: TtlCache::new(config.cache_capacity, config.cache_ttl),
            failures: TtlCache::new(config.cache_capacity, config.failure_ttl),
            in_flight: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check if `(source, directive)` is on the allow list published at `allow_list_url`.
    ///
    /// Any failure (bad URL, timeout, HTTP error, malformed document) is logged
    /// and treated as "not on the list".
    pub async fn is_on_allow_list(&self, allow_list_url: &str, source: &str, directive: Directive) -> bool {
        if source.trim().is_empty() {
            return false;
        }

        match self.document(allow_list_url).await {
            Ok(document) => {
                let found = document.contains(source, directive);
                debug!(source, %directive, found, "Checked allow list");
                found
            }
            Err(e) => {
                warn!(url = allow_list_url, "Allow list unavailable, treating source as not listed: {}", e);
                false
            }
        }
    }

    /// Check that `allow_list_url` is well formed, reachable and holds a valid document.
    pub async fn is_allow_list_valid(&self, allow_list_url: &str) -> bool {
        match self.validate(allow_list_url).await {
            Ok(document) => {
                debug!(url = allow_list_url, entries = document.len(), "Allow list is valid");
                true
            }
            Err(e) => {
                warn!(url = allow_list_url, "Allow list is not valid: {}", e);
                false
            }
        }
    }

    /// Like [`is_allow_list_valid`](Self::is_allow_list_valid), but reports why.
    ///
    /// Always fetches; never served from the document cache.
    pub async fn validate(&self, allow_list_url: &str) -> SecurityResult<Arc<AllowListDocument>> {
        let url = parse_allow_list_url(allow_list_url)?;
        let key = url.to_string();
        let document = Arc::new(self.fetch(&url).await?);
        self.failures.remove(&key);
        self.documents.put(key, document.clone());
        Ok(document)
    }

    /// Forget every cached document and remembered failure.
    pub fn clear_cache(&self) {
        self.documents.clear();
        self.failures.clear();
    }

    async fn document(&self, allow_list_url: &str) -> SecurityResult<Arc<AllowListDocument>> {
        let url = parse_allow_list_url(allow_list_url)?;
        let key = url.to_string();

        if let Some(document) = self.cached(&key)? {
            return Ok(document);
        }

        let lock = self
            .in_flight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            match self.cached(&key) {
                Ok(Some(document)) => Ok(document),
                Ok(None) => self.fetch_and_remember(&url, &key).await,
                Err(e) => Err(e),
            }
        };

        let mut in_flight = self.in_flight.lock();
        if Arc::strong_count(&lock) <= 2 {
            in_flight.remove(&key);
        }
        result
    }

    fn cached(&self, key: &String) -> SecurityResult<Option<Arc<AllowListDocument>>> {
        if let Some(document) = self.documents.get(key) {
            return Ok(Some(document));
        }
        match self.failures.get(key) {
            Some(reason) => Err(SecurityError::network(format!("recent fetch failed: {}", reason))),
            None => Ok(None),
        }
    }

    async fn fetch_and_remember(&self, url: &Url, key: &str) -> SecurityResult<Arc<AllowListDocument>> {
        match self.fetch(url).await {
            Ok(document) => {
                let document = Arc::new(document);
                self.documents.put(key.to_string(), document.clone());
                Ok(document)
            }
            Err(e) => {
                self.failures.put(key.to_string(), e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch(&self, url: &Url) -> SecurityResult<AllowListDocument> {
        let body = tokio::time::timeout(self.config.timeout, self.fetcher.fetch_text(url))
            .await
            .map_err(|_| ClientError::Timeout)??;

        AllowListDocument::parse(&body)
            .map_err(|e| SecurityError::parse(format!("malformed allow list: {}", e)))
    }
}

fn parse_allow_list_url(value: &str) -> SecurityResult<Url> {
    let url = Url::parse(value.trim())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(SecurityError::validation(format!(
            "allow list URL must be an absolute http(s) URL: {}",
            value
        )));
    }
    Ok(url)
}
