//! The published allow-list document.
//!
//! ```json
//! { "Entries": [ { "SourceUrl": "https://*.example.com", "Directives": ["script-src"] } ] }
//! ```

use csp_security::Directive;
use serde::{Deserialize, Serialize};
use url::Url;

/// One pre-approved source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    #[serde(rename = "SourceUrl", alias = "sourceUrl", alias = "source_url")]
    pub source_url: String,
    #[serde(rename = "Directives", alias = "directives", default)]
    pub directives: Vec<String>,
}

impl AllowListEntry {
    /// Whether this entry lists the directive. Unknown directive names never match.
    pub fn allows_directive(&self, directive: Directive) -> bool {
        self.directives
            .iter()
            .any(|d| Directive::from_name(d) == Some(directive))
    }

    /// Whether the entry's source pattern covers `source`.
    ///
    /// Exact matches ignore ASCII case and a trailing `/`. A pattern of the form
    /// `scheme://*.domain[:port]` matches any strict sub-domain of `domain`
    /// with the same scheme (and port, when given).
    pub fn matches_source(&self, source: &str) -> bool {
        let pattern = trim_source(&self.source_url);
        let source = trim_source(source);
        if pattern.is_empty() || source.is_empty() {
            return false;
        }

        if pattern.eq_ignore_ascii_case(source) {
            return true;
        }

        match WildcardPattern::parse(pattern) {
            Some(wildcard) => wildcard.matches(source),
            None => false,
        }
    }
}

/// A fetched allow list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListDocument {
    #[serde(rename = "Entries", alias = "entries", default)]
    pub entries: Vec<AllowListEntry>,
}

impl AllowListDocument {
    /// Parse a document from JSON text.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Check if `(source, directive)` is pre-approved.
    pub fn contains(&self, source: &str, directive: Directive) -> bool {
        self.entries
            .iter()
            .any(|e| e.allows_directive(directive) && e.matches_source(source))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn trim_source(value: &str) -> &str {
    value.trim().trim_end_matches('/')
}

struct WildcardPattern<'a> {
    scheme: Option<&'a str>,
    domain: &'a str,
    port: Option<u16>,
}

impl<'a> WildcardPattern<'a> {
    fn parse(pattern: &'a str) -> Option<Self> {
        let (scheme, rest) = match pattern.find("://") {
            Some(idx) => (Some(&pattern[..idx]), &pattern[idx + 3..]),
            None => (None, pattern),
        };

        let rest = rest.strip_prefix("*.")?;
        let (domain, port) = match rest.rsplit_once(':') {
            Some((domain, port)) => (domain, Some(port.parse().ok()?)),
            None => (rest, None),
        };

        if domain.is_empty() || domain.contains('/') {
            return None;
        }

        Some(Self {
            scheme,
            domain,
            port,
        })
    }

    fn matches(&self, source: &str) -> bool {
        let candidate = if source.contains("://") {
            source.to_string()
        } else {
            format!("{}://{}", self.scheme.unwrap_or("https"), source)
        };

        let Ok(url) = Url::parse(&candidate) else {
            return false;
        };

        if let Some(scheme) = self.scheme {
            if !url.scheme().eq_ignore_ascii_case(scheme) {
                return false;
            }
        }

        if let Some(port) = self.port {
            if url.port_or_known_default() != Some(port) {
                return false;
            }
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let suffix = format!(".{}", self.domain.to_ascii_lowercase());
        host.len() > suffix.len() && host.ends_with(&suffix)
    }
}
