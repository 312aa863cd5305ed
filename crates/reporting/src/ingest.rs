//! Parsing of browser violation reports.
//!
//! Two wire shapes are accepted:
//! - legacy `application/csp-report`: `{"csp-report": {"blocked-uri": .., "violated-directive": ..}}`
//! - batched `application/reports+json`: `[{"type": "csp-violation", "body": {"blockedURL": .., "effectiveDirective": ..}}]`
//!
//! Parsers are tried in priority order; anything none of them accepts is dropped.

use chrono::{DateTime, Utc};
use csp_security::Directive;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

pub const LEGACY_CONTENT_TYPE: &str = "application/csp-report";
pub const BATCHED_CONTENT_TYPE: &str = "application/reports+json";

const BLOCKED_KEYS: [&str; 4] = ["blocked-uri", "blockedURL", "blockedUri", "blocked_uri"];
const EFFECTIVE_KEYS: [&str; 3] = ["effective-directive", "effectiveDirective", "effective_directive"];
const VIOLATED_KEYS: [&str; 3] = ["violated-directive", "violatedDirective", "violated_directive"];
const LEGACY_WRAPPER_KEYS: [&str; 2] = ["csp-report", "cspReport"];
const BATCHED_BODY_KEYS: [&str; 3] = ["body", "csp-report", "cspReport"];

/// A violation exactly as the browser described it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawViolation {
    pub blocked_uri: String,
    pub directive: String,
}

/// A canonical violation: validated directive, cleaned-up source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub source: String,
    pub directive: Directive,
    pub reported_at: DateTime<Utc>,
}

impl Violation {
    /// Canonicalize a raw report. Returns `None` when it cannot be attributed
    /// to a known directive and a usable source.
    pub fn from_raw(raw: &RawViolation, reported_at: DateTime<Utc>) -> Option<Self> {
        let directive = canonical_directive(&raw.directive)?;
        let source = canonical_source(&raw.blocked_uri)?;
        Some(Self {
            source,
            directive,
            reported_at,
        })
    }
}

type Parser = fn(&Value) -> Option<Vec<RawViolation>>;

/// Turns request bodies into canonical violations.
#[derive(Clone, Debug, Default)]
pub struct ViolationIngestor;

impl ViolationIngestor {
    pub fn new() -> Self {
        Self
    }

    /// Parse a request body. Never fails: malformed input yields no violations.
    pub fn ingest(&self, content_type: Option<&str>, body: &[u8]) -> Vec<Violation> {
        let now = Utc::now();
        self.parse(content_type, body)
            .iter()
            .filter_map(|raw| {
                let violation = Violation::from_raw(raw, now);
                if violation.is_none() {
                    debug!(directive = %raw.directive, "Discarding unattributable violation");
                }
                violation
            })
            .collect()
    }

    /// Parse a request body into raw violations.
    pub fn parse(&self, content_type: Option<&str>, body: &[u8]) -> Vec<RawViolation> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!("Discarding malformed violation report: {}", e);
                return Vec::new();
            }
        };

        let batched_first = content_type
            .map(|ct| media_type(ct) == BATCHED_CONTENT_TYPE)
            .unwrap_or(false);
        let chain: [Parser; 2] = if batched_first {
            [parse_batched, parse_legacy]
        } else {
            [parse_legacy, parse_batched]
        };

        chain
            .iter()
            .find_map(|parser| parser(&value))
            .unwrap_or_default()
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn parse_legacy(value: &Value) -> Option<Vec<RawViolation>> {
    let object = value.as_object()?;
    let report = LEGACY_WRAPPER_KEYS
        .iter()
        .find_map(|k| object.get(*k))?
        .as_object()?;
    Some(violation_from_body(report).into_iter().collect())
}

fn parse_batched(value: &Value) -> Option<Vec<RawViolation>> {
    let reports: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(object) if BATCHED_BODY_KEYS.iter().any(|k| object.contains_key(*k)) => {
            vec![value]
        }
        _ => return None,
    };

    Some(
        reports
            .into_iter()
            .filter_map(|report| {
                let report = report.as_object()?;
                let kind = report.get("type").and_then(Value::as_str);
                if kind.is_some_and(|k| k != "csp-violation") {
                    return None;
                }
                let body = BATCHED_BODY_KEYS
                    .iter()
                    .find_map(|k| report.get(*k))?
                    .as_object()?;
                violation_from_body(body)
            })
            .collect(),
    )
}

fn violation_from_body(body: &Map<String, Value>) -> Option<RawViolation> {
    let blocked_uri = first_str(body, &BLOCKED_KEYS)?;
    let directive = first_str(body, &EFFECTIVE_KEYS).or_else(|| first_str(body, &VIOLATED_KEYS))?;
    Some(RawViolation {
        blocked_uri: blocked_uri.to_string(),
        directive: directive.to_string(),
    })
}

fn first_str<'a>(body: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| body.get(*k).and_then(Value::as_str))
        .find(|v| !v.trim().is_empty())
}

/// Older browsers report the whole directive text; only the name counts.
pub fn canonical_directive(raw: &str) -> Option<Directive> {
    raw.split_whitespace().next().and_then(Directive::from_name)
}

/// Clean up a reported blocked resource.
///
/// Keyword reports (`inline`, `eval`, ...) become quoted keywords, bare scheme
/// reports become scheme sources, network URLs lose credentials, query and
/// fragment. Anything else is unusable.
pub fn canonical_source(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let keyword = match raw.to_ascii_lowercase().as_str() {
        "inline" => Some("'unsafe-inline'"),
        "eval" => Some("'unsafe-eval'"),
        "wasm-eval" => Some("'wasm-unsafe-eval'"),
        "self" | "'self'" => Some("'self'"),
        "data" | "data:" => Some("data:"),
        "blob" | "blob:" => Some("blob:"),
        "mediastream" | "mediastream:" => Some("mediastream:"),
        "filesystem" | "filesystem:" => Some("filesystem:"),
        _ => None,
    };
    if let Some(keyword) = keyword {
        return Some(keyword.to_string());
    }

    let mut url = Url::parse(raw).ok()?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => {
            url.host_str()?;
            url.set_query(None);
            url.set_fragment(None);
            url.set_username("").ok()?;
            url.set_password(None).ok()?;

            let serialized = url.to_string();
            if url.path() == "/" {
                Some(serialized.trim_end_matches('/').to_string())
            } else {
                Some(serialized)
            }
        }
        scheme => Some(format!("{}:", scheme)),
    }
}
