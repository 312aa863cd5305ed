//! Source expressions permitted inside a directive.

use std::fmt;

use common::{SecurityError, SecurityResult};

/// Keywords that must appear single-quoted in a policy.
const KEYWORDS: [&str; 8] = [
    "self",
    "none",
    "unsafe-inline",
    "unsafe-eval",
    "unsafe-hashes",
    "strict-dynamic",
    "wasm-unsafe-eval",
    "report-sample",
];

const HASH_PREFIXES: [&str; 3] = ["sha256-", "sha384-", "sha512-"];

/// A validated CSP source expression.
///
/// Only values that survive [`CspSource::parse`] are ever written into a
/// response header.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CspSource {
    /// A quoted keyword such as `'self'`.
    Keyword(&'static str),
    /// A hash source such as `'sha256-...'`.
    Hash(String),
    /// Scheme source (e.g., "https:")
    Scheme(String),
    /// Host source (e.g., "https://cdn.example.com", "*.example.com")
    Host(String),
}

impl CspSource {
    /// Keyword source for `'self'`.
    pub const SELF: CspSource = CspSource::Keyword("self");
    /// Keyword source for `'strict-dynamic'`.
    pub const STRICT_DYNAMIC: CspSource = CspSource::Keyword("strict-dynamic");

    /// Parse and validate a raw source token.
    ///
    /// Bare keywords are accepted in either form (`self` or `'self'`).
    /// Whitespace, control characters and header separators are rejected.
    pub fn parse(raw: &str) -> SecurityResult<Self> {
        if raw.is_empty() {
            return Err(SecurityError::validation("source must not be empty"));
        }

        if let Some(bad) = raw
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | ',' | '"'))
        {
            return Err(SecurityError::validation(format!(
                "source contains forbidden character {:?}",
                bad
            )));
        }

        let quoted = raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'');
        let inner = if quoted { &raw[1..raw.len() - 1] } else { raw };

        if let Some(keyword) = KEYWORDS.iter().find(|k| k.eq_ignore_ascii_case(inner)) {
            return Ok(CspSource::Keyword(*keyword));
        }

        if quoted {
            let lower = inner.to_ascii_lowercase();
            if HASH_PREFIXES.iter().any(|p| lower.starts_with(p)) && inner.len() > 7 {
                return Ok(CspSource::Hash(inner.to_string()));
            }
            return Err(SecurityError::validation(format!(
                "unsupported quoted source '{}'",
                inner
            )));
        }

        if raw.contains('\'') {
            return Err(SecurityError::validation("source contains a stray quote"));
        }

        if let Some(scheme) = raw.strip_suffix(':') {
            if is_scheme(scheme) {
                return Ok(CspSource::Scheme(scheme.to_ascii_lowercase()));
            }
            return Err(SecurityError::validation(format!("invalid scheme source '{}'", raw)));
        }

        if let Some(idx) = raw.find("://") {
            let (scheme, rest) = (&raw[..idx], &raw[idx + 3..]);
            if !is_scheme(scheme) || rest.is_empty() || rest.starts_with('/') {
                return Err(SecurityError::validation(format!("invalid host source '{}'", raw)));
            }
        }

        Ok(CspSource::Host(raw.to_string()))
    }

    /// Check if this is a quoted keyword.
    pub fn is_keyword(&self) -> bool {
        matches!(self, CspSource::Keyword(_))
    }
}

impl fmt::Display for CspSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CspSource::Keyword(k) => write!(f, "'{}'", k),
            CspSource::Hash(h) => write!(f, "'{}'", h),
            CspSource::Scheme(s) => write!(f, "{}:", s),
            CspSource::Host(h) => f.write_str(h),
        }
    }
}

fn is_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
