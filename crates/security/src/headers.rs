//! Auxiliary security response headers.
//!
//! Each admin setting is a closed enum with an explicit variant to literal
//! table. A `None` variant means the header is omitted.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Response header names.
pub mod names {
    pub const CONTENT_SECURITY_POLICY: &str = "Content-Security-Policy";
    pub const CONTENT_SECURITY_POLICY_REPORT_ONLY: &str = "Content-Security-Policy-Report-Only";
    pub const X_CONTENT_TYPE_OPTIONS: &str = "X-Content-Type-Options";
    pub const X_XSS_PROTECTION: &str = "X-XSS-Protection";
    pub const X_FRAME_OPTIONS: &str = "X-Frame-Options";
    pub const REFERRER_POLICY: &str = "Referrer-Policy";
    pub const CROSS_ORIGIN_EMBEDDER_POLICY: &str = "Cross-Origin-Embedder-Policy";
    pub const CROSS_ORIGIN_OPENER_POLICY: &str = "Cross-Origin-Opener-Policy";
    pub const CROSS_ORIGIN_RESOURCE_POLICY: &str = "Cross-Origin-Resource-Policy";
    pub const STRICT_TRANSPORT_SECURITY: &str = "Strict-Transport-Security";
}

macro_rules! header_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $literal:expr),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            None,
            $($variant,)*
        }

        impl $name {
            /// The header literal, or `None` when the header is omitted.
            pub fn header_value(&self) -> Option<&'static str> {
                match self {
                    $name::None => None,
                    $($name::$variant => Some($literal),)*
                }
            }
        }
    };
}

header_enum! {
    /// `X-Content-Type-Options`.
    XContentTypeOptions {
        NoSniff => "nosniff",
    }
}

header_enum! {
    /// `X-XSS-Protection`.
    XssProtection {
        Disabled => "0",
        Enabled => "1",
        EnabledWithBlocking => "1; mode=block",
    }
}

header_enum! {
    /// `X-Frame-Options`.
    XFrameOptions {
        Deny => "DENY",
        SameOrigin => "SAMEORIGIN",
    }
}

header_enum! {
    /// `Referrer-Policy`.
    ReferrerPolicy {
        NoReferrer => "no-referrer",
        NoReferrerWhenDowngrade => "no-referrer-when-downgrade",
        Origin => "origin",
        OriginWhenCrossOrigin => "origin-when-cross-origin",
        SameOrigin => "same-origin",
        StrictOrigin => "strict-origin",
        StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
        UnsafeUrl => "unsafe-url",
    }
}

header_enum! {
    /// `Cross-Origin-Embedder-Policy`.
    CrossOriginEmbedderPolicy {
        UnsafeNone => "unsafe-none",
        RequireCorp => "require-corp",
        Credentialless => "credentialless",
    }
}

header_enum! {
    /// `Cross-Origin-Opener-Policy`.
    CrossOriginOpenerPolicy {
        UnsafeNone => "unsafe-none",
        SameOriginAllowPopups => "same-origin-allow-popups",
        SameOrigin => "same-origin",
    }
}

header_enum! {
    /// `Cross-Origin-Resource-Policy`.
    CrossOriginResourcePolicy {
        SameSite => "same-site",
        SameOrigin => "same-origin",
        CrossOrigin => "cross-origin",
    }
}

/// Admin-owned auxiliary header settings (single row).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityHeaderSettings {
    pub x_content_type_options: XContentTypeOptions,
    pub xss_protection: XssProtection,
    pub x_frame_options: XFrameOptions,
    pub referrer_policy: ReferrerPolicy,
    pub cross_origin_embedder_policy: CrossOriginEmbedderPolicy,
    pub cross_origin_opener_policy: CrossOriginOpenerPolicy,
    pub cross_origin_resource_policy: CrossOriginResourcePolicy,
    pub is_strict_transport_security_enabled: bool,
    pub is_strict_transport_security_sub_domains_enabled: bool,
    pub strict_transport_security_max_age: u64,
    pub modified: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
}

impl SecurityHeaderSettings {
    /// The `Strict-Transport-Security` value, when enabled.
    pub fn strict_transport_security(&self) -> Option<String> {
        if !self.is_strict_transport_security_enabled {
            return None;
        }

        let mut value = format!("max-age={}", self.strict_transport_security_max_age);
        if self.is_strict_transport_security_sub_domains_enabled {
            value.push_str("; includeSubDomains");
        }
        Some(value)
    }

    /// Write every configured auxiliary header into `headers`.
    pub fn apply_to(&self, headers: &mut HeaderSet) {
        let table = [
            (names::X_CONTENT_TYPE_OPTIONS, self.x_content_type_options.header_value()),
            (names::X_XSS_PROTECTION, self.xss_protection.header_value()),
            (names::X_FRAME_OPTIONS, self.x_frame_options.header_value()),
            (names::REFERRER_POLICY, self.referrer_policy.header_value()),
            (
                names::CROSS_ORIGIN_EMBEDDER_POLICY,
                self.cross_origin_embedder_policy.header_value(),
            ),
            (
                names::CROSS_ORIGIN_OPENER_POLICY,
                self.cross_origin_opener_policy.header_value(),
            ),
            (
                names::CROSS_ORIGIN_RESOURCE_POLICY,
                self.cross_origin_resource_policy.header_value(),
            ),
        ];

        for (name, value) in table {
            if let Some(value) = value {
                headers.insert(name, value);
            }
        }

        if let Some(hsts) = self.strict_transport_security() {
            headers.insert(names::STRICT_TRANSPORT_SECURITY, hsts);
        }
    }
}

/// Response headers (case-insensitive lookup, order-preserving, original casing kept).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: IndexMap<String, (String, String)>,
}

impl HeaderSet {
    /// Create a new empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header. An empty value removes the header instead.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let key = name.to_ascii_lowercase();

        if value.is_empty() {
            self.headers.shift_remove(&key);
        } else {
            self.headers.insert(key, (name, value));
        }
    }

    /// Get a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Check if a header exists.
    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Remove a header.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.headers
            .shift_remove(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Get number of headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The CSP header present in this set, enforcing or report-only.
    pub fn content_security_policy(&self) -> Option<(&str, &str)> {
        [
            names::CONTENT_SECURITY_POLICY,
            names::CONTENT_SECURITY_POLICY_REPORT_ONLY,
        ]
        .into_iter()
        .find_map(|name| self.get(name).map(|value| (name, value)))
    }
}

impl fmt::Display for HeaderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}
