//! Turning a reported source into the value promoted onto the policy.

use url::Url;

/// Maps a canonical violation source to the source a permission rule would grant.
///
/// Returning `None` means the source is never promoted.
pub trait SourceNormalizer: Send + Sync {
    fn normalize(&self, source: &str) -> Option<String>;
}

/// Promotes the bare origin of network URLs; keywords and scheme sources pass through.
#[derive(Clone, Copy, Debug, Default)]
pub struct OriginNormalizer;

impl SourceNormalizer for OriginNormalizer {
    fn normalize(&self, source: &str) -> Option<String> {
        let source = source.trim();
        if source.is_empty() {
            return None;
        }

        if source.starts_with('\'') || source.ends_with(':') {
            return Some(source.to_string());
        }

        let url = Url::parse(source).ok()?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return None;
        }
        Some(origin.ascii_serialization())
    }
}

/// Promotes the source exactly as reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityNormalizer;

impl SourceNormalizer for IdentityNormalizer {
    fn normalize(&self, source: &str) -> Option<String> {
        let source = source.trim();
        (!source.is_empty()).then(|| source.to_string())
    }
}
