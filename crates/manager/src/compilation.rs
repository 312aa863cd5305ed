//! Per-response header assembly.

use std::sync::Arc;

use cache::CompiledHeaderCache;
use common::SecurityResult;
use csp_security::{
    CompiledHeaderSet, CompilerOptions, Directive, DirectiveCompiler, HeaderSet, Nonce,
    NonceGenerator, PolicyStore,
};
use tracing::{error, warn};

/// Headers for one response.
#[derive(Debug, Default)]
pub struct ResponseHeaders {
    pub headers: HeaderSet,
    /// The nonce spliced into the CSP, for the page's inline scripts.
    pub nonce: Option<Nonce>,
}

/// Builds the security headers for outbound responses.
///
/// The nonce-free skeleton is compiled once per cache generation; each
/// response gets a copy with its own nonce.
pub struct HeaderCompilationService {
    store: Arc<dyn PolicyStore>,
    cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
    cache_key: String,
    compiler: DirectiveCompiler,
    nonces: NonceGenerator,
    apply_to_styles: bool,
}

impl HeaderCompilationService {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        cache: Arc<CompiledHeaderCache<CompiledHeaderSet>>,
        cache_key: impl Into<String>,
        options: CompilerOptions,
        apply_to_styles: bool,
    ) -> Self {
        Self {
            store,
            cache,
            cache_key: cache_key.into(),
            compiler: DirectiveCompiler::new(options),
            nonces: NonceGenerator::new(),
            apply_to_styles,
        }
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Headers for one response.
    ///
    /// Never fails. If the policy cannot be read, the last good skeleton is
    /// served; without one, no headers are.
    pub async fn headers(&self) -> ResponseHeaders {
        let skeleton = match self
            .cache
            .get_or_compute(&self.cache_key, |version| self.compile_skeleton(version))
            .await
        {
            Ok(skeleton) => skeleton,
            Err(e) => match self.cache.last_good(&self.cache_key) {
                Some(skeleton) => {
                    warn!(key = %self.cache_key, version = skeleton.version, "Serving last good headers: {}", e);
                    skeleton
                }
                None => {
                    error!(key = %self.cache_key, "Omitting security headers: {}", e);
                    return ResponseHeaders::default();
                }
            },
        };

        let nonce = if skeleton.needs_nonce() {
            match self.nonces.generate() {
                Ok(nonce) => Some(nonce),
                Err(e) => {
                    error!("Serving policy without a nonce: {}", e);
                    None
                }
            }
        } else {
            None
        };

        ResponseHeaders {
            headers: skeleton.render(nonce.as_ref()),
            nonce,
        }
    }

    /// Read the policy data and build the nonce-free skeleton.
    pub async fn compile_skeleton(&self, version: u64) -> SecurityResult<CompiledHeaderSet> {
        let settings = self.store.settings().await?;
        let rules = self.store.permissions().await?;
        let sandbox = self.store.sandbox().await?;
        let header_settings = self.store.header_settings().await?;

        let policy = self.compiler.compile(&settings, &rules, &sandbox);
        let mut skeleton = CompiledHeaderSet::new(version, &settings, policy, self.nonce_targets());
        header_settings.apply_to(&mut skeleton.headers);
        Ok(skeleton)
    }

    fn nonce_targets(&self) -> Vec<Directive> {
        let mut targets = Directive::script_nonce_targets().to_vec();
        if self.apply_to_styles {
            targets.extend_from_slice(Directive::style_nonce_targets());
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csp_security::headers::{names, XFrameOptions};
    use csp_security::{InMemoryPolicyStore, PermissionRule, PolicySettings, SecurityHeaderSettings};

    async fn service(store: Arc<InMemoryPolicyStore>, apply_to_styles: bool) -> HeaderCompilationService {
        HeaderCompilationService::new(
            store,
            Arc::new(CompiledHeaderCache::new()),
            "site",
            CompilerOptions::default(),
            apply_to_styles,
        )
    }

    async fn seeded(nonce: bool) -> Arc<InMemoryPolicyStore> {
        let store = Arc::new(InMemoryPolicyStore::new());
        let mut settings = PolicySettings::enabled();
        settings.is_nonce_enabled = nonce;
        store.save_settings(settings).await.unwrap();
        store
            .save_permission(PermissionRule::new("self", [Directive::ScriptSrc, Directive::StyleSrc]))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_headers_without_nonce() {
        let service = service(seeded(false).await, false).await;
        let response = service.headers().await;

        assert!(response.nonce.is_none());
        assert_eq!(
            response.headers.get(names::CONTENT_SECURITY_POLICY),
            Some("script-src 'self'; style-src 'self'")
        );
    }

    #[tokio::test]
    async fn test_nonce_goes_to_scripts_only_by_default() {
        let service = service(seeded(true).await, false).await;
        let response = service.headers().await;

        let nonce = response.nonce.unwrap();
        let expected = format!("script-src 'self' 'nonce-{}'; style-src 'self'", nonce.as_str());
        assert_eq!(response.headers.get(names::CONTENT_SECURITY_POLICY), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_nonce_applied_to_styles_when_configured() {
        let service = service(seeded(true).await, true).await;
        let response = service.headers().await;

        let nonce = response.nonce.unwrap();
        let expression = nonce.source_expression();
        let csp = response.headers.get(names::CONTENT_SECURITY_POLICY).unwrap();
        assert_eq!(csp.matches(expression.as_str()).count(), 2);
    }

    #[tokio::test]
    async fn test_cached_skeleton_never_holds_a_nonce() {
        let service = service(seeded(true).await, false).await;
        let response = service.headers().await;
        let nonce = response.nonce.unwrap();

        let skeleton = service.cache.peek("site").unwrap();
        let (_, value) = skeleton.headers.content_security_policy().unwrap();
        assert!(!value.contains(nonce.as_str()));
    }

    #[tokio::test]
    async fn test_auxiliary_headers() {
        let store = seeded(false).await;
        let mut headers = SecurityHeaderSettings::default();
        headers.x_frame_options = XFrameOptions::Deny;
        headers.is_strict_transport_security_enabled = true;
        headers.strict_transport_security_max_age = 31536000;
        store.save_header_settings(headers).await.unwrap();

        let response = service(store, false).await.headers().await;
        assert_eq!(response.headers.get(names::X_FRAME_OPTIONS), Some("DENY"));
        assert_eq!(
            response.headers.get(names::STRICT_TRANSPORT_SECURITY),
            Some("max-age=31536000")
        );
        assert!(!response.headers.contains(names::REFERRER_POLICY));
    }

    #[tokio::test]
    async fn test_offline_store_falls_back_to_last_good() {
        let store = seeded(false).await;
        let service = service(store.clone(), false).await;
        let before = service.headers().await;

        service.cache.invalidate("site");
        store.set_offline(true);

        let after = service.headers().await;
        assert_eq!(after.headers, before.headers);
    }

    #[tokio::test]
    async fn test_offline_store_without_last_good_omits_headers() {
        let store = seeded(false).await;
        store.set_offline(true);

        let response = service(store, false).await.headers().await;
        assert!(response.headers.is_empty());
        assert!(response.nonce.is_none());
    }
}
