//! Content Security Policy compilation.

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::directive::Directive;
use crate::headers::{names, HeaderSet};
use crate::nonce::Nonce;
use crate::policy::{PermissionRule, PolicySettings};
use crate::sandbox::SandboxSettings;
use crate::source::CspSource;

const UPGRADE_INSECURE_REQUESTS: &str = "upgrade-insecure-requests";
const SEGMENT_SEPARATOR: &str = "; ";

/// Options that come from deployment configuration rather than admin data.
#[derive(Clone, Debug, Default)]
pub struct CompilerOptions {
    /// Appended as a `report-uri` segment when set.
    pub report_uri: Option<String>,
}

/// Turns permission rules and policy flags into a CSP header value.
///
/// The output never contains a nonce. Same input, same output.
#[derive(Clone, Debug, Default)]
pub struct DirectiveCompiler {
    options: CompilerOptions,
}

impl DirectiveCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    /// Compile the policy. An empty string means the header must be omitted.
    pub fn compile(
        &self,
        settings: &PolicySettings,
        rules: &[PermissionRule],
        sandbox: &SandboxSettings,
    ) -> String {
        if !settings.is_enabled || rules.is_empty() {
            return String::new();
        }

        let mut sources: IndexMap<Directive, IndexSet<CspSource>> = IndexMap::new();
        for directive in Directive::ALL {
            for rule in rules.iter().filter(|r| r.grants(directive)) {
                match CspSource::parse(&rule.source) {
                    Ok(source) => {
                        sources.entry(directive).or_default().insert(source);
                    }
                    Err(e) => {
                        warn!(rule = %rule.id, directive = %directive, "Skipping permission rule: {}", e);
                    }
                }
            }
        }

        if settings.is_strict_dynamic_enabled {
            if let Some(script) = sources.get_mut(&Directive::ScriptSrc) {
                script.insert(CspSource::STRICT_DYNAMIC);
            }
        }

        let mut segments: Vec<String> = sources
            .iter()
            .map(|(directive, list)| {
                let list: Vec<String> = list.iter().map(|s| s.to_string()).collect();
                format!("{} {}", directive, list.join(" "))
            })
            .collect();

        if settings.is_upgrade_insecure_requests_enabled {
            segments.push(UPGRADE_INSECURE_REQUESTS.to_string());
        }

        if let Some(sandbox) = sandbox.directive_segment() {
            segments.push(sandbox);
        }

        if let Some(uri) = self.options.report_uri.as_deref() {
            match CspSource::parse(uri) {
                Ok(_) if !segments.is_empty() => segments.push(format!("report-uri {}", uri)),
                Ok(_) => {}
                Err(e) => warn!("Ignoring configured report-uri: {}", e),
            }
        }

        let policy = segments.join(SEGMENT_SEPARATOR);
        debug!(segments = segments.len(), "Compiled content security policy");
        policy
    }
}

/// The cached, nonce-free header skeleton.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompiledHeaderSet {
    /// Cache generation this set was built under.
    pub version: u64,
    /// Finished headers; the CSP value (if any) has no nonce.
    pub headers: HeaderSet,
    /// Directives that receive a per-response nonce. Empty when nonces are off.
    pub nonce_targets: Vec<Directive>,
}

impl CompiledHeaderSet {
    /// Assemble the header set from a compiled policy.
    pub fn new(
        version: u64,
        settings: &PolicySettings,
        policy: String,
        nonce_targets: Vec<Directive>,
    ) -> Self {
        let mut headers = HeaderSet::new();
        if !policy.is_empty() {
            let name = if settings.is_report_only {
                names::CONTENT_SECURITY_POLICY_REPORT_ONLY
            } else {
                names::CONTENT_SECURITY_POLICY
            };
            headers.insert(name, policy);
        }

        let nonce_targets = if settings.is_nonce_enabled {
            nonce_targets
        } else {
            Vec::new()
        };

        Self {
            version,
            headers,
            nonce_targets,
        }
    }

    /// Whether responses built from this set need a nonce.
    pub fn needs_nonce(&self) -> bool {
        !self.nonce_targets.is_empty() && self.headers.content_security_policy().is_some()
    }

    /// Copy the headers for one response, splicing in the nonce if given.
    pub fn render(&self, nonce: Option<&Nonce>) -> HeaderSet {
        let mut headers = self.headers.clone();
        if let (Some(nonce), Some((name, value))) = (nonce, self.headers.content_security_policy()) {
            let spliced = splice_nonce(value, nonce, &self.nonce_targets);
            headers.insert(name.to_string(), spliced);
        }
        headers
    }
}

/// Append the nonce to every segment named in `targets` that exists in `policy`.
pub fn splice_nonce(policy: &str, nonce: &Nonce, targets: &[Directive]) -> String {
    let expression = nonce.source_expression();
    policy
        .split(SEGMENT_SEPARATOR)
        .map(|segment| {
            let name = segment.split(' ').next().unwrap_or_default();
            if targets.iter().any(|d| d.name() == name) {
                format!("{} {}", segment, expression)
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(SEGMENT_SEPARATOR)
}
