//! The closed CSP directive vocabulary.

use std::fmt;
use std::str::FromStr;

use common::{SecurityError, SecurityResult};
use serde::{Deserialize, Serialize};

/// A fetch or navigation directive that a permission rule may grant.
///
/// Variant order is the emission order of the compiled policy, so
/// `default-src` always comes first. `Ord` follows declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directive {
    DefaultSrc,
    BaseUri,
    ChildSrc,
    ConnectSrc,
    FontSrc,
    FormAction,
    FrameAncestors,
    FrameSrc,
    ImgSrc,
    ManifestSrc,
    MediaSrc,
    ObjectSrc,
    ScriptSrc,
    ScriptSrcAttr,
    ScriptSrcElem,
    StyleSrc,
    StyleSrcAttr,
    StyleSrcElem,
    WorkerSrc,
}

impl Directive {
    /// Every directive, in emission order.
    pub const ALL: [Directive; 19] = [
        Directive::DefaultSrc,
        Directive::BaseUri,
        Directive::ChildSrc,
        Directive::ConnectSrc,
        Directive::FontSrc,
        Directive::FormAction,
        Directive::FrameAncestors,
        Directive::FrameSrc,
        Directive::ImgSrc,
        Directive::ManifestSrc,
        Directive::MediaSrc,
        Directive::ObjectSrc,
        Directive::ScriptSrc,
        Directive::ScriptSrcAttr,
        Directive::ScriptSrcElem,
        Directive::StyleSrc,
        Directive::StyleSrcAttr,
        Directive::StyleSrcElem,
        Directive::WorkerSrc,
    ];

    /// Get the directive name as it appears in the header.
    pub fn name(&self) -> &'static str {
        match self {
            Directive::DefaultSrc => "default-src",
            Directive::BaseUri => "base-uri",
            Directive::ChildSrc => "child-src",
            Directive::ConnectSrc => "connect-src",
            Directive::FontSrc => "font-src",
            Directive::FormAction => "form-action",
            Directive::FrameAncestors => "frame-ancestors",
            Directive::FrameSrc => "frame-src",
            Directive::ImgSrc => "img-src",
            Directive::ManifestSrc => "manifest-src",
            Directive::MediaSrc => "media-src",
            Directive::ObjectSrc => "object-src",
            Directive::ScriptSrc => "script-src",
            Directive::ScriptSrcAttr => "script-src-attr",
            Directive::ScriptSrcElem => "script-src-elem",
            Directive::StyleSrc => "style-src",
            Directive::StyleSrcAttr => "style-src-attr",
            Directive::StyleSrcElem => "style-src-elem",
            Directive::WorkerSrc => "worker-src",
        }
    }

    /// Parse a directive from its name, ignoring case and surrounding whitespace.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name().eq_ignore_ascii_case(name))
    }

    /// Whether browsers fall back to `default-src` when this directive is absent.
    pub fn falls_back_to_default(&self) -> bool {
        !matches!(
            self,
            Directive::DefaultSrc
                | Directive::BaseUri
                | Directive::FormAction
                | Directive::FrameAncestors
        )
    }

    /// Directives that carry a per-response nonce for scripts.
    pub fn script_nonce_targets() -> &'static [Directive] {
        &[Directive::ScriptSrc, Directive::ScriptSrcElem]
    }

    /// Directives that carry a per-response nonce for styles.
    pub fn style_nonce_targets() -> &'static [Directive] {
        &[Directive::StyleSrc, Directive::StyleSrcElem]
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Directive {
    type Err = SecurityError;

    fn from_str(s: &str) -> SecurityResult<Self> {
        Self::from_name(s)
            .ok_or_else(|| SecurityError::validation(format!("unknown directive '{}'", s.trim())))
    }
}
