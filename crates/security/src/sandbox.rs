//! The CSP `sandbox` directive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Relaxations granted to a sandboxed document.
    ///
    /// An empty set is legal and means the fullest sandbox.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SandboxFlags: u32 {
        const ALLOW_DOWNLOADS = 1 << 0;
        const ALLOW_FORMS = 1 << 1;
        const ALLOW_MODALS = 1 << 2;
        const ALLOW_ORIENTATION_LOCK = 1 << 3;
        const ALLOW_POINTER_LOCK = 1 << 4;
        const ALLOW_POPUPS = 1 << 5;
        const ALLOW_POPUPS_TO_ESCAPE_SANDBOX = 1 << 6;
        const ALLOW_PRESENTATION = 1 << 7;
        const ALLOW_SAME_ORIGIN = 1 << 8;
        const ALLOW_SCRIPTS = 1 << 9;
        const ALLOW_TOP_NAVIGATION = 1 << 10;
        const ALLOW_TOP_NAVIGATION_BY_USER_ACTIVATION = 1 << 11;
        const ALLOW_TOP_NAVIGATION_TO_CUSTOM_PROTOCOLS = 1 << 12;
    }
}

const TOKENS: [(SandboxFlags, &str); 13] = [
    (SandboxFlags::ALLOW_DOWNLOADS, "allow-downloads"),
    (SandboxFlags::ALLOW_FORMS, "allow-forms"),
    (SandboxFlags::ALLOW_MODALS, "allow-modals"),
    (SandboxFlags::ALLOW_ORIENTATION_LOCK, "allow-orientation-lock"),
    (SandboxFlags::ALLOW_POINTER_LOCK, "allow-pointer-lock"),
    (SandboxFlags::ALLOW_POPUPS, "allow-popups"),
    (SandboxFlags::ALLOW_POPUPS_TO_ESCAPE_SANDBOX, "allow-popups-to-escape-sandbox"),
    (SandboxFlags::ALLOW_PRESENTATION, "allow-presentation"),
    (SandboxFlags::ALLOW_SAME_ORIGIN, "allow-same-origin"),
    (SandboxFlags::ALLOW_SCRIPTS, "allow-scripts"),
    (SandboxFlags::ALLOW_TOP_NAVIGATION, "allow-top-navigation"),
    (
        SandboxFlags::ALLOW_TOP_NAVIGATION_BY_USER_ACTIVATION,
        "allow-top-navigation-by-user-activation",
    ),
    (
        SandboxFlags::ALLOW_TOP_NAVIGATION_TO_CUSTOM_PROTOCOLS,
        "allow-top-navigation-to-custom-protocols",
    ),
];

impl SandboxFlags {
    /// Parse a single sandbox token.
    pub fn from_token(token: &str) -> Option<Self> {
        TOKENS
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(token.trim()))
            .map(|(flag, _)| *flag)
    }

    /// The tokens of this set, in a fixed order.
    pub fn tokens(&self) -> Vec<&'static str> {
        TOKENS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Admin-owned sandbox configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxSettings {
    pub is_sandbox_enabled: bool,
    #[serde(with = "token_list")]
    pub flags: SandboxFlags,
    pub modified: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
}

impl SandboxSettings {
    /// The `sandbox` segment, or `None` when the directive is switched off.
    pub fn directive_segment(&self) -> Option<String> {
        if !self.is_sandbox_enabled {
            return None;
        }

        let tokens = self.flags.tokens();
        if tokens.is_empty() {
            Some("sandbox".to_string())
        } else {
            Some(format!("sandbox {}", tokens.join(" ")))
        }
    }
}

mod token_list {
    use super::SandboxFlags;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(flags: &SandboxFlags, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        flags.tokens().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SandboxFlags, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tokens = Vec::<String>::deserialize(deserializer)?;
        tokens.iter().try_fold(SandboxFlags::empty(), |acc, token| {
            SandboxFlags::from_token(token)
                .map(|flag| acc | flag)
                .ok_or_else(|| D::Error::custom(format!("unknown sandbox token '{}'", token)))
        })
    }
}
