//! Persistence seam for admin-owned policy data.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{SecurityError, SecurityResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::headers::SecurityHeaderSettings;
use crate::policy::{PermissionRule, PolicySettings};
use crate::sandbox::SandboxSettings;

/// Reads and writes policy data.
///
/// A successful `save_*` means the write is committed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn settings(&self) -> SecurityResult<PolicySettings>;

    async fn save_settings(&self, settings: PolicySettings) -> SecurityResult<()>;

    async fn permissions(&self) -> SecurityResult<Vec<PermissionRule>>;

    /// Find the rule for a source, ignoring ASCII case.
    async fn permission_for_source(&self, source: &str) -> SecurityResult<Option<PermissionRule>>;

    /// Insert or replace a rule by id.
    async fn save_permission(&self, rule: PermissionRule) -> SecurityResult<()>;

    async fn delete_permission(&self, id: Uuid) -> SecurityResult<()>;

    async fn header_settings(&self) -> SecurityResult<SecurityHeaderSettings>;

    async fn save_header_settings(&self, settings: SecurityHeaderSettings) -> SecurityResult<()>;

    async fn sandbox(&self) -> SecurityResult<SandboxSettings>;

    async fn save_sandbox(&self, sandbox: SandboxSettings) -> SecurityResult<()>;
}

/// A complete copy of the policy data, as loaded from or saved to JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub settings: PolicySettings,
    pub permissions: Vec<PermissionRule>,
    pub headers: SecurityHeaderSettings,
    pub sandbox: SandboxSettings,
}

/// Process-local store backed by a lock-protected snapshot.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    data: RwLock<PolicySnapshot>,
    offline: AtomicBool,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
            offline: AtomicBool::new(false),
        }
    }

    /// Copy of the current data.
    pub fn snapshot(&self) -> PolicySnapshot {
        self.data.read().clone()
    }

    /// Simulate the backing database going away. Every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> SecurityResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SecurityError::persistence("policy store is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn settings(&self) -> SecurityResult<PolicySettings> {
        self.check_online()?;
        Ok(self.data.read().settings.clone())
    }

    async fn save_settings(&self, settings: PolicySettings) -> SecurityResult<()> {
        self.check_online()?;
        self.data.write().settings = settings;
        Ok(())
    }

    async fn permissions(&self) -> SecurityResult<Vec<PermissionRule>> {
        self.check_online()?;
        Ok(self.data.read().permissions.clone())
    }

    async fn permission_for_source(&self, source: &str) -> SecurityResult<Option<PermissionRule>> {
        self.check_online()?;
        Ok(self
            .data
            .read()
            .permissions
            .iter()
            .find(|r| r.is_for_source(source))
            .cloned())
    }

    async fn save_permission(&self, rule: PermissionRule) -> SecurityResult<()> {
        self.check_online()?;
        let mut data = self.data.write();
        match data.permissions.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => data.permissions.push(rule),
        }
        Ok(())
    }

    async fn delete_permission(&self, id: Uuid) -> SecurityResult<()> {
        self.check_online()?;
        let mut data = self.data.write();
        let before = data.permissions.len();
        data.permissions.retain(|r| r.id != id);
        if data.permissions.len() == before {
            return Err(SecurityError::not_found(format!("permission {}", id)));
        }
        Ok(())
    }

    async fn header_settings(&self) -> SecurityResult<SecurityHeaderSettings> {
        self.check_online()?;
        Ok(self.data.read().headers.clone())
    }

    async fn save_header_settings(&self, settings: SecurityHeaderSettings) -> SecurityResult<()> {
        self.check_online()?;
        self.data.write().headers = settings;
        Ok(())
    }

    async fn sandbox(&self) -> SecurityResult<SandboxSettings> {
        self.check_online()?;
        Ok(self.data.read().sandbox.clone())
    }

    async fn save_sandbox(&self, sandbox: SandboxSettings) -> SecurityResult<()> {
        self.check_online()?;
        self.data.write().sandbox = sandbox;
        Ok(())
    }
}
