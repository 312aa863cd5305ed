//! Content Security Policy data model and compilation.
//!
//! This crate implements the pure parts of header management:
//! - The closed directive vocabulary and source validation
//! - Policy, permission, sandbox and auxiliary header settings
//! - The directive compiler and the cached, nonce-free header skeleton
//! - Per-response nonce generation
//! - The persistence seam for admin-owned data
//! - The audit trail of changes to that data

pub mod audit;
pub mod csp;
pub mod directive;
pub mod headers;
pub mod nonce;
pub mod policy;
pub mod sandbox;
pub mod source;
pub mod store;

pub use audit::{AuditChange, AuditEntry, AuditLog, AuditOperation, Auditable, InMemoryAuditLog};
pub use csp::{CompiledHeaderSet, CompilerOptions, DirectiveCompiler};
pub use directive::Directive;
pub use headers::{HeaderSet, SecurityHeaderSettings};
pub use nonce::{Nonce, NonceGenerator};
pub use policy::{PermissionRule, PolicySettings};
pub use sandbox::{SandboxFlags, SandboxSettings};
pub use source::CspSource;
pub use store::{InMemoryPolicyStore, PolicySnapshot, PolicyStore};
