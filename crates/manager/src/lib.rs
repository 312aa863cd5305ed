//! CSP Manager - security header management with a self-healing allow list.
//!
//! This crate integrates the policy components:
//! - Header compilation and per-response nonces
//! - Validated admin mutations
//! - Violation reporting and allow-list promotion
//! - Configuration

pub mod admin;
pub mod compilation;
pub mod config;
pub mod engine;

pub use admin::PolicyAdmin;
pub use compilation::{HeaderCompilationService, ResponseHeaders};
pub use config::ManagerConfig;
pub use engine::{CspManager, CspManagerBuilder};

/// Manager version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
