//! Common types shared by the CSP manager crates.

pub mod error;

pub use error::{SecurityError, SecurityResult};
