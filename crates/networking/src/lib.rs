//! Outbound networking for the self-healing allow list.
//!
//! This crate handles:
//! - Fetching documents over HTTP(S) with bounded timeouts
//! - The published allow-list document format and its matching rules
//! - Containment and validity checks against a configured allow list

pub mod allow_list;
pub mod client;
pub mod service;

pub use allow_list::{AllowListDocument, AllowListEntry};
pub use client::{ClientConfig, ClientError, DocumentFetcher, HttpClient};
pub use service::{AllowListConfig, AllowListService};
