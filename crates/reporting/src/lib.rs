//! Violation reporting and the self-healing allow-list loop.
//!
//! This crate handles:
//! - Parsing browser violation reports (legacy `report-uri` and batched `report-to`)
//! - Normalizing reported sources and directives
//! - Recording violations and summarizing them for the admin surface
//! - Promoting allow-listed violations into the live policy

pub mod endpoint;
pub mod ingest;
pub mod normalize;
pub mod reconciler;
pub mod store;
pub mod summary;

pub use endpoint::{ReportEndpoint, ReportReceipt};
pub use ingest::{RawViolation, Violation, ViolationIngestor};
pub use normalize::{IdentityNormalizer, OriginNormalizer, SourceNormalizer};
pub use reconciler::{AllowListReconciler, ReconcileOutcome, RuleWriteLock, ALLOW_LIST_ACTOR};
pub use store::{InMemoryViolationStore, ViolationRecord, ViolationStore};
pub use summary::{SummaryQuery, ViolationReportService, ViolationSummaryEntry};
