//! Caches for compiled headers and fetched documents.

pub mod compiled;
pub mod ttl_cache;

pub use compiled::CompiledHeaderCache;
pub use ttl_cache::TtlCache;
