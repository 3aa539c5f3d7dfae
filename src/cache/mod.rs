//! In-process caching for derived repository views.

pub mod ttl;

pub use ttl::TtlCache;
