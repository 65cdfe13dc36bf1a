/// TTL-bounded singleflight cache.
pub mod ttl;

pub use ttl::TtlCache;
