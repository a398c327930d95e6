//! Distributed cache layer.
//!
//! - [`CacheService`]: namespaced get/set/delete/pattern/counter/batch
//!   operations that degrade to safe defaults when the store is down.
//! - [`keys`]: deterministic key generators and the globs that clear them.
//! - [`memo`]: cache-aside wrappers for async operations.
//! - [`Invalidator`]: pattern, tag, dependency and related invalidation.
//!
//! Keys are laid out as `[app_prefix]:[caller_prefix]:[key]`; tag and
//! dependency indices live under `tag:` and `dep:`.

pub mod invalidation;
pub mod keys;
pub mod memo;
mod service;

pub use invalidation::{DEFAULT_INDEX_TTL, Invalidator};
pub use keys::KeyPart;
pub use memo::{CacheEvict, CachePut, Cacheable, KeySource};
pub use service::{CacheOptions, CacheService};
