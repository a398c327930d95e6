//! Distributed cache, invalidation and rate limiting.
//!
//! The [`store`] module talks to the backing key-value service, [`cache`]
//! layers typed cache-aside operations, key conventions and invalidation on
//! top of it, [`ratelimit`] builds request throttling from the same atomic
//! primitives, and [`http`] exposes both as axum middleware.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod infra;
pub mod ratelimit;
pub mod store;
