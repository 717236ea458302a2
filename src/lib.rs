//! Strata - Consistent Redis cache overlay with delayed-delete invalidation.
//!
//! Strata sits between an application and a Redis-compatible store and keeps
//! the cache consistent with a slower authoritative data source (typically a
//! relational database). All cross-process coordination happens inside Redis
//! through a small set of atomic Lua scripts; the library itself holds no
//! global state beyond an in-process single-flight table.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Application                             │
//! │   fetch / fetch_batch   │   tag_as_deleted   │   raw + locks    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Fetch Engines                            │
//! │   single-flight │ weak/strong state machines │ batch partition  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Script Library                            │
//! │        EVALSHA dispatch │ NOSCRIPT reload │ inline EVAL         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Redis                                │
//! │       hash per key: value │ lockUntil │ lockOwner │ TTL         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::options`] - Client configuration and validation
//! - [`core::error`] - Error types
//! - [`core::time`] - Lock clock and owner identity
//!
//! ## Coordination
//! - [`script`] - Atomic Lua script library and dispatch
//! - [`cache`] - Client surface: fetch engines, tombstones, escalation
//! - [`codec`] - Typed values over the string cache
//!
//! # Key Invariants
//!
//! - **SINGLE-WRITER**: per key, only the most recently granted lock owner
//!   can install a value; stale recomputes are discarded by owner mismatch
//! - **TOMBSTONE-VISIBLE**: a tagged-as-deleted value stays readable to weak
//!   readers until a newer recompute commits or the delay TTL expires
//! - **RE-ARMED-WAIT**: waiters re-arm their sleep after each probe, so the
//!   wait cadence is never shortened by script round-trip time
//! - **JITTERED-TTL**: effective TTLs are randomly reduced to spread mass
//!   expiry of keys written together

// Core infrastructure
pub mod core;

// Atomic script library
pub mod script;

// Client surface and fetch engines
pub mod cache;

// Typed values over the string cache
pub mod codec;

// Re-exports for convenience
pub use crate::cache::Client;
pub use crate::codec::{Codec, JsonCodec};
pub use crate::core::error::{FetchError, StrataError, StrataResult};
pub use crate::core::options::Options;
