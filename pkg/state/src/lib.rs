//! Shared coordination store used by every coordinator instance.
//!
//! The lease logic only talks to [`client::CoordinationStore`]; the
//! Redis backend is used in production and the in-memory one in tests.

pub mod client;
pub mod memory;
pub mod redis_store;
pub mod scripts;
