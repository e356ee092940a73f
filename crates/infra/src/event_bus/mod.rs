//! Infrastructure-backed message bus implementations.
//!
//! The bus contract and the in-memory bus live in `smartproj-events`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsConfig};
