//! Infrastructure-backed brokers.
//!
//! The broker contract and the in-memory emulator live in `hanko-jobs-broker`.
//! This module provides the Redis Streams backend.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConnector, RedisStreamsSubscription};
