//! # gallery-broker
//!
//! Broker backends for the gallery job scheduler. Supports two providers:
//!
//! - **redis**: durable queues in Redis using the [redis](https://crates.io/crates/redis) crate
//! - **memory**: in-process queues for development and tests
//!
//! The provider is selected at runtime by [`BrokerConnector`], which owns the
//! bounded connect-retry policy.

pub mod broker;
pub mod connector;
pub mod keys;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use broker::Broker;
pub use connector::{BrokerConnection, BrokerConnector};
