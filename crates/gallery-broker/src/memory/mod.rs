//! In-memory broker.

pub mod store;

pub use store::MemoryBroker;
