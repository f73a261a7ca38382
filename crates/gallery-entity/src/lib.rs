//! # gallery-entity
//!
//! Domain entities for the gallery job scheduler. Every struct in this crate
//! is a value stored in, or reported from, the broker. All entities derive
//! `Debug`, `Clone`, `Serialize`, and `Deserialize`.

pub mod job;
