//! Core type definitions used across the gallery workspace.

pub mod id;

pub use id::*;
