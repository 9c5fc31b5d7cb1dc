//! Umbrella crate for Gridlands.
//!
//! This crate is intentionally small: it re-exports the engine and protocol
//! crates so downstream code can depend on a single crate name (`gridlands`).

pub use gridlands_engine as engine;
pub use gridlands_protocol as protocol;
