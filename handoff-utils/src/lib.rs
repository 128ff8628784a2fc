//! Utility library for the handoff project

pub mod other;
pub mod serde;
