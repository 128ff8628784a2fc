//! Utility module for serde of types.

pub mod duration_secs;
