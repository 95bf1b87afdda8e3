//! Cross-crate integration scenarios.

pub mod cache_flows;
pub mod galactic_flows;
pub mod pubsub_flows;
