//! # Bifrost Test Suite
//!
//! Scenarios spanning more than one crate.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── bus_benchmarks.rs   # criterion: publish fan-out, request round trip, cache
//! └── src/integration/
//!     ├── pubsub_flows.rs     # ordering, isolation, correlation across threads
//!     ├── galactic_flows.rs   # bridge + loopback broker + servbot
//!     └── cache_flows.rs      # cache change and mutation protocol over a shared bus
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bifrost-tests integration::
//! cargo bench -p bifrost-tests
//! ```

pub mod integration;
