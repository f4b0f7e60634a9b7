//! Test support utilities for end-to-end testing
//!
//! Runs a complete embedded broker with redelivery installed, driven by
//! tokio's clock so tests can pause and advance time.

pub mod harness;

pub use harness::{E2ETestHarness, TokioClock};
