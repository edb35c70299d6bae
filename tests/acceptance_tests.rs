//! Acceptance tests for the gpio-rtt harness.
//!
//! These tests exercise the measurement pipeline end to end:
//! - Round-trip latency through a simulated responder
//! - Window statistics and reset behavior
//! - Line claims, timeouts, and release
//! - IRQ thread elevation against a fake `/proc`
//! - Configuration files and report serialization
//!
//! Tests marked `#[ignore]` need a real GPIO character device with the
//! bench wiring in place.

mod acceptance;
