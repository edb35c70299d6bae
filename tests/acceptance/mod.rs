//! Integration tests for gpio-rtt acceptance testing.

mod common;
mod config_test;
mod line_test;
mod posture_test;
mod round_trip_test;
mod statistics_test;
