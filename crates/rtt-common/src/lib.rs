#![doc = "Common types shared across the gpio-rtt workspace."]

pub mod config;
pub mod error;
pub mod state;
pub mod stats;
pub mod time;

pub use config::*;
pub use error::*;
pub use state::*;
pub use stats::*;
pub use time::*;
