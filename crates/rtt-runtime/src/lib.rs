#![doc = "Real-time measurement engine for gpio-rtt."]

pub mod pacing;
pub mod realtime;
pub mod responder;
pub mod stimulus;

pub use pacing::*;
pub use realtime::*;
pub use responder::*;
pub use stimulus::*;
