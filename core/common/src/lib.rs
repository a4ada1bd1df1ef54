//! Common utilities and types shared across the offline sync crates.
//!
//! This module provides the error taxonomy, identifiers and the clock
//! abstraction used throughout the codebase.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{DeviceId, EntityKey};
