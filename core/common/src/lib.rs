//! Common utilities and types shared across the MusicHub core crates.
//!
//! This module provides the error taxonomy, the clock abstraction used by
//! time-sensitive policies, and the secret token wrapper.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, Result};
pub use types::{client_platform, SecretToken};
