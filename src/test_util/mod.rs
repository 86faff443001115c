//! Utilities for testing code that uses messaging. They are used for testing messaging itself,
//!  but they are also exported for application testing.

pub mod config;
pub mod listener;
pub mod socket;
