//! # stemgate Common Library
//!
//! Shared code for the stemgate services including:
//! - Bootstrap configuration and resource limits
//! - Root folder resolution and managed directory layout
//! - Error types
//! - Clock abstraction used for time-dependent accounting

pub mod config;
pub mod error;
pub mod time;

pub use config::ResourceLimits;
pub use error::{Error, Result};
pub use time::{Clock, ManualClock, SystemClock};
