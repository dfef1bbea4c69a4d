//! # Cohort Core
//!
//! Configuration and error types shared by the scheduler crate and the
//! `cohort` binary.

pub mod config;
pub mod error;

pub use config::{CohortConfig, NotifyConfig, SchedulerConfig};
pub use error::{CohortError, Result};
