//! External stop sources for a pipeline run.
//!
//! This module provides:
//! - CancellationToken for stopping a run from application code
//! - wait_for_shutdown_signal for stopping a run on OS termination signals

mod signal;
mod token;

pub use signal::wait_for_shutdown_signal;
pub use token::CancellationToken;
