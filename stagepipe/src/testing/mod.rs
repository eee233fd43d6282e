//! Testing utilities for stagepipe pipelines.
//!
//! This module provides:
//! - Stages with observable behavior (producers, sinks, panicking stages)
//! - Monitors shared between a test and the stages it runs
//! - Assertions on run reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_fatal_for, assert_fully_stopped, assert_quit_by};
pub use fixtures::{quiet_config, StageMonitor};
pub use mocks::{AfterSequence, CountingStage, PanickingStage, RecordingSink, SequenceProducer};
