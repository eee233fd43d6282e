//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage descriptors with stable identities
//! - Chain resolution and validation
//! - Single-slot links between adjacent stages
//! - Per-instance execution loops
//! - The orchestrator that starts, supervises and stops a run

mod builder;
mod runtime;
mod spec;
mod wiring;
mod worker;


pub use builder::PipelineBuilder;
pub use runtime::{Pipeline, RunReport, RunningPipeline, TerminationCause};
pub use spec::{StageDescriptor, StageId};
pub use wiring::{wire, HandoffError, LinkedStage, StageLink, StagePosition, LINK_CAPACITY};
pub use worker::QuitNotice;
