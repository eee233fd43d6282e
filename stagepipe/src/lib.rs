//! # Stagepipe
//!
//! A supervised, linear, multi-stage processing pipeline.
//!
//! Stagepipe connects stages into a chain and runs every stage instance on
//! its own task:
//!
//! - **Linear chains**: descriptors subscribe to their upstream by `StageId`
//!   and are resolved into a single ordered chain
//! - **Single-slot links**: adjacent stages exchange items over capacity-1
//!   channels, so a slow stage throttles everything upstream
//! - **Concurrency**: a stage can run several instances sharing one inbound
//!   link
//! - **Supervision**: a panicking instance is restarted up to a bound; past
//!   the bound the whole pipeline shuts down
//! - **Ordered shutdown**: instances are stopped one at a time and each stop
//!   is acknowledged before the next one is issued
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagepipe::prelude::*;
//!
//! let source = StageDescriptor::new(Reader::new());
//! let parse = StageDescriptor::replicable(Parser::default())
//!     .with_concurrency(4)
//!     .subscribe_to(source.id());
//! let store = StageDescriptor::new(Writer::new()).subscribe_to(parse.id());
//!
//! let report = Pipeline::new([store, source, parse])
//!     .run(|| println!("done"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod supervisor;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::errors::{
        PipelineError, PipelineValidationError, StageError, StageResult, SupervisionError,
        ValidationKind,
    };
    pub use crate::pipeline::{
        Pipeline, PipelineBuilder, RunReport, RunningPipeline, StageDescriptor, StageId,
        TerminationCause,
    };
    pub use crate::stages::{FnStage, Item, Replicate, Stage};
    pub use crate::supervisor::{SupervisionHandle, Supervisor};
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
