//! Error types for the stagepipe framework.
//!
//! Errors fall into three groups:
//! - configuration errors detected while building the chain
//!   ([`PipelineValidationError`]),
//! - control signals and failures returned by a stage's transform
//!   ([`StageError`]),
//! - terminal supervision failures ([`SupervisionError`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for stagepipe operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The descriptor set does not describe a runnable chain.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A supervised instance exceeded its restart bound.
    #[error("{0}")]
    Supervision(#[from] SupervisionError),

    /// The background orchestrator task could not be joined.
    #[error("Orchestrator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Classification of a chain configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    /// No descriptors were supplied.
    Empty,
    /// No descriptor lacks an upstream reference.
    NoRoot,
    /// More than one descriptor lacks an upstream reference.
    MultipleRoots,
    /// An upstream reference names no known descriptor.
    UnknownUpstream,
    /// A descriptor subscribes to itself.
    SelfSubscription,
    /// Several descriptors subscribe to the same upstream.
    Branching,
    /// Some descriptors cannot be reached from the root.
    Disconnected,
    /// A descriptor asks for zero instances.
    InvalidConcurrency,
    /// Concurrency above one without the replicate capability.
    MissingFactory,
}

impl ValidationKind {
    /// Returns the stable error code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Empty => "CHAIN-001-EMPTY",
            Self::NoRoot => "CHAIN-002-NO_ROOT",
            Self::MultipleRoots => "CHAIN-003-MULTIPLE_ROOTS",
            Self::UnknownUpstream => "CHAIN-004-UNKNOWN_UPSTREAM",
            Self::SelfSubscription => "CHAIN-005-SELF_SUBSCRIPTION",
            Self::Branching => "CHAIN-006-BRANCHING",
            Self::Disconnected => "CHAIN-007-DISCONNECTED",
            Self::InvalidConcurrency => "STAGE-001-INVALID_CONCURRENCY",
            Self::MissingFactory => "STAGE-002-MISSING_FACTORY",
        }
    }

    /// Returns a hint for fixing this kind of error.
    #[must_use]
    pub const fn fix_hint(self) -> &'static str {
        match self {
            Self::Empty => "Add at least one stage descriptor before running.",
            Self::NoRoot => {
                "Exactly one descriptor must omit `subscribe_to`; it becomes the producer."
            }
            Self::MultipleRoots => {
                "Only the producer may omit `subscribe_to`. Link the other stages to their upstream."
            }
            Self::UnknownUpstream => {
                "Subscribe to the `id()` of a descriptor that is part of the same pipeline."
            }
            Self::SelfSubscription => "A stage cannot consume its own output.",
            Self::Branching => {
                "Pipelines are linear chains. Give each stage at most one subscriber."
            }
            Self::Disconnected => {
                "Every descriptor must be reachable from the producer through subscriptions."
            }
            Self::InvalidConcurrency => "Concurrency must be at least 1.",
            Self::MissingFactory => {
                "Declare the stage with `StageDescriptor::replicable` so extra instances can be created."
            }
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error raised when a descriptor set cannot be turned into a runnable chain.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct PipelineValidationError {
    /// What went wrong.
    pub kind: ValidationKind,
    /// Human-readable description.
    pub message: String,
    /// Names of the stages involved.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Returns a hint for fixing the error.
    #[must_use]
    pub const fn fix_hint(&self) -> &'static str {
        self.kind.fix_hint()
    }
}

/// Non-success outcome of a single transform invocation.
///
/// `NoData` and `Quit` are control signals meaningful only for the producer;
/// `Failed` is a transient, stage-specific error that never stops the loop.
#[derive(Debug, Error)]
pub enum StageError {
    /// The producer has nothing to emit right now.
    #[error("no data")]
    NoData,

    /// The producer is permanently done.
    #[error("quit")]
    Quit,

    /// Any other failure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl StageError {
    /// Creates a transient failure from a message.
    pub fn failed<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::msg(message))
    }

    /// Returns true for the no-data signal.
    #[must_use]
    pub const fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }

    /// Returns true for the quit signal.
    #[must_use]
    pub const fn is_quit(&self) -> bool {
        matches!(self, Self::Quit)
    }
}

/// Result of a transform invocation.
///
/// `Ok(Some(item))` emits `item`, `Ok(None)` succeeds without emitting.
pub type StageResult<T> = Result<Option<T>, StageError>;

/// Terminal failure of a supervised unit ("out of supervision").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("out of supervision: '{unit}' panicked {attempts} time(s), restart bound is {max_restart}")]
pub struct SupervisionError {
    /// Name of the supervised unit.
    pub unit: String,
    /// Number of attempts that ended in a panic.
    pub attempts: usize,
    /// Configured restart bound.
    pub max_restart: usize,
    /// Message of the last panic.
    pub last_panic: String,
}
