//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a stagepipe pipeline. A stage
//! turns one optional input into one optional output; the producer receives
//! `None` on every call, every other stage receives `Some(item)`.

use crate::errors::StageResult;
use async_trait::async_trait;
use std::fmt::{self, Debug};

/// Values that can flow through a pipeline.
///
/// `Clone` lets failing invocations be logged together with their input.
pub trait Item: Clone + Debug + Send + 'static {}

impl<T: Clone + Debug + Send + 'static> Item for T {}

/// Trait for pipeline stages.
///
/// Each running instance is owned by exactly one execution loop, hence
/// `&mut self`. The instance survives panics of its loop and is reused by
/// the restarted loop.
#[async_trait]
pub trait Stage<T: Send + 'static>: Send + Debug {
    /// Returns the display name of the stage.
    ///
    /// Defaults to the short type name of the implementation.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Processes one input.
    ///
    /// # Arguments
    ///
    /// * `input` - `None` for the producer, the upstream item otherwise
    async fn transform(&mut self, input: Option<T>) -> StageResult<T>;

    /// Releases resources held by this instance.
    ///
    /// Called once per instance when the pipeline shuts down.
    async fn cleanup(&mut self) {}
}

/// Capability to create fresh instances of a stage.
///
/// Required for stages running with concurrency above one. Instance 0 is the
/// stage itself; instances 1.. are obtained from `replicate`.
pub trait Replicate<T: Send + 'static> {
    /// Creates an independent instance of this stage.
    fn replicate(&self) -> Box<dyn Stage<T>>;
}

/// Strips module paths and generic arguments from a type name.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A simple function-based stage.
pub struct FnStage<F> {
    name: String,
    func: F,
}

impl<F> FnStage<F> {
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<T, F> Stage<T> for FnStage<F>
where
    T: Send + 'static,
    F: FnMut(Option<T>) -> StageResult<T> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&mut self, input: Option<T>) -> StageResult<T> {
        (self.func)(input)
    }
}

impl<T, F> Replicate<T> for FnStage<F>
where
    T: Send + 'static,
    F: FnMut(Option<T>) -> StageResult<T> + Clone + Send + 'static,
{
    fn replicate(&self) -> Box<dyn Stage<T>> {
        Box::new(Self {
            name: self.name.clone(),
            func: self.func.clone(),
        })
    }
}
