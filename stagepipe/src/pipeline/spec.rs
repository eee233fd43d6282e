//! Stage descriptors.

use crate::stages::{Replicate, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of a stage descriptor.
///
/// Subscriptions are resolved by comparing IDs, so two descriptors wrapping
/// equal stage values are never confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(Uuid);

impl StageId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object-safe view of a stage that can also create instances.
pub(crate) trait ReplicableStage<T: Send + 'static>: Send + fmt::Debug {
    fn spawn_instance(&self) -> Box<dyn Stage<T>>;
    fn stage_name(&self) -> &str;
    fn into_stage(self: Box<Self>) -> Box<dyn Stage<T>>;
}

impl<T, S> ReplicableStage<T> for S
where
    T: Send + 'static,
    S: Stage<T> + Replicate<T> + 'static,
{
    fn spawn_instance(&self) -> Box<dyn Stage<T>> {
        <S as Replicate<T>>::replicate(self)
    }

    fn stage_name(&self) -> &str {
        <S as Stage<T>>::name(self)
    }

    fn into_stage(self: Box<Self>) -> Box<dyn Stage<T>> {
        self
    }
}

/// The stage object held by a descriptor.
#[derive(Debug)]
pub(crate) enum StageSource<T: Send + 'static> {
    Single(Box<dyn Stage<T>>),
    Replicable(Box<dyn ReplicableStage<T>>),
}

impl<T: Send + 'static> StageSource<T> {
    fn name(&self) -> &str {
        match self {
            Self::Single(stage) => stage.name(),
            Self::Replicable(stage) => stage.stage_name(),
        }
    }

    pub(crate) const fn is_replicable(&self) -> bool {
        matches!(self, Self::Replicable(_))
    }

    /// Produces `count` instances; index 0 is the original stage object.
    ///
    /// A single (non-replicable) source always yields exactly one instance;
    /// the builder rejects higher counts before this is reached.
    pub(crate) fn into_instances(self, count: usize) -> Vec<Box<dyn Stage<T>>> {
        match self {
            Self::Single(stage) => vec![stage],
            Self::Replicable(stage) => {
                let replicas: Vec<_> = (1..count).map(|_| stage.spawn_instance()).collect();
                let mut instances = Vec::with_capacity(count.max(1));
                instances.push(stage.into_stage());
                instances.extend(replicas);
                instances
            }
        }
    }
}

/// Declaration of one pipeline stage.
///
/// The descriptor without `subscribe_to` is the producer; every other
/// descriptor consumes the output of the stage it subscribes to.
#[derive(Debug)]
pub struct StageDescriptor<T: Send + 'static> {
    id: StageId,
    name: String,
    concurrency: Option<usize>,
    restart: Option<usize>,
    upstream: Option<StageId>,
    pub(crate) source: StageSource<T>,
}

impl<T: Send + 'static> StageDescriptor<T> {
    /// Declares a stage that runs as a single instance.
    pub fn new<S>(stage: S) -> Self
    where
        S: Stage<T> + 'static,
    {
        Self::from_source(StageSource::Single(Box::new(stage)))
    }

    /// Declares a stage that may run with several instances.
    pub fn replicable<S>(stage: S) -> Self
    where
        S: Stage<T> + Replicate<T> + 'static,
    {
        Self::from_source(StageSource::Replicable(Box::new(stage)))
    }

    fn from_source(source: StageSource<T>) -> Self {
        Self {
            id: StageId::new(),
            name: source.name().to_string(),
            concurrency: None,
            restart: None,
            upstream: None,
            source,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the number of concurrent instances.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Sets the restart bound for each instance. `0` disables restart.
    #[must_use]
    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Subscribes this stage to the output of `upstream`.
    #[must_use]
    pub fn subscribe_to(mut self, upstream: StageId) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Returns the stage identifier.
    #[must_use]
    pub const fn id(&self) -> StageId {
        self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the requested concurrency, if set.
    #[must_use]
    pub const fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Returns the requested restart bound, if set.
    #[must_use]
    pub const fn restart(&self) -> Option<usize> {
        self.restart
    }

    /// Returns the upstream stage, if any.
    #[must_use]
    pub const fn upstream(&self) -> Option<StageId> {
        self.upstream
    }

    /// Returns true if extra instances can be created.
    #[must_use]
    pub const fn is_replicable(&self) -> bool {
        self.source.is_replicable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageResult;
    use crate::stages::FnStage;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Parse;

    #[async_trait]
    impl Stage<String> for Parse {
        async fn transform(&mut self, input: Option<String>) -> StageResult<String> {
            Ok(input)
        }
    }

    fn passthrough(input: Option<String>) -> StageResult<String> {
        Ok(input)
    }

    fn echo() -> impl Stage<String> + Replicate<String> + 'static {
        FnStage::new("echo", passthrough)
    }

    #[test]
    fn test_ids_are_unique() {
        let a = StageDescriptor::new(Parse);
        let b = StageDescriptor::new(Parse);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_default_name_from_type() {
        let descriptor = StageDescriptor::new(Parse);
        assert_eq!(descriptor.name(), "Parse");

        let renamed = StageDescriptor::new(Parse).named("parser");
        assert_eq!(renamed.name(), "parser");
    }

    #[test]
    fn test_descriptor_settings() {
        let root = StageDescriptor::new(Parse);
        let child = StageDescriptor::replicable(echo())
            .with_concurrency(3)
            .with_restart(0)
            .subscribe_to(root.id());

        assert_eq!(child.name(), "echo");
        assert_eq!(child.concurrency(), Some(3));
        assert_eq!(child.restart(), Some(0));
        assert_eq!(child.upstream(), Some(root.id()));
        assert!(child.is_replicable());
        assert!(!root.is_replicable());
        assert!(root.upstream().is_none());
    }

    #[test]
    fn test_into_instances() {
        let single = StageDescriptor::new(Parse);
        assert_eq!(single.source.into_instances(1).len(), 1);

        let replicable = StageDescriptor::replicable(echo());
        let instances = replicable.source.into_instances(4);
        assert_eq!(instances.len(), 4);
        assert!(instances.iter().all(|stage| stage.name() == "echo"));
    }
}
