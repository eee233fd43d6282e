//! Chain builder with validation.
//!
//! Turns an unordered set of descriptors into an ordered chain by following
//! `subscribe_to` links from the single producer.

use super::spec::{StageDescriptor, StageId};
use super::wiring::{LinkedStage, StagePosition};
use crate::config::PipelineConfig;
use crate::errors::{PipelineValidationError, ValidationKind};
use std::collections::{HashMap, HashSet};

/// Builder for ordered stage chains.
#[derive(Debug)]
pub struct PipelineBuilder<T: Send + 'static> {
    descriptors: Vec<StageDescriptor<T>>,
}

impl<T: Send + 'static> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Adds a descriptor.
    #[must_use]
    pub fn stage(mut self, descriptor: StageDescriptor<T>) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Adds a descriptor in place.
    pub fn add_stage(&mut self, descriptor: StageDescriptor<T>) {
        self.descriptors.push(descriptor);
    }

    /// Returns the number of descriptors.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Orders the descriptors into a chain.
    ///
    /// Concurrency and restart bounds not set on a descriptor are resolved
    /// from `config`. Links are not attached; see [`super::wire`].
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptors do not form a single linear chain
    /// or if a stage's concurrency cannot be honored.
    pub fn build(self, config: &PipelineConfig) -> Result<Vec<LinkedStage<T>>, PipelineValidationError> {
        if self.descriptors.is_empty() {
            return Err(PipelineValidationError::new(
                ValidationKind::Empty,
                "Pipeline has no stages",
            ));
        }

        self.validate_stages(config)?;
        let root = self.find_root()?;
        let successors = self.successors()?;

        let mut order = vec![root];
        let mut visited: HashSet<StageId> = HashSet::from([self.descriptors[root].id()]);
        let mut current = root;
        while let Some(&next) = successors.get(&self.descriptors[current].id()) {
            if !visited.insert(self.descriptors[next].id()) {
                break;
            }
            order.push(next);
            current = next;
        }

        if order.len() < self.descriptors.len() {
            let linked: HashSet<usize> = order.iter().copied().collect();
            let stray: Vec<String> = self
                .descriptors
                .iter()
                .enumerate()
                .filter(|(index, _)| !linked.contains(index))
                .map(|(_, d)| d.name().to_string())
                .collect();
            return Err(PipelineValidationError::new(
                ValidationKind::Disconnected,
                format!(
                    "{} stage(s) are not reachable from the producer: {}",
                    stray.len(),
                    stray.join(", ")
                ),
            )
            .with_stages(stray));
        }

        let len = order.len();
        let mut slots: Vec<Option<StageDescriptor<T>>> =
            self.descriptors.into_iter().map(Some).collect();

        let chain = order
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slots[slot].take().map(|descriptor| LinkedStage {
                    id: descriptor.id(),
                    name: descriptor.name().to_string(),
                    index,
                    position: StagePosition::of(index, len),
                    concurrency: config.concurrency_for(descriptor.concurrency()),
                    restart: config.restart_for(descriptor.restart()),
                    source: Some(descriptor.source),
                    inbound: None,
                    outbound: None,
                })
            })
            .collect();

        Ok(chain)
    }

    fn validate_stages(&self, config: &PipelineConfig) -> Result<(), PipelineValidationError> {
        for descriptor in &self.descriptors {
            if descriptor.concurrency() == Some(0) {
                return Err(PipelineValidationError::new(
                    ValidationKind::InvalidConcurrency,
                    format!("Stage '{}' requests zero instances", descriptor.name()),
                )
                .with_stages(vec![descriptor.name().to_string()]));
            }

            let concurrency = config.concurrency_for(descriptor.concurrency());
            if concurrency > 1 && !descriptor.is_replicable() {
                return Err(PipelineValidationError::new(
                    ValidationKind::MissingFactory,
                    format!(
                        "Stage '{}' requests {} instances but cannot create new instances",
                        descriptor.name(),
                        concurrency
                    ),
                )
                .with_stages(vec![descriptor.name().to_string()]));
            }

            if descriptor.upstream() == Some(descriptor.id()) {
                return Err(PipelineValidationError::new(
                    ValidationKind::SelfSubscription,
                    format!("Stage '{}' subscribes to itself", descriptor.name()),
                )
                .with_stages(vec![descriptor.name().to_string()]));
            }
        }
        Ok(())
    }

    fn find_root(&self) -> Result<usize, PipelineValidationError> {
        let roots: Vec<usize> = self
            .descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.upstream().is_none())
            .map(|(index, _)| index)
            .collect();

        match roots.as_slice() {
            [root] => Ok(*root),
            [] => Err(PipelineValidationError::new(
                ValidationKind::NoRoot,
                "No stage is free of subscriptions; cannot pick a producer",
            )
            .with_stages(self.names())),
            many => {
                let names: Vec<String> = many
                    .iter()
                    .map(|&index| self.descriptors[index].name().to_string())
                    .collect();
                Err(PipelineValidationError::new(
                    ValidationKind::MultipleRoots,
                    format!("Several stages have no upstream: {}", names.join(", ")),
                )
                .with_stages(names))
            }
        }
    }

    /// Maps each upstream ID to the index of its only subscriber.
    fn successors(&self) -> Result<HashMap<StageId, usize>, PipelineValidationError> {
        let known: HashSet<StageId> = self.descriptors.iter().map(StageDescriptor::id).collect();
        let mut successors: HashMap<StageId, usize> =
            HashMap::with_capacity(self.descriptors.len());

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let Some(upstream) = descriptor.upstream() else {
                continue;
            };

            if !known.contains(&upstream) {
                return Err(PipelineValidationError::new(
                    ValidationKind::UnknownUpstream,
                    format!(
                        "Stage '{}' subscribes to unknown stage {}",
                        descriptor.name(),
                        upstream
                    ),
                )
                .with_stages(vec![descriptor.name().to_string()]));
            }

            if let Some(&other) = successors.get(&upstream) {
                let names = vec![
                    self.descriptors[other].name().to_string(),
                    descriptor.name().to_string(),
                ];
                return Err(PipelineValidationError::new(
                    ValidationKind::Branching,
                    format!(
                        "Stages '{}' and '{}' subscribe to the same upstream",
                        names[0], names[1]
                    ),
                )
                .with_stages(names));
            }
            successors.insert(upstream, index);
        }

        Ok(successors)
    }

    fn names(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }
}

impl<T: Send + 'static> FromIterator<StageDescriptor<T>> for PipelineBuilder<T> {
    fn from_iter<I: IntoIterator<Item = StageDescriptor<T>>>(iter: I) -> Self {
        Self {
            descriptors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageResult;
    use crate::stages::{Replicate, Stage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Same;

    #[async_trait]
    impl Stage<u32> for Same {
        async fn transform(&mut self, input: Option<u32>) -> StageResult<u32> {
            Ok(input)
        }
    }

    impl Replicate<u32> for Same {
        fn replicate(&self) -> Box<dyn Stage<u32>> {
            Box::new(self.clone())
        }
    }

    fn stage(name: &str) -> StageDescriptor<u32> {
        StageDescriptor::new(Same).named(name)
    }

    fn names(chain: &[LinkedStage<u32>]) -> Vec<&str> {
        chain.iter().map(LinkedStage::name).collect()
    }

    fn build(descriptors: Vec<StageDescriptor<u32>>) -> Result<Vec<LinkedStage<u32>>, PipelineValidationError> {
        descriptors
            .into_iter()
            .collect::<PipelineBuilder<u32>>()
            .build(&PipelineConfig::default())
    }

    #[test]
    fn test_builder_orders_by_subscription_not_list_order() {
        let source = stage("source");
        let parse = stage("parse").subscribe_to(source.id());
        let enrich = stage("enrich").subscribe_to(parse.id());
        let sink = stage("sink").subscribe_to(enrich.id());

        let chain = build(vec![sink, enrich, source, parse]).unwrap();

        assert_eq!(names(&chain), vec!["source", "parse", "enrich", "sink"]);
        assert_eq!(
            chain.iter().map(LinkedStage::index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(chain[0].position(), StagePosition::Root);
        assert_eq!(chain[3].position(), StagePosition::Terminal);
    }

    #[test]
    fn test_structurally_equal_stages_are_distinct() {
        // Same stage value everywhere; only the IDs tell them apart.
        let a = stage("a");
        let b = stage("b").subscribe_to(a.id());
        let c = stage("c").subscribe_to(b.id());

        let chain = build(vec![c, b, a]).unwrap();
        assert_eq!(names(&chain), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_builder_empty() {
        let err = build(Vec::new()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Empty);
    }

    #[test]
    fn test_builder_no_root() {
        let a = stage("a");
        let b = stage("b").subscribe_to(a.id());
        let a = a.subscribe_to(b.id());

        let err = build(vec![a, b]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::NoRoot);
        assert_eq!(err.code(), "CHAIN-002-NO_ROOT");
    }

    #[test]
    fn test_builder_multiple_roots() {
        let err = build(vec![stage("a"), stage("b")]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::MultipleRoots);
        assert_eq!(err.stages, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_builder_unknown_upstream() {
        let orphan = stage("orphan").subscribe_to(StageId::new());
        let err = build(vec![stage("root"), orphan]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::UnknownUpstream);
    }

    #[test]
    fn test_builder_self_subscription() {
        let looped = stage("loop");
        let id = looped.id();
        let err = build(vec![stage("root"), looped.subscribe_to(id)]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::SelfSubscription);
    }

    #[test]
    fn test_builder_branching() {
        let root = stage("root");
        let left = stage("left").subscribe_to(root.id());
        let right = stage("right").subscribe_to(root.id());

        let err = build(vec![root, left, right]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Branching);
        assert_eq!(err.stages, vec!["left".to_string(), "right".to_string()]);
    }

    #[test]
    fn test_builder_successors_map_each_upstream_once() {
        let root = stage("root");
        let middle = stage("middle").subscribe_to(root.id());
        let tail = stage("tail").subscribe_to(middle.id());
        let (root_id, middle_id) = (root.id(), middle.id());

        let builder: PipelineBuilder<u32> = vec![tail, root, middle].into_iter().collect();
        let successors = builder.successors().unwrap();

        assert_eq!(successors.len(), 2);
        assert_eq!(successors[&root_id], 2);
        assert_eq!(successors[&middle_id], 0);
    }

    #[test]
    fn test_builder_disconnected_cycle() {
        let root = stage("root");
        let tail = stage("tail").subscribe_to(root.id());
        let x = stage("x");
        let y = stage("y").subscribe_to(x.id());
        let x = x.subscribe_to(y.id());

        let err = build(vec![root, tail, x, y]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Disconnected);
        assert_eq!(err.stages, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_builder_zero_concurrency() {
        let err = build(vec![stage("root").with_concurrency(0)]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::InvalidConcurrency);
    }

    #[test]
    fn test_builder_missing_factory() {
        let root = stage("root");
        let wide = stage("wide").with_concurrency(3).subscribe_to(root.id());

        let err = build(vec![root, wide]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::MissingFactory);
        assert_eq!(err.stages, vec!["wide".to_string()]);
    }

    #[test]
    fn test_builder_missing_factory_from_global_default() {
        let config = PipelineConfig::new().with_default_concurrency(2);
        let err = PipelineBuilder::new()
            .stage(stage("root"))
            .build(&config)
            .unwrap_err();
        assert_eq!(err.kind, ValidationKind::MissingFactory);
    }

    #[test]
    fn test_builder_resolves_defaults() {
        let config = PipelineConfig::new().with_default_restart(4);
        let root = StageDescriptor::replicable(Same).named("root").with_concurrency(3);
        let sink = stage("sink").with_restart(0).subscribe_to(root.id());

        let mut builder = PipelineBuilder::new();
        builder.add_stage(sink);
        builder.add_stage(root);
        assert_eq!(builder.stage_count(), 2);

        let chain = builder.build(&config).unwrap();
        assert_eq!(chain[0].concurrency(), 3);
        assert_eq!(chain[0].restart(), 4);
        assert_eq!(chain[1].concurrency(), 1);
        assert_eq!(chain[1].restart(), 0);
        assert!(chain.iter().all(|s| s.source.is_some()));
    }
}
