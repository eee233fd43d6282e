//! Stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::fixtures::StageMonitor;
use crate::errors::{StageError, StageResult};
use crate::stages::{Item, Replicate, Stage};

/// What a [`SequenceProducer`] does once its sequence is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSequence {
    /// Signal quit.
    Quit,
    /// Report no data forever.
    NoData,
}

/// A producer emitting `start..=end`, one value per call.
#[derive(Debug)]
pub struct SequenceProducer {
    next: u64,
    end: u64,
    after: AfterSequence,
    monitor: StageMonitor,
}

impl SequenceProducer {
    /// Emits `start..=end`, then quits.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            after: AfterSequence::Quit,
            monitor: StageMonitor::new(),
        }
    }

    /// Emits nothing and reports no data on every call.
    #[must_use]
    pub fn idle() -> Self {
        Self::new(1, 0).then(AfterSequence::NoData)
    }

    /// Sets the behavior after the last value.
    #[must_use]
    pub fn then(mut self, after: AfterSequence) -> Self {
        self.after = after;
        self
    }

    /// Returns a monitor observing this producer.
    #[must_use]
    pub fn monitor(&self) -> StageMonitor {
        self.monitor.clone()
    }
}

#[async_trait]
impl Stage<u64> for SequenceProducer {
    async fn transform(&mut self, _input: Option<u64>) -> StageResult<u64> {
        self.monitor.record_call();

        if self.next > self.end {
            return match self.after {
                AfterSequence::Quit => Err(StageError::Quit),
                AfterSequence::NoData => Err(StageError::NoData),
            };
        }

        let value = self.next;
        self.next += 1;
        Ok(Some(value))
    }

    async fn cleanup(&mut self) {
        self.monitor.record_cleanup();
    }
}

/// A consumer that records every input it receives.
///
/// Replicas append to the same record.
#[derive(Debug)]
pub struct RecordingSink<T> {
    records: Arc<Mutex<Vec<T>>>,
    delay: Option<Duration>,
    monitor: StageMonitor,
}

impl<T> Default for RecordingSink<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            monitor: StageMonitor::new(),
        }
    }
}

impl<T: Clone> RecordingSink<T> {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps `delay` before recording each input.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns a handle to the recorded inputs.
    #[must_use]
    pub fn records(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.records)
    }

    /// Returns a monitor observing this sink.
    #[must_use]
    pub fn monitor(&self) -> StageMonitor {
        self.monitor.clone()
    }

    /// Returns a copy of the recorded inputs.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl<T: Item> Stage<T> for RecordingSink<T> {
    async fn transform(&mut self, input: Option<T>) -> StageResult<T> {
        self.monitor.record_call();
        match input {
            Some(item) => {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.records.lock().push(item);
                Ok(None)
            }
            None => Err(StageError::NoData),
        }
    }

    async fn cleanup(&mut self) {
        self.monitor.record_cleanup();
    }
}

impl<T: Item> Replicate<T> for RecordingSink<T> {
    fn replicate(&self) -> Box<dyn Stage<T>> {
        Box::new(Self {
            records: Arc::clone(&self.records),
            delay: self.delay,
            monitor: self.monitor.clone(),
        })
    }
}

/// A stage that panics on its first `panics` calls and passes inputs
/// through afterwards.
#[derive(Debug)]
pub struct PanickingStage {
    remaining: usize,
    monitor: StageMonitor,
}

impl PanickingStage {
    /// Panics on every call.
    #[must_use]
    pub fn always() -> Self {
        Self::times(usize::MAX)
    }

    /// Panics on the first `panics` calls.
    #[must_use]
    pub fn times(panics: usize) -> Self {
        Self {
            remaining: panics,
            monitor: StageMonitor::new(),
        }
    }

    /// Returns a monitor observing this stage.
    #[must_use]
    pub fn monitor(&self) -> StageMonitor {
        self.monitor.clone()
    }
}

#[async_trait]
impl<T: Item> Stage<T> for PanickingStage {
    async fn transform(&mut self, input: Option<T>) -> StageResult<T> {
        self.monitor.record_call();
        if self.remaining > 0 {
            self.remaining -= 1;
            panic!("PanickingStage: induced panic");
        }
        match input {
            Some(item) => Ok(Some(item)),
            None => Err(StageError::NoData),
        }
    }

    async fn cleanup(&mut self) {
        self.monitor.record_cleanup();
    }
}

/// A pass-through stage counting its invocations.
#[derive(Debug)]
pub struct CountingStage<T> {
    monitor: StageMonitor,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for CountingStage<T> {
    fn default() -> Self {
        Self {
            monitor: StageMonitor::new(),
            _item: PhantomData,
        }
    }
}

impl<T> CountingStage<T> {
    /// Creates a new counting stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a monitor observing this stage and its replicas.
    #[must_use]
    pub fn monitor(&self) -> StageMonitor {
        self.monitor.clone()
    }
}

#[async_trait]
impl<T: Item> Stage<T> for CountingStage<T> {
    async fn transform(&mut self, input: Option<T>) -> StageResult<T> {
        self.monitor.record_call();
        input.map_or(Err(StageError::NoData), |item| Ok(Some(item)))
    }

    async fn cleanup(&mut self) {
        self.monitor.record_cleanup();
    }
}

impl<T: Item> Replicate<T> for CountingStage<T> {
    fn replicate(&self) -> Box<dyn Stage<T>> {
        Box::new(Self {
            monitor: self.monitor.clone(),
            _item: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sequence_then_quit() {
        let mut producer = SequenceProducer::new(1, 3);
        let monitor = producer.monitor();

        let mut emitted = Vec::new();
        while let Ok(Some(value)) = producer.transform(None).await {
            emitted.push(value);
        }

        assert_eq!(emitted, vec![1, 2, 3]);
        assert_eq!(monitor.calls(), 4);
        assert!(producer.transform(None).await.unwrap_err().is_quit());
    }

    #[tokio::test]
    async fn test_idle_producer() {
        let mut producer = SequenceProducer::idle();
        for _ in 0..3 {
            assert!(producer.transform(None).await.unwrap_err().is_no_data());
        }
    }

    #[tokio::test]
    async fn test_recording_sink_replicas_share_records() {
        let mut sink = RecordingSink::<String>::new();
        let mut replica = sink.replicate();

        sink.transform(Some("a".to_string())).await.unwrap();
        replica.transform(Some("b".to_string())).await.unwrap();
        replica.cleanup().await;

        assert_eq!(sink.snapshot(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(sink.monitor().calls(), 2);
        assert_eq!(sink.monitor().cleanups(), 1);
    }

    #[tokio::test]
    async fn test_panicking_stage_recovers_after_budget() {
        let stage = PanickingStage::times(1);
        let monitor = stage.monitor();

        let first = tokio::spawn(async move {
            let mut stage = stage;
            let _ = Stage::<u32>::transform(&mut stage, Some(1)).await;
            stage
        })
        .await;
        assert!(first.unwrap_err().is_panic());
        assert_eq!(monitor.calls(), 1);

        let mut stage = PanickingStage::times(0);
        assert_eq!(Stage::<u32>::transform(&mut stage, Some(7)).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_counting_stage_passes_through() {
        let mut stage = CountingStage::<u32>::new();
        let mut replica = stage.replicate();

        assert_eq!(stage.transform(Some(5)).await.unwrap(), Some(5));
        assert_eq!(replica.transform(Some(6)).await.unwrap(), Some(6));
        assert!(stage.transform(None).await.unwrap_err().is_no_data());
        assert_eq!(stage.monitor().calls(), 3);
    }
}
