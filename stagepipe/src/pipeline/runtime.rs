//! Pipeline orchestration.
//!
//! A run goes through four steps:
//!
//! ```text
//! descriptors ─► PipelineBuilder::build ─► wire ─► start instances
//!                                                      │
//!     first of: cancel token | OS signal | quit | fatal supervision error
//!                                                      │
//!          stop instance 0, await ack ─► stop instance 1, await ack ─► ...
//!                                                      │
//!                                              completion callback
//! ```

use super::builder::PipelineBuilder;
use super::spec::StageDescriptor;
use super::wiring::{wire, LinkedStage};
use super::worker::{QuitNotice, StopRequest, Worker};
use crate::cancellation::{wait_for_shutdown_signal, CancellationToken};
use crate::config::{self, PipelineConfig};
use crate::errors::{PipelineError, SupervisionError};
use crate::stages::Item;
use crate::supervisor::Supervisor;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// The cancellation token was cancelled.
    Cancelled,
    /// The process received a termination signal.
    Signal,
    /// The producer returned the quit signal.
    Quit(QuitNotice),
    /// An instance exceeded its restart bound.
    Fatal(SupervisionError),
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Signal => write!(f, "termination signal"),
            Self::Quit(notice) => write!(f, "quit by {}#{}", notice.stage, notice.instance),
            Self::Fatal(err) => write!(f, "fatal: {err}"),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// What ended the run.
    pub cause: TerminationCause,
    /// Number of instances started.
    pub instances: usize,
    /// Stop requests delivered during shutdown.
    pub stop_requests: usize,
    /// Acknowledgments received during shutdown.
    pub acknowledgments: usize,
}

impl RunReport {
    /// Returns true if every started instance acknowledged its stop request.
    #[must_use]
    pub const fn fully_acknowledged(&self) -> bool {
        self.acknowledgments == self.instances
    }

    /// Converts a fatal termination into an error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Supervision`] if the run ended on a fatal
    /// supervision error.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        match self.cause {
            TerminationCause::Fatal(err) => Err(err.into()),
            _ => Ok(self),
        }
    }
}

/// A linear pipeline ready to run.
pub struct Pipeline<T: Item> {
    descriptors: Vec<StageDescriptor<T>>,
    config: PipelineConfig,
    cancel: Arc<CancellationToken>,
}

impl<T: Item> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.descriptors.len())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T: Item> Pipeline<T> {
    /// Creates a pipeline from descriptors in any order.
    ///
    /// Starts from the process-wide configuration (see [`config::global`]).
    pub fn new(descriptors: impl IntoIterator<Item = StageDescriptor<T>>) -> Self {
        Self {
            descriptors: descriptors.into_iter().collect(),
            config: config::global(),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Replaces the configuration for this run.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the no-data threshold for this run.
    #[must_use]
    pub fn with_no_data_threshold(mut self, threshold: usize) -> Self {
        self.config = self.config.with_no_data_threshold(threshold);
        self
    }

    /// Overrides the no-data backoff duration for this run.
    #[must_use]
    pub fn with_no_data_sleep(mut self, sleep: Duration) -> Self {
        self.config = self.config.with_no_data_sleep(sleep);
        self
    }

    /// Uses an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the token that stops this run.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Returns the configuration for this run.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the pipeline to completion in the caller's task.
    ///
    /// `on_complete` is invoked exactly once, after every instance has
    /// been stopped.
    ///
    /// # Errors
    ///
    /// Returns a validation error, before anything starts, if the
    /// descriptors do not form a runnable chain.
    pub async fn run<F>(self, on_complete: F) -> Result<RunReport, PipelineError>
    where
        F: FnOnce(),
    {
        let mut run = self.launch()?;
        let report = run.finish().await;
        on_complete();
        Ok(report)
    }

    /// Starts the pipeline and returns once every instance is running.
    ///
    /// Waiting for termination, shutdown and `on_complete` happen on a
    /// background task. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the descriptors do not form a runnable
    /// chain.
    pub fn start<F>(self, on_complete: F) -> Result<RunningPipeline, PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut run = self.launch()?;
        let cancel = Arc::clone(&run.cancel);
        let instances = run.stops.len();

        let handle = tokio::spawn(async move {
            let report = run.finish().await;
            on_complete();
            report
        });

        Ok(RunningPipeline {
            cancel,
            instances,
            handle,
        })
    }

    /// Builds the chain, wires it and starts every instance.
    fn launch(self) -> Result<ActiveRun, PipelineError> {
        let Self {
            descriptors,
            config,
            cancel,
        } = self;

        let mut chain = descriptors
            .into_iter()
            .collect::<PipelineBuilder<T>>()
            .build(&config)?;
        let links = wire(&mut chain);

        info!(
            stages = chain.len(),
            links,
            order = %chain.iter().map(LinkedStage::name).collect::<Vec<_>>().join(" -> "),
            "starting pipeline"
        );

        let (quit_tx, quit_rx) = mpsc::unbounded_channel();
        let mut stops = Vec::new();
        let failures = FuturesUnordered::new();

        for linked in &mut chain {
            let Some(source) = linked.source.take() else {
                continue;
            };

            for (instance, stage) in source.into_instances(linked.concurrency).into_iter().enumerate() {
                let (stop_tx, stop_rx) = mpsc::channel(1);
                let worker = Arc::new(Worker::new(
                    linked,
                    instance,
                    stage,
                    stop_rx,
                    quit_tx.clone(),
                    &config,
                ));
                let unit = worker.unit_name();

                let handle = Supervisor::new(unit.clone(), linked.restart)
                    .spawn(move || Arc::clone(&worker).run());

                failures.push(handle.into_failure());
                stops.push(InstanceStop { unit, sender: stop_tx });
            }
        }

        debug!(instances = stops.len(), "all stage instances started");

        Ok(ActiveRun {
            cancel,
            handle_signals: config.handle_os_signals,
            stops,
            failures,
            quit_rx,
            _quit_tx: quit_tx,
        })
    }
}

/// Handle to a pipeline started with [`Pipeline::start`].
#[derive(Debug)]
pub struct RunningPipeline {
    cancel: Arc<CancellationToken>,
    instances: usize,
    handle: JoinHandle<RunReport>,
}

impl RunningPipeline {
    /// Requests shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel("pipeline cancelled by caller");
    }

    /// Returns the number of running instances.
    #[must_use]
    pub const fn instances(&self) -> usize {
        self.instances
    }

    /// Returns true once shutdown and the completion callback have finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run to finish.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Join`] if the background task panicked.
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        Ok(self.handle.await?)
    }
}

struct InstanceStop {
    unit: String,
    sender: mpsc::Sender<StopRequest>,
}

/// State of one run, from start to shutdown.
struct ActiveRun {
    cancel: Arc<CancellationToken>,
    handle_signals: bool,
    stops: Vec<InstanceStop>,
    failures: FuturesUnordered<oneshot::Receiver<SupervisionError>>,
    quit_rx: mpsc::UnboundedReceiver<QuitNotice>,
    // Keeps the quit channel open even if every producer is gone.
    _quit_tx: mpsc::UnboundedSender<QuitNotice>,
}

impl ActiveRun {
    async fn finish(&mut self) -> RunReport {
        let instances = self.stops.len();
        let cause = self.wait_for_termination().await;
        let (stop_requests, acknowledgments) = self.shutdown().await;

        info!(
            %cause,
            instances,
            stop_requests,
            acknowledgments,
            "pipeline stopped"
        );

        RunReport {
            cause,
            instances,
            stop_requests,
            acknowledgments,
        }
    }

    async fn wait_for_termination(&mut self) -> TerminationCause {
        let handle_signals = self.handle_signals;
        let signal = async move {
            if !handle_signals {
                return std::future::pending::<()>().await;
            }
            if let Err(err) = wait_for_shutdown_signal().await {
                warn!(error = %err, "cannot listen for OS signals");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            () = self.cancel.cancelled() => {
                info!(reason = ?self.cancel.reason(), "pipeline cancelled");
                TerminationCause::Cancelled
            }
            () = signal => {
                info!("termination signal received");
                TerminationCause::Signal
            }
            Some(notice) = self.quit_rx.recv() => {
                error!(stage = %notice.stage, instance = notice.instance, "pipeline quit");
                TerminationCause::Quit(notice)
            }
            err = next_failure(&mut self.failures) => {
                error!(severity = "fatal", error = %err, "pipeline fatal error");
                TerminationCause::Fatal(err)
            }
        }
    }

    /// Stops instances one at a time, in the order they were started.
    async fn shutdown(&mut self) -> (usize, usize) {
        let mut requested = 0;
        let mut acknowledged = 0;

        for stop in self.stops.drain(..) {
            let (request, done) = StopRequest::new();
            if stop.sender.send(request).await.is_err() {
                debug!(unit = %stop.unit, "instance already gone");
                continue;
            }
            requested += 1;

            match done.await {
                Ok(()) => {
                    acknowledged += 1;
                    debug!(unit = %stop.unit, "instance acknowledged stop");
                }
                Err(_) => {
                    warn!(unit = %stop.unit, "instance exited without acknowledging stop");
                }
            }
        }

        (requested, acknowledged)
    }
}

/// Resolves with the first supervision failure; never resolves if every
/// supervisor ends without one.
async fn next_failure(
    failures: &mut FuturesUnordered<oneshot::Receiver<SupervisionError>>,
) -> SupervisionError {
    while let Some(outcome) = failures.next().await {
        if let Ok(err) = outcome {
            return err;
        }
    }
    std::future::pending().await
}
