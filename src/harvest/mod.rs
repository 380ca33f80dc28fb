// src/harvest/mod.rs
// =============================================================================
// This module walks a range of short codes and records where they point.
//
// Pipeline (all tokio tasks):
//
//   Sequencer --codes--> FetchQueue --codes--> N x FetchWorker --records--> WriteSink
//                             ^                      |
//                             +------- retries ------+
//
//   Monitor: reads the shared stats every interval, trips on blocking
//
// A run succeeds when the writer has seen a Stop from every worker. Any
// task failing (or the monitor tripping) aborts the sequencer and workers;
// the writer still drains and flushes the records it was already sent.
//
// Rust concepts:
// - JoinSet: owns a group of spawned tasks, aborts them all when dropped
// - select!: waits for whichever of several futures finishes first
// =============================================================================

mod monitor;
mod queue;
mod sink;
mod worker;

use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::HarvestError;
use crate::services::{CodeSpace, ServiceFactory};

use monitor::{Monitor, SharedStats, Stats};
use queue::{FetchQueue, Sequencer};
use sink::WriteSink;
use worker::FetchWorker;

/// Tuning knobs for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Number of fetch workers
    pub threads: usize,
    /// Refill the queue below this many codes per worker
    pub min_per_thread: usize,
    /// Refill the queue up to this many codes per worker
    pub max_per_thread: usize,
    /// Deadline for a single fetch, covering every socket operation
    pub fetch_timeout: Duration,
    /// How long an idle worker waits before looking at the queue again
    pub idle_poll: Duration,
    /// Base sleep of the sequencer between queue checks
    pub pacing_unit: Duration,
    /// How often the monitor reports and judges the block rate
    pub monitor_interval: Duration,
    /// Block rate (0..1) at which the run is aborted
    pub block_threshold: f64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            min_per_thread: 2,
            max_per_thread: 10,
            fetch_timeout: Duration::from_secs(10),
            idle_poll: Duration::from_millis(250),
            pacing_unit: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(120),
            block_threshold: 0.1,
        }
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.threads == 0 {
            return Err(HarvestError::Config("at least one thread is needed".into()));
        }
        if self.min_per_thread == 0 || self.max_per_thread < self.min_per_thread {
            return Err(HarvestError::Config(format!(
                "need 1 <= min-per-thread <= max-per-thread, got {} and {}",
                self.min_per_thread, self.max_per_thread
            )));
        }
        if self.fetch_timeout.is_zero() || self.monitor_interval.is_zero() {
            return Err(HarvestError::Config(
                "fetch timeout and monitor interval must be positive".into(),
            ));
        }
        if !(self.block_threshold > 0.0 && self.block_threshold <= 1.0) {
            return Err(HarvestError::Config(format!(
                "block threshold must be in (0, 1], got {}",
                self.block_threshold
            )));
        }
        Ok(())
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub start: String,
    pub stop: String,
    pub records: u64,
    pub stats: Stats,
    pub elapsed_secs: f64,
}

// Whichever part of the pipeline finished first
enum Step {
    Fetched(Result<(), HarvestError>),
    Written(Result<u64, HarvestError>),
    Tripped(HarvestError),
}

/// Runs the pipeline for one service.
pub struct Harvester {
    config: HarvestConfig,
    space: CodeSpace,
    factory: ServiceFactory,
}

impl Harvester {
    pub fn new(config: HarvestConfig, space: CodeSpace, factory: ServiceFactory) -> Self {
        Self {
            config,
            space,
            factory,
        }
    }

    /// Checks that `start..=stop` is a non-empty range of valid codes.
    pub fn check_range(&self, start: &str, stop: &str) -> Result<(), HarvestError> {
        let invalid = |reason: &str| HarvestError::InvalidRange {
            start: start.to_string(),
            stop: stop.to_string(),
            reason: reason.to_string(),
        };
        if !self.space.contains(start) || !self.space.contains(stop) {
            return Err(invalid("codes must only use the service's alphabet"));
        }
        if !self.space.is_walkable(start, stop) {
            return Err(invalid("stop comes before start"));
        }
        Ok(())
    }

    /// Harvests every code from `start` to `stop` (inclusive) into `output`.
    pub async fn run<W>(&self, start: &str, stop: &str, output: W) -> Result<HarvestSummary, HarvestError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        self.check_range(start, stop)?;
        let started = Instant::now();
        let config = &self.config;

        info!(
            "Harvesting {}..{} with {} workers",
            start, stop, config.threads
        );

        let queue = FetchQueue::new();
        let stats = SharedStats::new();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        // Not part of `tasks`: an abort must leave the writer running until
        // it has flushed every record already sent to it
        let sink = WriteSink::new(output, config.threads);
        let mut writer = tokio::spawn(async move { sink.run(results_rx).await.map(|(written, _)| written) });
        let mut writer_done = false;

        let mut tasks = JoinSet::new();
        let sequencer = Sequencer::new(
            queue.clone(),
            self.space,
            start,
            stop,
            config.threads,
            config.min_per_thread,
            config.max_per_thread,
            config.pacing_unit,
        );
        tasks.spawn(sequencer.run());

        for id in 0..config.threads {
            let worker = FetchWorker::new(
                id,
                queue.clone(),
                self.factory.clone(),
                results_tx.clone(),
                stats.clone(),
                config.fetch_timeout,
                config.idle_poll,
            );
            tasks.spawn(worker.run());
        }
        // Only workers hold senders now; if they all die the writer notices
        drop(results_tx);

        let monitor = Monitor::new(stats.clone(), config.monitor_interval, config.block_threshold);
        let step = tokio::select! {
            biased;
            joined = &mut writer => Step::Written(settle(joined)),
            result = drive(&mut tasks) => Step::Fetched(result),
            error = monitor.run() => Step::Tripped(error),
        };

        let outcome = match step {
            Step::Fetched(Ok(())) => {
                writer_done = true;
                settle((&mut writer).await)
            }
            Step::Written(Ok(written)) => {
                writer_done = true;
                drive(&mut tasks).await.map(|()| written)
            }
            // A worker only sees a closed channel when the writer failed first
            Step::Fetched(Err(HarvestError::SinkClosed)) => {
                writer_done = true;
                match settle((&mut writer).await) {
                    Err(e) => Err(e),
                    Ok(_) => Err(HarvestError::SinkClosed),
                }
            }
            Step::Written(Err(e)) => {
                writer_done = true;
                Err(e)
            }
            Step::Fetched(Err(e)) | Step::Tripped(e) => Err(e),
        };

        let records = match outcome {
            Ok(records) => records,
            Err(e) => {
                error!("Aborting harvest: {}", e);
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                if !writer_done {
                    // Every sender is gone, so the writer drains the channel and flushes
                    match settle((&mut writer).await) {
                        Ok(_) | Err(HarvestError::Truncated { .. }) => {}
                        Err(other) => warn!("Writer failed while aborting: {}", other),
                    }
                }
                return Err(e);
            }
        };

        let summary = HarvestSummary {
            start: start.to_string(),
            stop: stop.to_string(),
            records,
            stats: stats.totals().await,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!("Harvest finished: {} records, {}", summary.records, summary.stats);
        Ok(summary)
    }
}

// Waits for the sequencer and every worker; the first failure wins
async fn drive(tasks: &mut JoinSet<Result<(), HarvestError>>) -> Result<(), HarvestError> {
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}

fn settle<T>(joined: Result<Result<T, HarvestError>, JoinError>) -> Result<T, HarvestError> {
    joined?
}

// -----------------------------------------------------------------------------
// BEGINNER NOTES:
//
// 1. What does `joined??` mean?
//    - join_next() gives Result<Result<(), HarvestError>, JoinError>
//    - The first ? turns a panicked/aborted task into HarvestError::Task
//    - The second ? returns the task's own error
//
// 2. Why are the monitor and the writer not in the JoinSet?
//    - The monitor never finishes on its own; select! drops it as soon as
//      the pipeline is done
//    - The writer must outlive an abort so it can flush what it received
//
// 3. What does `biased;` do in select!?
//    - Branches are polled top to bottom instead of in random order, so a
//      failed writer is noticed before the worker that tripped over it
// -----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted service for pipeline tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::services::{Service, ServiceError, ServiceFactory};

    /// The one code the scripted service refuses to canonicalize.
    pub const RESERVED_CODE: &str = "api";

    #[derive(Debug, Clone, Copy)]
    pub enum Reply {
        Url(&'static str),
        Absent,
        CodeBlocked,
        Blocked,
        Reset,
        Weird,
    }

    /// Replies per code, consumed in order. Codes that ran out of replies
    /// get the fallback reply, which is Absent unless changed.
    #[derive(Debug, Clone)]
    pub struct Script {
        replies: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
        fallback: Reply,
        instances: Arc<AtomicUsize>,
    }

    impl Script {
        pub fn new() -> Self {
            Self {
                replies: Arc::default(),
                fallback: Reply::Absent,
                instances: Arc::default(),
            }
        }

        pub fn otherwise(mut self, reply: Reply) -> Self {
            self.fallback = reply;
            self
        }

        pub fn reply(self, code: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry(code.to_string())
                .or_default()
                .extend(replies);
            self
        }

        /// How many service instances the factory built.
        pub fn instances(&self) -> usize {
            self.instances.load(Ordering::SeqCst)
        }

        pub fn factory(&self) -> ServiceFactory {
            let script = self.clone();
            Arc::new(move || -> Box<dyn Service> {
                script.instances.fetch_add(1, Ordering::SeqCst);
                Box::new(Scripted {
                    script: script.clone(),
                })
            })
        }
    }

    struct Scripted {
        script: Script,
    }

    #[async_trait]
    impl Service for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn canonicalize(&self, code: &str) -> Result<String, ServiceError> {
            if code == RESERVED_CODE {
                return Err(ServiceError::InvalidCode(code.to_string()));
            }
            Ok(code.to_string())
        }

        fn url(&self, code: &str) -> Result<String, ServiceError> {
            Ok(format!("http://short.example/{}", code))
        }

        async fn fetch(&mut self, code: &str, _deadline: Instant) -> Result<String, ServiceError> {
            let reply = self
                .script
                .replies
                .lock()
                .unwrap()
                .get_mut(code)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(self.script.fallback);
            match reply {
                Reply::Url(url) => Ok(url.to_string()),
                Reply::Absent => Err(ServiceError::NoRedirect),
                Reply::CodeBlocked => Err(ServiceError::CodeBlocked),
                Reply::Blocked => Err(ServiceError::ServiceBlocked),
                Reply::Reset => Err(ServiceError::Io(std::io::ErrorKind::ConnectionReset.into())),
                Reply::Weird => Err(ServiceError::Unexpected("scripted failure".into())),
            }
        }
    }
}
