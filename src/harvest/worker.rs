// src/harvest/worker.rs
// =============================================================================
// Fetch workers: pop a code, ask the service, act on the outcome.
//
// Every fetch ends in exactly one Outcome:
//
//   Success        -> record goes to the writer
//   Absent         -> counted as not found, done
//   CodeBlocked    -> counted as an error, done (retrying won't help)
//   ServiceBlocked -> counted as blocked, code goes back to the queue
//   Transient      -> counted as an error, the service instance is replaced
//                     and the code goes back to the queue
//   Unclassified   -> the whole run stops
//
// A code that went back to the queue MAX_TRIES times is dropped. Codes the
// service considers invalid are skipped without a request.
// =============================================================================

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::monitor::{Counter, SharedStats};
use super::queue::{FetchQueue, QueueEntry, Requeue};
use super::sink::{Record, SinkMessage};
use crate::error::HarvestError;
use crate::services::{Service, ServiceError, ServiceFactory};

/// How a single fetch ended, from the pipeline's point of view.
#[derive(Debug)]
pub enum Outcome {
    Success(String),
    Absent,
    CodeBlocked,
    ServiceBlocked,
    Transient(ServiceError),
    Unclassified(ServiceError),
}

impl Outcome {
    /// Sorts a fetch result into one of the outcomes above.
    pub fn classify(result: Result<String, ServiceError>) -> Self {
        match result {
            Ok(url) => Outcome::Success(url),
            Err(ServiceError::NoRedirect) => Outcome::Absent,
            Err(ServiceError::CodeBlocked) => Outcome::CodeBlocked,
            Err(ServiceError::ServiceBlocked) => Outcome::ServiceBlocked,
            Err(e) if e.is_transient() => Outcome::Transient(e),
            Err(e) => Outcome::Unclassified(e),
        }
    }
}

/// One fetch worker with its own service instance.
pub struct FetchWorker {
    id: usize,
    queue: FetchQueue,
    factory: ServiceFactory,
    service: Box<dyn Service>,
    results: UnboundedSender<SinkMessage>,
    stats: SharedStats,
    fetch_timeout: Duration,
    idle_poll: Duration,
}

impl FetchWorker {
    pub fn new(
        id: usize,
        queue: FetchQueue,
        factory: ServiceFactory,
        results: UnboundedSender<SinkMessage>,
        stats: SharedStats,
        fetch_timeout: Duration,
        idle_poll: Duration,
    ) -> Self {
        let service = factory();
        Self {
            id,
            queue,
            factory,
            service,
            results,
            stats,
            fetch_timeout,
            idle_poll,
        }
    }

    /// Works through the queue until a Stop marker shows up.
    pub async fn run(mut self) -> Result<(), HarvestError> {
        debug!(worker = self.id, service = self.service.name(), "Starting fetch worker");
        loop {
            let code = match self.queue.pop().await {
                Some(QueueEntry::Code(code)) => code,
                Some(QueueEntry::Stop) => break,
                None => {
                    tokio::time::sleep(self.idle_poll).await;
                    continue;
                }
            };
            self.process(code).await?;
        }

        // The writer counts these; a missing one means a dead worker
        self.results
            .send(SinkMessage::Stop)
            .map_err(|_| HarvestError::SinkClosed)?;
        info!(worker = self.id, "Fetch worker terminated");
        Ok(())
    }

    /// Fetches one code and acts on the outcome.
    pub async fn process(&mut self, code: String) -> Result<(), HarvestError> {
        // Codes the service would reject (reserved words, too long) are never sent
        if let Err(e) = self.service.canonicalize(&code) {
            debug!(worker = self.id, "Skipping {:?}: {}", code, e);
            self.queue.forget(&code).await;
            return Ok(());
        }

        let deadline = Instant::now() + self.fetch_timeout;
        let result = self.service.fetch(&code, deadline).await;
        self.stats.record(Counter::Fetched).await;

        match Outcome::classify(result) {
            Outcome::Success(url) => {
                debug!(worker = self.id, "Code {:?} -> {}", code, url);
                self.queue.forget(&code).await;
                self.results
                    .send(SinkMessage::Record(Record { code, url }))
                    .map_err(|_| HarvestError::SinkClosed)?;
            }
            Outcome::Absent => {
                self.stats.record(Counter::NotFound).await;
                self.queue.forget(&code).await;
            }
            Outcome::CodeBlocked => {
                debug!(worker = self.id, "Code {:?} is blocked", code);
                self.stats.record(Counter::Error).await;
                self.queue.forget(&code).await;
            }
            Outcome::ServiceBlocked => {
                info!(worker = self.id, "Service is blocking us (code {:?})", code);
                self.stats.record(Counter::Blocked).await;
                retry(&self.queue, self.id, code).await;
            }
            Outcome::Transient(e) => {
                error!(
                    worker = self.id,
                    "Fetching code {:?} failed: {}, replacing service instance", code, e
                );
                self.stats.record(Counter::Error).await;
                self.service = (self.factory)();
                retry(&self.queue, self.id, code).await;
            }
            Outcome::Unclassified(source) => {
                return Err(HarvestError::Unclassified { code, source });
            }
        }
        Ok(())
    }
}

// Hands a failed code back to the queue
async fn retry(queue: &FetchQueue, worker: usize, code: String) {
    match queue.requeue(code.clone()).await {
        Requeue::Retry { attempt } => {
            debug!(worker, "Code {:?} queued again after {} failures", code, attempt);
        }
        Requeue::GaveUp => {
            warn!(worker, "Code {:?} failed too often, giving up on it", code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::testing::{Reply, Script, RESERVED_CODE};
    use tokio::sync::mpsc;

    fn worker(
        script: &Script,
        queue: &FetchQueue,
    ) -> (FetchWorker, mpsc::UnboundedReceiver<SinkMessage>, SharedStats) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = SharedStats::new();
        let worker = FetchWorker::new(
            0,
            queue.clone(),
            script.factory(),
            tx,
            stats.clone(),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        (worker, rx, stats)
    }

    #[test]
    fn test_classify() {
        assert!(matches!(Outcome::classify(Ok("http://a".into())), Outcome::Success(u) if u == "http://a"));
        assert!(matches!(Outcome::classify(Err(ServiceError::NoRedirect)), Outcome::Absent));
        assert!(matches!(Outcome::classify(Err(ServiceError::CodeBlocked)), Outcome::CodeBlocked));
        assert!(matches!(Outcome::classify(Err(ServiceError::ServiceBlocked)), Outcome::ServiceBlocked));
        assert!(matches!(
            Outcome::classify(Err(ServiceError::Io(std::io::ErrorKind::ConnectionReset.into()))),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            Outcome::classify(Err(ServiceError::Unexpected("boom".into()))),
            Outcome::Unclassified(_)
        ));
    }

    #[tokio::test]
    async fn test_success_goes_to_writer() {
        let script = Script::new().reply("a", [Reply::Url("http://example.org/")]);
        let queue = FetchQueue::new();
        let (mut worker, mut rx, stats) = worker(&script, &queue);

        worker.process("a".into()).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SinkMessage::Record(Record::new("a", "http://example.org/")))
        );
        assert_eq!(stats.totals().await.found(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_replaces_service_and_requeues() {
        let script = Script::new().reply("a", [Reply::Reset]);
        let queue = FetchQueue::new();
        let (mut worker, _rx, stats) = worker(&script, &queue);
        assert_eq!(script.instances(), 1);

        worker.process("a".into()).await.unwrap();
        assert_eq!(script.instances(), 2);
        assert_eq!(queue.snapshot().await, vec![QueueEntry::Code("a".into())]);
        assert_eq!(stats.totals().await.errors, 1);
    }

    #[tokio::test]
    async fn test_code_blocked_is_not_retried() {
        let script = Script::new().reply("a", [Reply::CodeBlocked]);
        let queue = FetchQueue::new();
        let (mut worker, _rx, stats) = worker(&script, &queue);

        worker.process("a".into()).await.unwrap();
        assert!(queue.snapshot().await.is_empty());
        assert_eq!(stats.totals().await.errors, 1);
        assert_eq!(script.instances(), 1);
    }

    #[tokio::test]
    async fn test_blocked_code_dropped_after_max_tries() {
        let script = Script::new().reply(
            "a",
            [Reply::Blocked, Reply::Blocked, Reply::Blocked, Reply::Url("http://late/")],
        );
        let queue = FetchQueue::new();
        let (mut worker, mut rx, stats) = worker(&script, &queue);

        worker.process("a".into()).await.unwrap();
        for _ in 0..2 {
            let Some(QueueEntry::Code(code)) = queue.pop().await else {
                panic!("code was not queued again");
            };
            worker.process(code).await.unwrap();
        }
        assert!(queue.snapshot().await.is_empty());
        assert_eq!(stats.totals().await.blocked, 3);
        drop(worker);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_invalid_code_is_never_fetched() {
        let script = Script::new().reply(RESERVED_CODE, [Reply::Weird]);
        let queue = FetchQueue::new();
        let (mut worker, _rx, stats) = worker(&script, &queue);

        worker.process(RESERVED_CODE.into()).await.unwrap();
        assert_eq!(stats.totals().await.fetched, 0);
        assert!(queue.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unclassified_error_is_fatal() {
        let script = Script::new().reply("a", [Reply::Weird]);
        let queue = FetchQueue::new();
        let (mut worker, _rx, _) = worker(&script, &queue);

        let error = worker.process("a".into()).await.unwrap_err();
        assert!(matches!(error, HarvestError::Unclassified { code, .. } if code == "a"));
    }

    #[tokio::test]
    async fn test_run_sends_stop_and_exits() {
        let script = Script::new().reply("a", [Reply::Url("http://a/")]);
        let queue = FetchQueue::new();
        queue.push_back(QueueEntry::Code("a".into())).await;
        queue.push_back(QueueEntry::Code("b".into())).await;
        queue.push_back(QueueEntry::Stop).await;
        let (worker, mut rx, stats) = worker(&script, &queue);

        worker.run().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SinkMessage::Record(Record::new("a", "http://a/")))
        );
        assert_eq!(rx.recv().await, Some(SinkMessage::Stop));
        assert_eq!(rx.recv().await, None);
        // "b" has no scripted reply and counts as absent
        assert_eq!(stats.totals().await.not_found, 1);
    }
}
