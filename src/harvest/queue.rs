// src/harvest/queue.rs
// =============================================================================
// The fetch queue and the sequencer that keeps it filled.
//
// How it works:
// 1. The sequencer walks the code range (start..=stop) with `advance`
// 2. Whenever the queue runs low, it generates a batch, shuffles it and
//    appends it to the back of the queue
// 3. Fetch workers pop codes from the front
// 4. A failed code goes back to the *front*, so it is retried soon
// 5. Once the range is exhausted, one Stop marker per worker is appended
//    at the back; Stop markers never have codes behind them
//
// The queue and the failure counts live behind one lock, so "how often did
// this code fail" and "where is it in the queue" always agree.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::HarvestError;
use crate::services::CodeSpace;

/// How many times a code may fail before we give up on it.
pub const MAX_TRIES: u32 = 3;

/// The sequencer never sleeps longer than this many pacing units.
const MAX_DELAY_UNITS: u32 = 30;

/// One slot in the fetch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Code(String),
    /// Tells the worker that pops it to shut down
    Stop,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    failures: HashMap<String, u32>,
}

/// What happened to a code that was handed back after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Back in the queue; `attempt` failures so far
    Retry { attempt: u32 },
    /// Failed MAX_TRIES times and is dropped for good
    GaveUp,
}

/// Pending codes plus per-code failure counts, shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct FetchQueue {
    state: Arc<Mutex<QueueState>>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next entry, or None if the queue is momentarily empty.
    pub async fn pop(&self) -> Option<QueueEntry> {
        self.state.lock().await.entries.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Records a failure for `code` and puts it back unless it ran out of tries.
    ///
    /// Retried codes go to the front: ahead of codes that were never tried,
    /// and ahead of every Stop marker (those only ever sit at the back).
    pub async fn requeue(&self, code: String) -> Requeue {
        let mut state = self.state.lock().await;
        let tries = state.failures.entry(code.clone()).or_insert(0);
        *tries += 1;
        let attempt = *tries;

        if attempt >= MAX_TRIES {
            state.failures.remove(&code);
            return Requeue::GaveUp;
        }
        state.entries.push_front(QueueEntry::Code(code));
        Requeue::Retry { attempt }
    }

    /// Clears the failure count of a code that reached a final outcome.
    pub async fn forget(&self, code: &str) {
        self.state.lock().await.failures.remove(code);
    }

    /// Number of codes that failed at least once and are still in play.
    #[cfg(test)]
    pub(crate) async fn failing(&self) -> usize {
        self.state.lock().await.failures.len()
    }

    #[cfg(test)]
    pub(crate) async fn push_back(&self, entry: QueueEntry) {
        self.state.lock().await.entries.push_back(entry);
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Vec<QueueEntry> {
        self.state.lock().await.entries.iter().cloned().collect()
    }
}

/// Result of one look at the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refill {
    /// The queue was low; this many entries were appended
    Refilled(usize),
    /// The queue still had enough work
    Full,
    /// The range is done and every Stop marker is queued
    Finished,
}

/// Walks the code range and feeds the fetch queue.
#[derive(Debug)]
pub struct Sequencer {
    queue: FetchQueue,
    space: CodeSpace,
    next: Option<String>,
    stop: String,
    stops_left: usize,
    low_water: usize,
    high_water: usize,
    pacing_unit: Duration,
    delay: u32,
}

impl Sequencer {
    /// Creates a sequencer for `start..=stop` feeding `workers` workers.
    ///
    /// Refills happen below `min_per_thread * workers` entries and top the
    /// queue up to `max_per_thread * workers`.
    pub fn new(
        queue: FetchQueue,
        space: CodeSpace,
        start: &str,
        stop: &str,
        workers: usize,
        min_per_thread: usize,
        max_per_thread: usize,
        pacing_unit: Duration,
    ) -> Self {
        Self {
            queue,
            space,
            next: Some(start.to_string()),
            stop: stop.to_string(),
            stops_left: workers,
            low_water: min_per_thread * workers,
            high_water: max_per_thread * workers,
            pacing_unit,
            delay: 1,
        }
    }

    /// Keeps the queue filled until the whole range has been queued.
    pub async fn run(mut self) -> Result<(), HarvestError> {
        info!("Starting sequencer ({} -> {})", self.next.as_deref().unwrap_or(""), self.stop);
        loop {
            let refill = self.refill_once().await?;
            match refill {
                Refill::Finished => break,
                Refill::Refilled(count) => debug!("Queued {} entries", count),
                Refill::Full => {}
            }
            tokio::time::sleep(self.pause_after(refill)).await;
        }
        info!("Sequencer finished, reached {}", self.stop);
        Ok(())
    }

    /// How long to wait before the next look at the queue.
    ///
    /// A refill means the workers were hungry, so the delay shrinks by one
    /// unit (never below one). A full queue waits out the current delay and
    /// grows it by one unit, up to MAX_DELAY_UNITS.
    fn pause_after(&mut self, refill: Refill) -> Duration {
        match refill {
            Refill::Refilled(_) => {
                self.delay = self.delay.saturating_sub(1).max(1);
                self.pacing_unit * self.delay
            }
            Refill::Full => {
                let pause = self.pacing_unit * self.delay;
                self.delay = (self.delay + 1).min(MAX_DELAY_UNITS);
                pause
            }
            Refill::Finished => Duration::ZERO,
        }
    }

    /// Looks at the queue once and refills it if it is below the low mark.
    pub async fn refill_once(&mut self) -> Result<Refill, HarvestError> {
        let mut state = self.queue.state.lock().await;
        let len = state.entries.len();
        if len >= self.low_water {
            return Ok(Refill::Full);
        }

        let room = self.high_water.saturating_sub(len);
        let mut batch = Vec::with_capacity(room);
        while batch.len() < room {
            let Some(code) = self.next.take() else {
                break;
            };
            if code != self.stop {
                let next = self
                    .space
                    .advance(&code)
                    .map_err(|source| HarvestError::Unclassified {
                        code: code.clone(),
                        source,
                    })?;
                self.next = Some(next);
            }
            batch.push(code);
        }

        // Neighbouring codes end up on different workers
        batch.shuffle(&mut rand::thread_rng());
        let mut added = batch.len();
        state.entries.extend(batch.into_iter().map(QueueEntry::Code));

        // Stop markers go in once every code is queued, as far as room allows
        if self.next.is_none() {
            while self.stops_left > 0 && added < room {
                state.entries.push_back(QueueEntry::Stop);
                self.stops_left -= 1;
                added += 1;
            }
            if self.stops_left == 0 {
                return Ok(Refill::Finished);
            }
        }
        Ok(Refill::Refilled(added))
    }
}

// -----------------------------------------------------------------------------
// BEGINNER NOTES:
//
// 1. Why a VecDeque?
//    - New work is appended at the back, workers take from the front
//    - Retries are pushed at the front
//    - VecDeque does all three in O(1)
//
// 2. Why low and high water marks?
//    - The code range can be billions of codes long
//    - We only ever keep a few batches in memory
//    - Refilling only below the low mark avoids tiny, constant refills
//
// 3. What does `let Some(code) = ... else { break; }` do?
//    - It's "let-else": bind the value if the pattern matches,
//      otherwise run the else block (which must leave the scope)
// -----------------------------------------------------------------------------
