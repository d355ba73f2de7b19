//! Progress aggregation across download workers
//!
//! Workers publish `(chunk, high-water mark)` records over a channel; a
//! single aggregator task owns all mutation of the shared counters. Totals
//! are derived from per-chunk high-water marks, so late or dropped records
//! never make the cumulative count go backwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Invoked by the aggregator with a fresh snapshot, at most once per
/// [`CALLBACK_INTERVAL`] except for forced terminal emissions.
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Snapshot tick frequency (10 Hz); each tick contributes one speed sample.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum spacing between caller callback invocations.
const CALLBACK_INTERVAL: Duration = Duration::from_millis(500);
/// Moving-average window, in ticks.
const SPEED_SAMPLES: usize = 10;
/// Progress records buffered between workers and the aggregator task.
const CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of a download's progress
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Declared size, when the origin reported one
    pub total_bytes: Option<u64>,
    /// Cumulative bytes on disk; never decreases within one call
    pub downloaded_bytes: u64,
    /// Moving-average transfer speed in bytes per second
    pub speed_bps: f64,
    /// Estimated remainder; `None` when size or speed is unknown
    pub time_remaining: Option<Duration>,
    pub chunks_complete: u32,
    pub total_chunks: u32,
    pub started_at: Instant,
    pub last_update: Instant,
}

impl ProgressSnapshot {
    /// Completion in percent, when the total is known and non-zero
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some(self.downloaded_bytes as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }
}

enum Record {
    /// Absolute byte count a chunk has reached
    Bytes { chunk: u32, downloaded: u64 },
    /// A chunk finished; carries its final byte count
    Complete { chunk: u32, downloaded: u64 },
}

struct State {
    total_bytes: Option<u64>,
    per_chunk: Vec<u64>,
    complete: Vec<bool>,
    downloaded: u64,
    chunks_complete: u32,
    samples: VecDeque<u64>,
    last_sampled: u64,
    started_at: Instant,
    last_update: Instant,
}

impl State {
    fn new(total_bytes: Option<u64>, total_chunks: u32) -> Self {
        let now = Instant::now();
        Self {
            total_bytes,
            per_chunk: vec![0; total_chunks as usize],
            complete: vec![false; total_chunks as usize],
            downloaded: 0,
            chunks_complete: 0,
            samples: VecDeque::with_capacity(SPEED_SAMPLES),
            last_sampled: 0,
            started_at: now,
            last_update: now,
        }
    }

    fn apply(&mut self, record: Record) {
        let (chunk, downloaded, finished) = match record {
            Record::Bytes { chunk, downloaded } => (chunk, downloaded, false),
            Record::Complete { chunk, downloaded } => (chunk, downloaded, true),
        };
        let Some(slot) = self.per_chunk.get_mut(chunk as usize) else {
            return;
        };
        // high-water mark: a worker restarting a chunk reports lower values,
        // which must not roll the totals back
        if downloaded > *slot {
            self.downloaded += downloaded - *slot;
            *slot = downloaded;
        }
        if finished && !self.complete[chunk as usize] {
            self.complete[chunk as usize] = true;
            self.chunks_complete += 1;
        }
        self.last_update = Instant::now();
    }

    fn tick(&mut self) {
        let delta = self.downloaded - self.last_sampled;
        self.last_sampled = self.downloaded;
        if self.samples.len() == SPEED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
    }

    fn speed(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let window = self.samples.len() as f64 * TICK_INTERVAL.as_secs_f64();
        self.samples.iter().sum::<u64>() as f64 / window
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let speed = self.speed();
        let time_remaining = match self.total_bytes {
            Some(total) if speed > 0.0 && total > self.downloaded => Some(
                Duration::from_secs_f64((total - self.downloaded) as f64 / speed),
            ),
            _ => None,
        };
        ProgressSnapshot {
            total_bytes: self.total_bytes,
            downloaded_bytes: self.downloaded,
            speed_bps: speed,
            time_remaining,
            chunks_complete: self.chunks_complete,
            total_chunks: self.per_chunk.len() as u32,
            started_at: self.started_at,
            last_update: self.last_update,
        }
    }
}

/// Write side handed to workers
#[derive(Clone)]
pub(crate) struct ProgressHandle {
    tx: mpsc::Sender<Record>,
    state: Arc<Mutex<State>>,
}

impl ProgressHandle {
    /// Publishes a chunk's current byte count. Lossy on a full queue;
    /// intermediate values are superseded by later ones anyway.
    pub fn update(&self, chunk: u32, downloaded: u64) {
        let _ = self.tx.try_send(Record::Bytes { chunk, downloaded });
    }

    /// Reliably records a chunk's completion and final byte count.
    pub async fn complete(&self, chunk: u32, downloaded: u64) {
        let _ = self.tx.send(Record::Complete { chunk, downloaded }).await;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().unwrap().snapshot()
    }
}

/// Owns the aggregation task for one download call
pub(crate) struct ProgressAggregator {
    tx: Option<mpsc::Sender<Record>>,
    state: Arc<Mutex<State>>,
    callback: Option<ProgressCallback>,
    task: JoinHandle<()>,
}

impl ProgressAggregator {
    pub fn spawn(
        total_bytes: Option<u64>,
        total_chunks: u32,
        callback: Option<ProgressCallback>,
    ) -> Self {
        let state = Arc::new(Mutex::new(State::new(total_bytes, total_chunks)));
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        // initial emission so callers see the call start
        if let Some(cb) = &callback {
            cb(&state.lock().unwrap().snapshot());
        }

        let task = {
            let state = Arc::clone(&state);
            let callback = callback.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut last_emit = Instant::now();
                loop {
                    tokio::select! {
                        record = rx.recv() => match record {
                            Some(record) => state.lock().unwrap().apply(record),
                            None => break,
                        },
                        _ = interval.tick() => {
                            let snapshot = {
                                let mut state = state.lock().unwrap();
                                state.tick();
                                state.snapshot()
                            };
                            if let Some(cb) = &callback {
                                if last_emit.elapsed() >= CALLBACK_INTERVAL {
                                    last_emit = Instant::now();
                                    cb(&snapshot);
                                }
                            }
                        }
                    }
                }
                // drain-time bookkeeping so the final snapshot is exact
                state.lock().unwrap().tick();
            })
        };

        Self {
            tx: Some(tx),
            state,
            callback,
            task,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            tx: self.tx.clone().expect("aggregator already finished"),
            state: Arc::clone(&self.state),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().unwrap().snapshot()
    }

    /// Emits a snapshot to the callback immediately, bypassing the rate
    /// limit. Used for terminal events.
    pub fn emit_now(&self) {
        if let Some(cb) = &self.callback {
            cb(&self.snapshot());
        }
    }

    /// Stops the aggregation task after draining pending records and
    /// returns the final snapshot (with a forced callback emission).
    pub async fn finish(mut self) -> ProgressSnapshot {
        // closing the channel lets the task drain and exit; worker-held
        // handles are gone by the time the manager calls this
        self.tx = None;
        let _ = (&mut self.task).await;
        let snapshot = self.snapshot();
        if let Some(cb) = &self.callback {
            cb(&snapshot);
        }
        snapshot
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        self.task.abort();
    }
}
