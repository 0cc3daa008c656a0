//! Fixed pool of load-generating threads.
//!
//! The driver hands every worker one [`WorkOrder`] per tick and waits for all
//! tallies before it samples the target, so a tick is a barrier. Each worker
//! keeps the holds of its admitted requests in a private min-heap keyed by
//! simulated completion time and releases the due ones at the start of the
//! next tick it is given.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::{Outcome, Request, ScheduledRelease};
use crate::target::{Dispatch, Hold, LoadTarget};

/// Distinct synthetic clients a worker draws keys from.
pub const CLIENT_KEYS: u32 = 4_096;

/// Slack on top of a tick's paced wall-clock time before a missing tally is
/// treated as a hung worker.
const TALLY_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkOrder {
    pub tick: u64,
    /// Simulated time at the start of the tick.
    pub now_ms: u64,
    pub requests: u64,
    /// Real delay between submissions; `None` runs as fast as possible.
    pub pace: Option<Duration>,
}

enum Command {
    Tick(WorkOrder),
    Shutdown,
}

/// What one worker (or, merged, the whole pool) saw during a tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickTally {
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub timed_out: u64,
    pub refused: u64,
    pub released: u64,
    latency_ms_total: f64,
}

impl TickTally {
    fn observe(&mut self, dispatch: &Dispatch) {
        self.submitted += 1;
        match dispatch.outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Error(_) => self.errors += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Refused(_) => {
                self.refused += 1;
                return;
            }
        }
        self.latency_ms_total += dispatch.latency_ms;
    }

    pub fn merge(&mut self, other: &TickTally) {
        self.submitted += other.submitted;
        self.completed += other.completed;
        self.errors += other.errors;
        self.timed_out += other.timed_out;
        self.refused += other.refused;
        self.released += other.released;
        self.latency_ms_total += other.latency_ms_total;
    }

    pub fn served(&self) -> u64 {
        self.completed + self.errors + self.timed_out
    }

    pub fn mean_latency_ms(&self) -> f64 {
        match self.served() {
            0 => 0.0,
            served => self.latency_ms_total / served as f64,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        match self.submitted {
            0 => 0.0,
            submitted => (self.errors + self.timed_out + self.refused) as f64 / submitted as f64,
        }
    }
}

pub struct WorkerPool {
    commands: Vec<Sender<Command>>,
    tallies: Receiver<TickTally>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        target: Arc<dyn LoadTarget>,
        seed: u64,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (tally_tx, tally_rx) = channel::unbounded();
        let mut pool = Self {
            commands: Vec::with_capacity(size),
            tallies: tally_rx,
            handles: Vec::with_capacity(size),
        };

        for id in 0..size {
            let (command_tx, command_rx) = channel::bounded(1);
            let worker = Worker {
                id,
                target: Arc::clone(&target),
                stop: Arc::clone(&stop),
                rng: StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
                holds: BinaryHeap::new(),
                next_seq: 0,
                next_request: 0,
            };
            let tallies = tally_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("load-worker-{}", id))
                .spawn(move || worker.run(command_rx, tallies))
                .map_err(|err| Error::Worker(format!("failed to spawn worker {}: {}", id, err)))?;
            pool.commands.push(command_tx);
            pool.handles.push(handle);
        }

        debug!(workers = size, "worker pool started");
        Ok(pool)
    }

    /// Sends one order per worker and blocks until every worker reports.
    pub fn run_tick(&self, orders: &[WorkOrder]) -> Result<TickTally> {
        if orders.len() != self.commands.len() {
            return Err(Error::Worker(format!(
                "expected {} work orders, got {}",
                self.commands.len(),
                orders.len()
            )));
        }
        for (sender, order) in self.commands.iter().zip(orders) {
            sender
                .send(Command::Tick(*order))
                .map_err(|_| Error::Worker("worker exited before tick".to_string()))?;
        }

        let deadline = Instant::now() + tally_budget(orders);
        let mut merged = TickTally::default();
        for _ in 0..orders.len() {
            let tally = self.tallies.recv_deadline(deadline).map_err(|err| match err {
                RecvTimeoutError::Timeout => Error::Worker("worker tally timed out".to_string()),
                RecvTimeoutError::Disconnected => Error::Worker("tally channel closed".to_string()),
            })?;
            merged.merge(&tally);
        }
        Ok(merged)
    }

    /// Stops every worker, letting each drain its remaining holds, and joins
    /// the threads.
    pub fn shutdown(&mut self) -> Result<()> {
        for sender in self.commands.drain(..) {
            let _ = sender.send(Command::Shutdown);
        }
        let mut failed = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::Worker(format!("{} worker(s) panicked", failed)));
        }
        Ok(())
    }
}

/// Longest a tick may take: the slowest worker's paced submissions plus
/// [`TALLY_GRACE`].
fn tally_budget(orders: &[WorkOrder]) -> Duration {
    orders
        .iter()
        .filter_map(|order| {
            let pace = order.pace?;
            let requests = u32::try_from(order.requests).unwrap_or(u32::MAX);
            Some(pace.saturating_mul(requests))
        })
        .max()
        .unwrap_or_default()
        .saturating_add(TALLY_GRACE)
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Worker {
    id: usize,
    target: Arc<dyn LoadTarget>,
    stop: Arc<AtomicBool>,
    rng: StdRng,
    holds: BinaryHeap<Reverse<ScheduledRelease<Hold>>>,
    next_seq: u64,
    next_request: u64,
}

impl Worker {
    fn run(mut self, commands: Receiver<Command>, tallies: Sender<TickTally>) {
        for command in commands.iter() {
            match command {
                Command::Tick(order) => {
                    let tally = self.work(&order);
                    if tallies.send(tally).is_err() {
                        break;
                    }
                }
                Command::Shutdown => break,
            }
        }
        let drained = self.holds.len();
        while let Some(Reverse(release)) = self.holds.pop() {
            release.item.release();
        }
        trace!(worker = self.id, drained, "worker exiting");
    }

    fn work(&mut self, order: &WorkOrder) -> TickTally {
        let mut tally = TickTally {
            released: self.release_due(order.now_ms),
            ..TickTally::default()
        };

        for _ in 0..order.requests {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let request = self.next_request();
            let dispatch = self.target.dispatch(&request);
            tally.observe(&dispatch);

            if let Some(hold) = dispatch.hold {
                let done_at = order.now_ms + dispatch.latency_ms.ceil().max(0.0) as u64;
                self.holds
                    .push(Reverse(ScheduledRelease::new(done_at, self.next_seq, hold)));
                self.next_seq += 1;
            }
            if let Some(pace) = order.pace {
                thread::sleep(pace);
            }
        }
        tally
    }

    fn release_due(&mut self, now_ms: u64) -> u64 {
        let mut released = 0;
        while self
            .holds
            .peek()
            .is_some_and(|Reverse(next)| next.at_ms <= now_ms)
        {
            if let Some(Reverse(due)) = self.holds.pop() {
                due.item.release();
                released += 1;
            }
        }
        released
    }

    fn next_request(&mut self) -> Request {
        let key = self.rng.gen_range(0..CLIENT_KEYS);
        let id = ((self.id as u64) << 40) | self.next_request;
        self.next_request += 1;
        Request::new(id, format!("10.0.{}.{}", key / 256, key % 256))
    }
}
