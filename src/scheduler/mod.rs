//! # Tick-Wheel Scheduler
//!
//! A single hashed timing wheel driving periodic per-device work for
//! large populations. Every `resolution` the ticker advances the cursor,
//! empties the due bucket and fans its jobs out over a bounded work
//! queue. Workers run the executor and re-insert the job for its next
//! interval, so a tick dropped under load means a delayed run, never a
//! lost job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::logging::log_warn;

/// Work fired by the wheel. Bounded runtime expected: one device step.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self);
}

/// A periodic job: identity, cadence, work.
#[derive(Clone)]
pub struct Job {
    pub id: u64,
    pub interval: Duration,
    pub executor: Arc<dyn JobExecutor>,
}

struct WheelState {
    buckets: Vec<Vec<Job>>,
    cursor: usize,
    /// Jobs removed while in flight; checked before any (re-)insert
    cancelled: HashSet<u64>,
}

struct SchedulerInner {
    state: Mutex<WheelState>,
    resolution: Duration,
    work_tx: mpsc::Sender<Job>,
}

impl SchedulerInner {
    /// Inserts a job into the bucket `max(1, interval/resolution)` ticks
    /// ahead of the cursor.
    fn insert(&self, job: Job) {
        let mut state = self.state.lock().expect("wheel lock poisoned");
        if state.cancelled.remove(&job.id) {
            debug!("job {} cancelled, not re-scheduled", job.id);
            return;
        }
        let ticks = (job.interval.as_millis() / self.resolution.as_millis().max(1)) as usize;
        let ticks = ticks.max(1);
        let len = state.buckets.len();
        let idx = (state.cursor + ticks) % len;
        state.buckets[idx].push(job);
    }
}

/// The scheduler: wheel, ticker task and worker pool.
pub struct TickWheel {
    inner: Arc<SchedulerInner>,
    next_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TickWheel {
    /// Creates and starts the scheduler.
    pub fn new(
        resolution: Duration,
        num_buckets: usize,
        worker_count: usize,
        work_queue_size: usize,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel::<Job>(work_queue_size.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(WheelState {
                buckets: (0..num_buckets.max(1)).map(|_| Vec::new()).collect(),
                cursor: 0,
                cancelled: HashSet::new(),
            }),
            resolution: resolution.max(Duration::from_millis(1)),
            work_tx,
        });

        let mut handles = Vec::with_capacity(worker_count + 1);
        handles.push(tokio::spawn(Self::ticker(inner.clone(), stop_rx.clone())));

        // Workers share one receiver.
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        for _ in 0..worker_count.max(1) {
            handles.push(tokio::spawn(Self::worker(
                inner.clone(),
                work_rx.clone(),
                stop_rx.clone(),
            )));
        }

        TickWheel {
            inner,
            next_id: AtomicU64::new(1),
            stop_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Schedules an executor at the given interval; returns the job id.
    pub fn schedule(&self, interval: Duration, executor: Arc<dyn JobExecutor>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.insert(Job {
            id,
            interval,
            executor,
        });
        id
    }

    /// Removes a job. Linear over all buckets; removals are rare
    /// relative to ticks. A removed job's running execution is not
    /// interrupted, but it will not be scheduled again.
    pub fn remove(&self, id: u64) {
        let mut state = self.inner.state.lock().expect("wheel lock poisoned");
        let mut found = false;
        for bucket in &mut state.buckets {
            let before = bucket.len();
            bucket.retain(|job| job.id != id);
            found |= bucket.len() != before;
        }
        if !found {
            // In flight (queued or executing): suppress its re-insert.
            state.cancelled.insert(id);
        }
    }

    /// Stops the ticker and waits for workers to drain in-flight
    /// executions. Does not cancel a running executor.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn ticker(inner: Arc<SchedulerInner>, mut stop_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(inner.resolution);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop_rx.changed() => return,
            }
            let due: Vec<Job> = {
                let mut state = inner.state.lock().expect("wheel lock poisoned");
                let len = state.buckets.len();
                state.cursor = (state.cursor + 1) % len;
                let cursor = state.cursor;
                std::mem::take(&mut state.buckets[cursor])
            };
            for job in due {
                // A full work queue drops the job for this tick; it is
                // not re-inserted. The worker re-schedules on
                // completion, so missing a tick only delays a run.
                match inner.work_tx.try_send(job) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(job)) => {
                        log_warn(&format!(
                            "scheduler work queue full, tick dropped for job {}",
                            job.id
                        ));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    async fn worker(
        inner: Arc<SchedulerInner>,
        work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            let job = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    job = rx.recv() => job,
                    _ = stop_rx.changed() => return,
                }
            };
            let Some(job) = job else { return };
            job.executor.execute().await;
            inner.insert(job);
        }
    }
}
