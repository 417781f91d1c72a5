//! Tick-wheel scheduler properties: cadence over a wall-clock window and
//! convergence of removal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lwnsim::scheduler::{JobExecutor, TickWheel};

struct Counter(AtomicU32);

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Counter(AtomicU32::new(0)))
    }

    fn value(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobExecutor for Counter {
    async fn execute(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test(start_paused = true)]
async fn job_runs_at_least_floor_window_over_interval_minus_one_times() {
    let resolution = Duration::from_millis(100);
    let interval = Duration::from_millis(300);
    let window = Duration::from_secs(6);

    let wheel = TickWheel::new(resolution, 64, 4, 64);
    let counter = Counter::new();
    wheel.schedule(interval, counter.clone());

    tokio::time::sleep(window).await;
    wheel.stop().await;

    let minimum = (window.as_millis() / interval.as_millis()) as u32 - 1;
    let runs = counter.value();
    assert!(runs >= minimum, "expected >= {minimum} runs, got {runs}");
}

#[tokio::test(start_paused = true)]
async fn several_jobs_share_the_worker_pool() {
    let wheel = TickWheel::new(Duration::from_millis(50), 32, 2, 32);
    let counters: Vec<Arc<Counter>> = (0..8).map(|_| Counter::new()).collect();
    for counter in &counters {
        wheel.schedule(Duration::from_millis(100), counter.clone());
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    wheel.stop().await;
    for counter in &counters {
        assert!(counter.value() >= 10, "job starved: {} runs", counter.value());
    }
}

#[tokio::test(start_paused = true)]
async fn removed_job_stops_within_one_interval() {
    let interval = Duration::from_millis(200);
    let wheel = TickWheel::new(Duration::from_millis(50), 32, 2, 32);
    let counter = Counter::new();
    let id = wheel.schedule(interval, counter.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    wheel.remove(id);
    // The run already in flight may still land within the next interval.
    tokio::time::sleep(interval).await;
    let settled = counter.value();

    tokio::time::sleep(Duration::from_secs(2)).await;
    wheel.stop().await;
    assert_eq!(counter.value(), settled, "job kept running after removal");
}

#[tokio::test(start_paused = true)]
async fn stop_drains_in_flight_executions() {
    struct Slow(Arc<AtomicU32>);

    #[async_trait]
    impl JobExecutor for Slow {
        async fn execute(&self) {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let finished = Arc::new(AtomicU32::new(0));
    let wheel = TickWheel::new(Duration::from_millis(50), 32, 2, 32);
    wheel.schedule(Duration::from_millis(50), Arc::new(Slow(finished.clone())));

    // Give the job time to start, then stop mid-execution.
    tokio::time::sleep(Duration::from_millis(120)).await;
    wheel.stop().await;
    assert!(
        finished.load(Ordering::Relaxed) >= 1,
        "stop() cancelled a running executor"
    );
}
