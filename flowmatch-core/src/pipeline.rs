//! Single-producer single-consumer pipeline thread.
//!
//! A bounded ring feeds one dedicated consumer thread pinned to a CPU core.
//! `produce` never blocks: a full ring is reported back to the caller as
//! backpressure and counted. The consumer parks when the ring runs empty and
//! is unparked by the next producer push. Shutdown is cooperative: dropping
//! the pipeline drains in-flight jobs, then joins the thread.
//!
//! Statistics are collected per measurement window (start/stop), mirroring
//! the engine's performance-measurement protocol: throughput in jobs/µs,
//! utilisation as the busy fraction, backpressure as the declined ratio, and
//! average work time per job in µs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FlowMatchError, Result};

/// How long the consumer sleeps when parked on an empty ring. Parking is a
/// fallback; the producer unparks on every push.
const IDLE_PARK: Duration = Duration::from_micros(50);

/// Consumer-side counters, shared with the producer for statistics reads.
#[derive(Default)]
struct WorkCounters {
    jobs_done: AtomicU64,
    busy_ns: AtomicU64,
}

/// One measurement window: counter snapshots at start, deltas at stop.
#[derive(Default)]
struct Window {
    started: Option<Instant>,
    jobs_at_start: u64,
    busy_ns_at_start: u64,
    accepted_at_start: u64,
    declined_at_start: u64,
    // Results of the last completed window.
    elapsed_usec: f64,
    jobs: u64,
    busy_usec: f64,
    accepted: u64,
    declined: u64,
}

/// Bounded SPSC ring with a dedicated, core-pinned consumer thread.
pub struct PipelineThread<T: Send + 'static> {
    queue: Arc<ArrayQueue<T>>,
    stop: Arc<AtomicBool>,
    counters: Arc<WorkCounters>,
    consumer: Thread,
    handle: Option<JoinHandle<()>>,
    accepted: AtomicU64,
    declined: AtomicU64,
    window: Mutex<Window>,
}

impl<T: Send + 'static> PipelineThread<T> {
    /// Spawn the consumer thread.
    ///
    /// `capacity` must be a power of two. `core_idx` selects the CPU core
    /// the consumer is pinned to; pinning failures are logged and ignored.
    pub fn new<F>(capacity: usize, core_idx: usize, mut work: F) -> Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(FlowMatchError::ConfigInvalid(format!(
                "pipeline queue size must be a power of two, got {}",
                capacity
            )));
        }

        let queue = Arc::new(ArrayQueue::<T>::new(capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(WorkCounters::default());

        let thread_queue = Arc::clone(&queue);
        let thread_stop = Arc::clone(&stop);
        let thread_counters = Arc::clone(&counters);

        let handle = thread::Builder::new()
            .name(format!("flowmatch-worker-{}", core_idx))
            .spawn(move || {
                pin_to_core(core_idx);
                loop {
                    match thread_queue.pop() {
                        Some(job) => {
                            let begin = Instant::now();
                            work(job);
                            thread_counters
                                .busy_ns
                                .fetch_add(begin.elapsed().as_nanos() as u64, Ordering::Relaxed);
                            thread_counters.jobs_done.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            // Drain before honouring stop so queued jobs are
                            // never dropped.
                            if thread_stop.load(Ordering::Acquire) {
                                if thread_queue.is_empty() {
                                    break;
                                }
                            } else {
                                thread::park_timeout(IDLE_PARK);
                            }
                        }
                    }
                }
            })?;

        let consumer = handle.thread().clone();
        debug!(core = core_idx, capacity, "Pipeline thread started");

        Ok(Self {
            queue,
            stop,
            counters,
            consumer,
            handle: Some(handle),
            accepted: AtomicU64::new(0),
            declined: AtomicU64::new(0),
            window: Mutex::new(Window::default()),
        })
    }

    /// Enqueue a job without blocking.
    ///
    /// Returns false when the ring is full; the caller accounts this as
    /// backpressure.
    pub fn produce(&self, job: T) -> bool {
        match self.queue.push(job) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.consumer.unpark();
                true
            }
            Err(_) => {
                self.declined.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Jobs currently queued.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Jobs fully processed by the consumer.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.counters.jobs_done.load(Ordering::Relaxed)
    }

    /// Open a measurement window.
    pub fn start_performance_measurements(&self) {
        let mut window = self.window.lock();
        window.started = Some(Instant::now());
        window.jobs_at_start = self.counters.jobs_done.load(Ordering::Relaxed);
        window.busy_ns_at_start = self.counters.busy_ns.load(Ordering::Relaxed);
        window.accepted_at_start = self.accepted.load(Ordering::Relaxed);
        window.declined_at_start = self.declined.load(Ordering::Relaxed);
    }

    /// Close the measurement window and latch its statistics.
    pub fn stop_performance_measurements(&self) {
        let mut window = self.window.lock();
        let started = match window.started.take() {
            Some(started) => started,
            None => return,
        };
        window.elapsed_usec = started.elapsed().as_secs_f64() * 1e6;
        window.jobs = self.counters.jobs_done.load(Ordering::Relaxed) - window.jobs_at_start;
        window.busy_usec = (self.counters.busy_ns.load(Ordering::Relaxed)
            - window.busy_ns_at_start) as f64
            / 1e3;
        window.accepted = self.accepted.load(Ordering::Relaxed) - window.accepted_at_start;
        window.declined = self.declined.load(Ordering::Relaxed) - window.declined_at_start;
    }

    /// Jobs per µs over the last window.
    pub fn throughput(&self) -> f64 {
        let window = self.window.lock();
        if window.elapsed_usec == 0.0 {
            return 0.0;
        }
        window.jobs as f64 / window.elapsed_usec
    }

    /// Fraction of the last window the consumer spent working.
    pub fn utilization(&self) -> f64 {
        let window = self.window.lock();
        if window.elapsed_usec == 0.0 {
            return 0.0;
        }
        window.busy_usec / window.elapsed_usec
    }

    /// Ratio of declined produce calls over the last window.
    pub fn backpressure(&self) -> f64 {
        let window = self.window.lock();
        let total = window.accepted + window.declined;
        if total == 0 {
            return 0.0;
        }
        window.declined as f64 / total as f64
    }

    /// Average work time per job over the last window, in µs.
    pub fn average_work_time(&self) -> f64 {
        let window = self.window.lock();
        if window.jobs == 0 {
            return 0.0;
        }
        window.busy_usec / window.jobs as f64
    }
}

impl<T: Send + 'static> Drop for PipelineThread<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.consumer.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Pipeline consumer thread panicked");
            }
        }
    }
}

/// Pin the current thread to the given core index, if such a core exists.
fn pin_to_core(core_idx: usize) {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.into_iter().find(|c| c.id == core_idx) {
        Some(core_id) => {
            if !core_affinity::set_for_current(core_id) {
                warn!(core = core_idx, "Failed to pin pipeline thread to core");
            }
        }
        None => warn!(core = core_idx, "No such core to pin pipeline thread to"),
    }
}
