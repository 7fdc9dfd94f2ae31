//! Batch classification workers.
//!
//! A [`WorkerGroup`] owns a disjoint set of iSets plus at most one remainder
//! classifier and runs the full classification pipeline over a batch of `N`
//! packets: model inference per iSet, the bounded secondary search, the
//! validation phase, and the remainder pass, reduced by unsigned priority.
//!
//! The secondary search and validation are interleaved across all iSets in
//! lockstep rather than finishing one iSet before starting the next: every
//! round issues the key fetches of all iSets back to back, which exposes the
//! independent cache misses to the memory subsystem.
//!
//! [`SerialWorker`] executes on the caller's thread; [`ParallelWorker`] owns
//! a pinned pipeline thread and accepts jobs through a non-blocking SPSC
//! ring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::iset::{IntervalSet, SearchInfo};
use crate::pipeline::PipelineThread;
use crate::remainder::RemainderClassifier;
use crate::rule::{ClassifierOutput, PacketHeader};

/// A batch of `N` packet slots; `None` marks an empty slot.
pub type WorkBatch<const N: usize> = [Option<PacketHeader>; N];

/// Per-batch classification results.
pub type ActionBatch<const N: usize> = [ClassifierOutput; N];

/// Callback capability for consumers of worker results.
///
/// Results are published in dequeue order per worker; no ordering is
/// promised across workers, so listeners reassemble by `batch_id`.
pub trait WorkerListener<const N: usize>: Send + Sync {
    fn on_new_result(&self, results: ActionBatch<N>, worker_idx: u32, batch_id: u32);
}

/// Phase switches derived from the engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerFlags {
    /// Skip the secondary search and validation phases.
    pub disable_bin_search: bool,
    /// Skip the validation phase only.
    pub disable_validation_phase: bool,
    /// Publish the empty result without touching any subset.
    pub disable_all_classification: bool,
}

/// Reusable per-iSet scratch for the lockstep search. Sized once at group
/// construction so the classify path never allocates.
#[derive(Debug, Default)]
struct SearchScratch {
    key: Vec<f32>,
    position: Vec<usize>,
    l_bound: Vec<usize>,
    u_bound: Vec<usize>,
    below_upper: Vec<bool>,
    above_next: Vec<bool>,
}

impl SearchScratch {
    fn with_capacity(num_isets: usize) -> Self {
        Self {
            key: vec![0.0; num_isets],
            position: vec![0; num_isets],
            l_bound: vec![0; num_isets],
            u_bound: vec![0; num_isets],
            below_upper: vec![false; num_isets],
            above_next: vec![false; num_isets],
        }
    }
}

/// A group of subsets classifying the same batches on one CPU.
pub struct WorkerGroup<const N: usize> {
    isets: Vec<Arc<IntervalSet>>,
    remainder: Option<Arc<dyn RemainderClassifier>>,
    flags: WorkerFlags,
    info: Vec<[SearchInfo; N]>,
    scratch: SearchScratch,
}

impl<const N: usize> WorkerGroup<N> {
    pub fn new(
        isets: Vec<Arc<IntervalSet>>,
        remainder: Option<Arc<dyn RemainderClassifier>>,
        flags: WorkerFlags,
    ) -> Self {
        let num_isets = isets.len();
        Self {
            isets,
            remainder,
            flags,
            info: vec![[SearchInfo::default(); N]; num_isets],
            scratch: SearchScratch::with_capacity(num_isets),
        }
    }

    /// Group with no subsets; classifies everything as no-match.
    pub fn empty(flags: WorkerFlags) -> Self {
        Self::new(Vec::new(), None, flags)
    }

    /// Number of subsets in this group.
    pub fn count(&self) -> usize {
        self.isets.len() + usize::from(self.remainder.is_some())
    }

    /// Number of rules held across all subsets.
    pub fn num_rules(&self) -> usize {
        let iset_rules: usize = self.isets.iter().map(|iset| iset.len()).sum();
        iset_rules + self.remainder.as_ref().map_or(0, |r| r.num_rules())
    }

    /// The iSets assigned to this group.
    pub fn isets(&self) -> &[Arc<IntervalSet>] {
        &self.isets
    }

    /// The remainder classifier assigned to this group, if any.
    pub fn remainder(&self) -> Option<&Arc<dyn RemainderClassifier>> {
        self.remainder.as_ref()
    }

    /// Classify one batch through all phases.
    pub fn run(&mut self, packets: &WorkBatch<N>) -> ActionBatch<N> {
        let mut output = [ClassifierOutput::NO_MATCH; N];

        if self.flags.disable_all_classification {
            return output;
        }

        let num_isets = self.isets.len();
        if num_isets > 0 && !self.flags.disable_bin_search {
            // Inference across all iSets first; the searches below consume
            // the whole info matrix.
            for (k, iset) in self.isets.iter().enumerate() {
                iset.rqrmi_search(packets, &mut self.info[k]);
            }

            for i in 0..N {
                self.secondary_search(i);

                if self.flags.disable_validation_phase {
                    continue;
                }
                let header = match &packets[i] {
                    Some(header) => header,
                    None => continue,
                };

                // Validation, interleaved across iSets: take the best
                // priority among every candidate that survives the full
                // header check.
                for (k, iset) in self.isets.iter().enumerate() {
                    let candidate = iset.do_validation(header, self.scratch.position[k]);
                    if candidate.beats(&output[i]) {
                        output[i] = candidate;
                    }
                }
            }
        }

        if let Some(remainder) = &self.remainder {
            remainder.classify(packets, &mut output);
        }

        output
    }

    /// Narrow every iSet's predicted position for packet `i` down to the
    /// matching interval via a bounded binary search run in lockstep.
    ///
    /// The loop iterates `floor(log2(max_err)) + 1` times: halving the
    /// global maximum error bound is what guarantees each per-iSet window
    /// of `2·err + 1` slots is exhausted.
    fn secondary_search(&mut self, i: usize) {
        let scratch = &mut self.scratch;
        let mut max_error: u32 = 0;

        for (k, iset) in self.isets.iter().enumerate() {
            let info = self.info[k][i];
            let size = iset.len() as i64;
            let error = info.error as i64;
            // Truncating cast: a full-scale prediction seeds at `size` and
            // the first probe walks it back inside the array.
            let position = (info.output * size as f32) as i64;

            scratch.key[k] = info.input;
            scratch.position[k] = position as usize;
            scratch.u_bound[k] = (position + error).min((size - 1).max(0)) as usize;
            scratch.l_bound[k] = (position - error).max(0) as usize;
            max_error = max_error.max(info.error);
        }

        while max_error > 0 {
            // Fetch phase: touch both probe slots of every iSet before
            // acting on any comparison.
            for (k, iset) in self.isets.iter().enumerate() {
                scratch.below_upper[k] = iset.get_index(scratch.position[k]) <= scratch.key[k];
                scratch.above_next[k] = iset.get_index(scratch.position[k] + 1) > scratch.key[k];
            }

            // Move phase.
            for k in 0..self.isets.len() {
                if scratch.below_upper[k] && scratch.above_next[k] {
                    // Interval found; hold the position.
                } else if scratch.below_upper[k] {
                    scratch.l_bound[k] = scratch.position[k];
                    let sum = scratch.l_bound[k] + scratch.u_bound[k];
                    scratch.position[k] = (sum >> 1) + (sum & 1);
                } else if self.info[k][i].valid {
                    // An invalid prediction has no meaningful upper bound;
                    // only trusted predictions may shrink from above.
                    scratch.u_bound[k] = scratch.position[k];
                    scratch.position[k] = (scratch.l_bound[k] + scratch.u_bound[k]) >> 1;
                }
            }

            max_error >>= 1;
        }
    }
}

// ============================================================================
// Serial worker
// ============================================================================

/// Worker that classifies on the caller's thread.
pub struct SerialWorker<const N: usize> {
    worker_idx: u32,
    group: WorkerGroup<N>,
    listeners: Vec<Arc<dyn WorkerListener<N>>>,
    window_start: Option<Instant>,
    work_time_usec: f64,
    publish_time_usec: f64,
}

impl<const N: usize> SerialWorker<N> {
    pub fn new(worker_idx: u32, group: WorkerGroup<N>) -> Self {
        Self {
            worker_idx,
            group,
            listeners: Vec::new(),
            window_start: None,
            work_time_usec: 0.0,
            publish_time_usec: 0.0,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn WorkerListener<N>>) {
        self.listeners.push(listener);
    }

    /// Classify a batch and publish the results. Always consumes the job.
    pub fn classify(&mut self, batch_id: u32, packets: &WorkBatch<N>) -> ActionBatch<N> {
        let results = self.group.run(packets);

        let publish_start = Instant::now();
        for listener in &self.listeners {
            listener.on_new_result(results, self.worker_idx, batch_id);
        }
        self.publish_time_usec += publish_start.elapsed().as_secs_f64() * 1e6;

        results
    }

    pub fn start_performance_measurements(&mut self) {
        self.window_start = Some(Instant::now());
        self.publish_time_usec = 0.0;
    }

    pub fn stop_performance_measurements(&mut self) {
        if let Some(started) = self.window_start.take() {
            self.work_time_usec = started.elapsed().as_secs_f64() * 1e6;
        }
    }

    /// Length of the last measurement window in µs.
    pub fn work_time_usec(&self) -> f64 {
        self.work_time_usec
    }

    /// Time spent inside listener callbacks, in µs.
    pub fn publish_time_usec(&self) -> f64 {
        self.publish_time_usec
    }

    pub fn group(&self) -> &WorkerGroup<N> {
        &self.group
    }
}

// ============================================================================
// Parallel worker
// ============================================================================

/// One job for a parallel worker.
#[derive(Debug, Clone, Copy)]
pub struct Job<const N: usize> {
    pub packets: WorkBatch<N>,
    pub batch_id: u32,
}

/// Worker that classifies on a dedicated pipeline thread pinned to a core.
///
/// `classify` is the producer side of the ring: it never blocks, returning
/// false when the ring is full so the dispatcher can account backpressure.
pub struct ParallelWorker<const N: usize> {
    pipeline: PipelineThread<Job<N>>,
    publish_ns: Arc<AtomicU64>,
}

impl<const N: usize> ParallelWorker<N> {
    pub fn new(
        worker_idx: u32,
        mut group: WorkerGroup<N>,
        listeners: Vec<Arc<dyn WorkerListener<N>>>,
        queue_size: usize,
        core_idx: usize,
    ) -> Result<Self> {
        let publish_ns = Arc::new(AtomicU64::new(0));
        let work_publish_ns = Arc::clone(&publish_ns);

        let pipeline = PipelineThread::new(queue_size, core_idx, move |job: Job<N>| {
            let results = group.run(&job.packets);

            let publish_start = Instant::now();
            for listener in &listeners {
                listener.on_new_result(results, worker_idx, job.batch_id);
            }
            work_publish_ns.fetch_add(
                publish_start.elapsed().as_nanos() as u64,
                Ordering::Relaxed,
            );
        })?;

        Ok(Self {
            pipeline,
            publish_ns,
        })
    }

    /// Post a batch to the worker. Returns false on backpressure.
    pub fn classify(&self, batch_id: u32, packets: WorkBatch<N>) -> bool {
        self.pipeline.produce(Job { packets, batch_id })
    }

    /// Batches fully processed so far.
    pub fn completed(&self) -> u64 {
        self.pipeline.completed()
    }

    pub fn start_performance_measurements(&self) {
        self.publish_ns.store(0, Ordering::Relaxed);
        self.pipeline.start_performance_measurements();
    }

    pub fn stop_performance_measurements(&self) {
        self.pipeline.stop_performance_measurements();
    }

    /// Batches per µs over the last window.
    pub fn throughput(&self) -> f64 {
        self.pipeline.throughput()
    }

    /// Busy fraction of the last window.
    pub fn utilization(&self) -> f64 {
        self.pipeline.utilization()
    }

    /// Declined ratio over the last window.
    pub fn backpressure(&self) -> f64 {
        self.pipeline.backpressure()
    }

    /// Average work time per batch over the last window, in µs.
    pub fn average_work_time(&self) -> f64 {
        self.pipeline.average_work_time()
    }

    /// Time spent inside listener callbacks, in µs.
    pub fn publish_time_usec(&self) -> f64 {
        self.publish_ns.load(Ordering::Relaxed) as f64 / 1e3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{header, strip_iset, uneven_iset, STRIP_COUNT};
    use crate::remainder::LinearRemainder;
    use crate::rule::{FieldRange, Rule};
    use parking_lot::Mutex;

    fn group_with(
        isets: Vec<Arc<IntervalSet>>,
        remainder: Option<Arc<dyn RemainderClassifier>>,
    ) -> WorkerGroup<1> {
        WorkerGroup::new(isets, remainder, WorkerFlags::default())
    }

    #[test]
    fn test_single_iset_exact_model() {
        let mut group = group_with(vec![Arc::new(strip_iset(0, 0))], None);
        // Strip 5 with the protocol byte the rules demand.
        let batch = [Some(header(&[5 << 26, 0, 0, 0, 6]))];
        let out = group.run(&batch)[0];
        assert_eq!(out.priority, 100 + 5);

        // Wrong protocol: the model still points at strip 5 but validation
        // rejects it.
        let batch = [Some(header(&[5 << 26, 0, 0, 0, 99]))];
        assert_eq!(group.run(&batch)[0], ClassifierOutput::NO_MATCH);
    }

    #[test]
    fn test_search_converges_with_coarse_model() {
        // Deliberately bad model predictions with a generous error bound;
        // the lockstep search must still land on the right interval.
        let iset = Arc::new(uneven_iset(0));
        let mut group = group_with(vec![Arc::clone(&iset)], None);
        let oracle = LinearRemainder::from_rules(iset.extract_rules());

        let mut seed: u64 = 0x5EED_0001;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            // Keep key values on the 256-aligned grid the fixtures use, so
            // the f32 key projection stays exact.
            let value = (seed >> 32) as u32 & !0xFF;
            let h = header(&[value, 0, 0, 0, 6]);
            let got = group.run(&[Some(h)])[0];
            let expected = oracle.lookup(&h);
            assert_eq!(got, expected, "value {}", value);
        }
    }

    #[test]
    fn test_zero_error_uses_prediction_directly() {
        // err = 0 skips the search loop entirely; the exact model makes the
        // raw prediction correct.
        let mut group = group_with(vec![Arc::new(strip_iset(0, 0))], None);
        for strip in [0u32, 1, STRIP_COUNT - 1] {
            let batch = [Some(header(&[strip << 26, 0, 0, 0, 6]))];
            let out = group.run(&batch)[0];
            assert_eq!(out.priority, (100 + strip) as i32, "strip {}", strip);
        }
    }

    #[test]
    fn test_multiple_isets_take_priority_minimum() {
        // Two iSets index different fields; both cover the packet and the
        // lower priority number must win.
        let iset_a = Arc::new(strip_iset(0, 0));
        let iset_b = Arc::new(strip_iset(1, 1000));
        let mut group = group_with(vec![iset_a, iset_b], None);

        let batch = [Some(header(&[3 << 26, 7 << 26, 0, 0, 6]))];
        let out = group.run(&batch)[0];
        // iSet A: priority 103. iSet B: priority 1107. A wins.
        assert_eq!(out.priority, 103);
    }

    #[test]
    fn test_remainder_improves_and_never_worsens() {
        let iset = Arc::new(strip_iset(0, 0));

        // A remainder rule that beats the iSet on strip 2 and one that
        // loses on strip 3.
        let better = Rule {
            priority: 1,
            action: 9001,
            fields: vec![
                FieldRange {
                    low: 2 << 26,
                    high: (3 << 26) - 1,
                },
                FieldRange::ANY,
                FieldRange::ANY,
                FieldRange::ANY,
                FieldRange::exact(6),
            ],
        };
        let worse = Rule {
            priority: 5000,
            action: 9002,
            fields: vec![
                FieldRange {
                    low: 3 << 26,
                    high: (4 << 26) - 1,
                },
                FieldRange::ANY,
                FieldRange::ANY,
                FieldRange::ANY,
                FieldRange::exact(6),
            ],
        };
        let remainder: Arc<dyn RemainderClassifier> =
            Arc::new(LinearRemainder::from_rules(vec![better, worse]));
        let mut group = group_with(vec![iset], Some(remainder));

        let out = group.run(&[Some(header(&[2 << 26, 0, 0, 0, 6]))])[0];
        assert_eq!(out.action, 9001);

        let out = group.run(&[Some(header(&[3 << 26, 0, 0, 0, 6]))])[0];
        assert_eq!(out.priority, 103);
    }

    #[test]
    fn test_disable_all_classification() {
        let remainder: Arc<dyn RemainderClassifier> =
            Arc::new(LinearRemainder::from_rules(vec![Rule {
                priority: 0,
                action: 1,
                fields: vec![FieldRange::ANY; 5],
            }]));
        let mut group = WorkerGroup::<1>::new(
            vec![Arc::new(strip_iset(0, 0))],
            Some(remainder),
            WorkerFlags {
                disable_all_classification: true,
                ..Default::default()
            },
        );
        let out = group.run(&[Some(header(&[0, 0, 0, 0, 6]))])[0];
        assert_eq!(out, ClassifierOutput::NO_MATCH);
    }

    #[test]
    fn test_disable_bin_search_still_runs_remainder() {
        let iset = Arc::new(strip_iset(0, 0));
        let oracle = LinearRemainder::from_rules(iset.extract_rules());
        let remainder: Arc<dyn RemainderClassifier> = Arc::new(oracle.clone());

        let mut group = WorkerGroup::<1>::new(
            vec![iset],
            Some(remainder),
            WorkerFlags {
                disable_bin_search: true,
                ..Default::default()
            },
        );

        let h = header(&[9 << 26, 0, 0, 0, 6]);
        let out = group.run(&[Some(h)])[0];
        assert_eq!(out, oracle.lookup(&h));
    }

    #[test]
    fn test_disable_validation_leaves_no_match() {
        let mut group = WorkerGroup::<1>::new(
            vec![Arc::new(strip_iset(0, 0))],
            None,
            WorkerFlags {
                disable_validation_phase: true,
                ..Default::default()
            },
        );
        let out = group.run(&[Some(header(&[5 << 26, 0, 0, 0, 6]))])[0];
        assert_eq!(out, ClassifierOutput::NO_MATCH);
    }

    #[test]
    fn test_empty_slots_are_skipped() {
        let mut group = group_with(vec![Arc::new(strip_iset(0, 0))], None);
        let out = group.run(&[None])[0];
        assert_eq!(out, ClassifierOutput::NO_MATCH);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u32, u32, i32)>>,
    }

    impl WorkerListener<1> for Recorder {
        fn on_new_result(&self, results: ActionBatch<1>, worker_idx: u32, batch_id: u32) {
            self.seen
                .lock()
                .push((worker_idx, batch_id, results[0].priority));
        }
    }

    #[test]
    fn test_serial_worker_publishes_to_listeners() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = SerialWorker::new(7, group_with(vec![Arc::new(strip_iset(0, 0))], None));
        worker.add_listener(Arc::clone(&recorder) as Arc<dyn WorkerListener<1>>);

        worker.classify(42, &[Some(header(&[4 << 26, 0, 0, 0, 6]))]);

        let seen = recorder.seen.lock();
        assert_eq!(seen.as_slice(), &[(7, 42, 104)]);
    }

    #[test]
    fn test_parallel_worker_roundtrip() {
        let recorder = Arc::new(Recorder::default());
        let worker = ParallelWorker::new(
            3,
            group_with(vec![Arc::new(strip_iset(0, 0))], None),
            vec![Arc::clone(&recorder) as Arc<dyn WorkerListener<1>>],
            16,
            0,
        )
        .unwrap();

        for batch_id in 0..10u32 {
            let strip = batch_id % STRIP_COUNT;
            assert!(worker.classify(batch_id, [Some(header(&[strip << 26, 0, 0, 0, 6]))]));
        }
        while worker.completed() < 10 {
            std::thread::park_timeout(std::time::Duration::from_micros(50));
        }
        drop(worker);

        let mut seen = recorder.seen.lock().clone();
        seen.sort_by_key(|&(_, batch_id, _)| batch_id);
        assert_eq!(seen.len(), 10);
        for (batch_id, &(worker_idx, seen_id, priority)) in seen.iter().enumerate() {
            assert_eq!(worker_idx, 3);
            assert_eq!(seen_id, batch_id as u32);
            assert_eq!(priority, (100 + batch_id as u32 % STRIP_COUNT) as i32);
        }
    }
}
