//! The classification engine.
//!
//! [`SerialEngine`] loads a pre-built classifier image, materialises the
//! iSets and the remainder classifier, groups them across the configured
//! cores, and classifies packets on the caller's thread. Only core 0's
//! group is consumed here; in the parallel build the remaining groups are
//! handed to pipeline workers.
//!
//! Everything that can fail does so at load time. Once `load` returns, the
//! classify path is infallible and allocation-free.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{FlowMatchError, Result};
use crate::iset::IntervalSet;
use crate::object_io::{ObjectPacker, ObjectReader};
use crate::remainder::{make_remainder, LinearRemainder, RemainderClassifier, RemainderFactory};
use crate::rule::{load_rule_database, sort_by_priority, ClassifierOutput, PacketHeader, Rule};
use crate::worker::{ActionBatch, WorkBatch, WorkerFlags, WorkerGroup};

// ============================================================================
// Configuration
// ============================================================================

/// Engine construction options.
pub struct EngineConfig {
    /// Partition subsets across this many workers. The serial engine
    /// consumes only core 0's partition.
    pub num_of_cores: u32,
    /// Skip iSets with index `>= max_subsets`; negative means no limit.
    pub max_subsets: i32,
    /// Skip iSets with index `< start_from_iset`.
    pub start_from_iset: u32,
    /// If non-empty, keep only iSets whose field appears in this list and
    /// remap field positions accordingly.
    pub arbitrary_fields: Vec<u32>,
    /// Drop all iSets and route every rule to the remainder.
    pub disable_isets: bool,
    /// Omit the remainder classifier entirely.
    pub disable_remainder: bool,
    /// Skip the secondary search and validation phases.
    pub disable_bin_search: bool,
    /// Skip the validation phase only.
    pub disable_validation_phase: bool,
    /// Return the no-match sentinel immediately.
    pub disable_all_classification: bool,
    /// Always synthesize the remainder from the extracted rules.
    pub force_rebuilding_remainder: bool,
    /// Treat the supplied remainder instance as authoritative; never load
    /// or rebuild it.
    pub external_remainder: bool,
    /// Tag of the remainder implementation used when rebuilding.
    pub remainder_type: String,
    /// The remainder classifier instance.
    pub remainder_classifier: Option<Box<dyn RemainderClassifier>>,
    /// Hook resolving remainder tags provided by the host.
    pub remainder_factory: Option<RemainderFactory>,
    /// Pipeline ring capacity; must be a power of two.
    pub queue_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_of_cores: 1,
            max_subsets: -1,
            start_from_iset: 0,
            arbitrary_fields: Vec::new(),
            disable_isets: false,
            disable_remainder: false,
            disable_bin_search: false,
            disable_validation_phase: false,
            disable_all_classification: false,
            force_rebuilding_remainder: false,
            external_remainder: false,
            remainder_type: LinearRemainder::TAG.to_string(),
            remainder_classifier: None,
            remainder_factory: None,
            queue_size: 256,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("num_of_cores", &self.num_of_cores)
            .field("max_subsets", &self.max_subsets)
            .field("start_from_iset", &self.start_from_iset)
            .field("arbitrary_fields", &self.arbitrary_fields)
            .field("disable_isets", &self.disable_isets)
            .field("disable_remainder", &self.disable_remainder)
            .field("disable_bin_search", &self.disable_bin_search)
            .field("disable_validation_phase", &self.disable_validation_phase)
            .field(
                "disable_all_classification",
                &self.disable_all_classification,
            )
            .field(
                "force_rebuilding_remainder",
                &self.force_rebuilding_remainder,
            )
            .field("external_remainder", &self.external_remainder)
            .field("remainder_type", &self.remainder_type)
            .field(
                "remainder_classifier",
                &self.remainder_classifier.as_ref().map(|c| c.name()),
            )
            .field("remainder_factory", &self.remainder_factory.is_some())
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.num_of_cores == 0 {
            return Err(FlowMatchError::ConfigInvalid(
                "num_of_cores must be at least 1".into(),
            ));
        }
        if self.queue_size == 0 || !self.queue_size.is_power_of_two() {
            return Err(FlowMatchError::ConfigInvalid(format!(
                "queue_size must be a power of two, got {}",
                self.queue_size
            )));
        }
        if !self.disable_remainder && self.remainder_classifier.is_none() {
            return Err(FlowMatchError::ConfigInvalid(
                "remainder classifier is enabled but is not set".into(),
            ));
        }
        Ok(())
    }

    fn worker_flags(&self) -> WorkerFlags {
        WorkerFlags {
            disable_bin_search: self.disable_bin_search,
            disable_validation_phase: self.disable_validation_phase,
            disable_all_classification: self.disable_all_classification,
        }
    }
}

// ============================================================================
// Subsets
// ============================================================================

/// Umbrella over the two subset kinds, for load balancing. The tag is
/// decided once at load; no downcasting afterwards.
enum Subset {
    Iset(Arc<IntervalSet>),
    Remainder(Arc<dyn RemainderClassifier>),
}

impl Subset {
    fn byte_size(&self) -> usize {
        match self {
            Subset::Iset(iset) => iset.byte_size(),
            Subset::Remainder(remainder) => remainder.byte_size(),
        }
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subset::Iset(iset) => write!(f, "{}", iset),
            Subset::Remainder(remainder) => write!(
                f,
                "remainder-{}(rules={})",
                remainder.name(),
                remainder.num_rules()
            ),
        }
    }
}

// ============================================================================
// Serial engine
// ============================================================================

/// Serial learned-index classifier over batches of `N` packets.
///
/// `classify` runs synchronously on the caller's thread and never suspends.
/// A single instance is not safe to share across threads; distinct
/// instances are independent.
pub struct SerialEngine<const N: usize = 1> {
    config: EngineConfig,
    num_of_isets: u32,
    num_of_rules: u32,
    size_bytes: u32,
    build_time_ms: u32,
    pack_buffer: Bytes,
    packet_counter: u64,
    worker: WorkerGroup<N>,
    remainder: Option<Arc<dyn RemainderClassifier>>,
    start_time: Option<Instant>,
    measured_usec: f64,
}

impl<const N: usize> SerialEngine<N> {
    /// Load a classifier from an image.
    pub fn load(mut config: EngineConfig, mut reader: ObjectReader) -> Result<Self> {
        config.validate()?;

        // Retained for packing; iSets borrow into this buffer via the
        // sub-readers below.
        let pack_buffer = reader.as_bytes().clone();

        let num_of_isets = reader.read_u32()?;
        let num_of_rules = reader.read_u32()?;
        let _declared_size = reader.read_u32()?;
        let build_time_ms = reader.read_u32()?;

        if config.disable_bin_search {
            info!("Disabling binary search in all iSets");
        }
        if config.disable_remainder {
            info!("Disabling remainder classifier");
        }
        if config.disable_validation_phase {
            info!("Disabling validation phase in all iSets");
        }
        if config.disable_all_classification {
            info!("Disabling classification");
        }

        // Load subsets, applying the filter policy.
        let mut kept: Vec<Arc<IntervalSet>> = Vec::new();
        let mut remainder_rules: Vec<Rule> = Vec::new();
        let mut iset_rule_count: usize = 0;
        let mut size_bytes: usize = 0;

        for i in 0..num_of_isets {
            let mut sub = reader.sub_reader()?;
            let mut iset = IntervalSet::load(i, &mut sub)?;

            let skip = (config.max_subsets >= 0 && i >= config.max_subsets as u32)
                || i < config.start_from_iset
                || (!config.arbitrary_fields.is_empty()
                    && !config.arbitrary_fields.contains(&iset.field_index()));

            if skip || config.disable_isets {
                let extracted = iset.extract_rules();
                info!(
                    iset = i,
                    rules = extracted.len(),
                    "Skipping iSet, routing its rules to the remainder"
                );
                append_projected(&mut remainder_rules, extracted, &config.arbitrary_fields)?;
            } else {
                if !config.arbitrary_fields.is_empty() {
                    iset.rearrange_fields(&config.arbitrary_fields)?;
                }
                iset_rule_count += iset.len();
                size_bytes += iset.byte_size();
                kept.push(Arc::new(iset));
            }
        }
        let any_filtered = (kept.len() as u32) < num_of_isets;

        // The trailing bytes are the packed remainder object followed by
        // the predefined remainder rule database.
        let remainder_object = reader.sub_reader()?;
        let mut db_reader = reader.sub_reader()?;
        let predefined = load_rule_database(&mut db_reader)?;
        append_projected(&mut remainder_rules, predefined, &config.arbitrary_fields)?;
        sort_by_priority(&mut remainder_rules);

        let net_total_rules = (iset_rule_count + remainder_rules.len()).max(1);
        for iset in &kept {
            info!(
                iset = iset.image_index(),
                field = iset.field_index(),
                rules = iset.len(),
                coverage_pct = iset.len() as f64 / net_total_rules as f64 * 100.0,
                bytes = iset.byte_size(),
                "iSet loaded"
            );
        }
        info!(
            coverage_pct = iset_rule_count as f64 / net_total_rules as f64 * 100.0,
            remainder_rules = remainder_rules.len(),
            "Total iSet coverage"
        );

        let remainder =
            load_remainder(&mut config, remainder_object, &remainder_rules, any_filtered)?;

        let worker = group_subsets_to_cores::<N>(&config, kept, remainder.clone())?;

        Ok(Self {
            config,
            num_of_isets,
            num_of_rules,
            size_bytes: size_bytes as u32,
            build_time_ms,
            pack_buffer,
            packet_counter: 0,
            worker,
            remainder,
            start_time: None,
            measured_usec: 0.0,
        })
    }

    /// Classify a single packet header.
    pub fn classify(&mut self, header: &PacketHeader) -> ClassifierOutput {
        self.packet_counter += 1;
        let mut packets: WorkBatch<N> = [None; N];
        packets[0] = Some(*header);
        self.worker.run(&packets)[0]
    }

    /// Classify a full batch; the counter advances by the number of
    /// occupied slots.
    pub fn classify_batch(&mut self, packets: &WorkBatch<N>) -> ActionBatch<N> {
        self.packet_counter += packets.iter().filter(|p| p.is_some()).count() as u64;
        self.worker.run(packets)
    }

    /// Pack this classifier: the original image bytes, with the currently
    /// loaded remainder appended as one more length-prefixed object.
    pub fn pack(&self) -> ObjectPacker {
        let mut output = ObjectPacker::new();
        output.append_raw(&self.pack_buffer);
        if let Some(remainder) = &self.remainder {
            output.push_object(&remainder.pack());
        }
        output
    }

    /// Reset all classifier counters.
    pub fn reset_counters(&mut self) {
        self.packet_counter = 0;
    }

    /// Advance the packet counter without classifying, for callers that
    /// satisfied a packet elsewhere (e.g. an upstream cache) but want the
    /// denominator to stay truthful.
    pub fn advance_counter(&mut self) {
        self.packet_counter += 1;
    }

    #[inline]
    pub fn packet_count(&self) -> u64 {
        self.packet_counter
    }

    pub fn start_performance_measurement(&mut self) {
        self.start_time = Some(Instant::now());
    }

    pub fn stop_performance_measurement(&mut self) {
        if let Some(started) = self.start_time.take() {
            self.measured_usec = started.elapsed().as_secs_f64() * 1e6;
        }
    }

    /// Length of the last measurement window in µs.
    pub fn measured_time_usec(&self) -> f64 {
        self.measured_usec
    }

    /// Average time per classified packet over the last window, in µs.
    pub fn avg_packet_time_usec(&self) -> f64 {
        if self.packet_counter == 0 {
            return 0.0;
        }
        self.measured_usec / self.packet_counter as f64
    }

    /// Emit statistics through the log, gated by verbosity.
    pub fn log_statistics(&self, verbose: u32) {
        if verbose > 2 {
            for iset in self.worker.isets() {
                debug!(
                    iset = iset.image_index(),
                    errors = ?iset.error_list(),
                    expected_error = iset.expected_error(),
                    "iSet model errors"
                );
            }
        }
        info!(
            total_usec = self.measured_usec,
            packets = self.packet_counter,
            avg_usec = self.avg_packet_time_usec(),
            "Classification performance"
        );
        if verbose > 1 {
            if let Some(remainder) = &self.remainder {
                info!(
                    kind = remainder.name(),
                    rules = remainder.num_rules(),
                    bytes = remainder.byte_size(),
                    "Remainder classifier"
                );
            }
        }
    }

    /// Number of iSet objects in the image, before filtering.
    #[inline]
    pub fn num_of_isets(&self) -> u32 {
        self.num_of_isets
    }

    /// Number of rules declared by the image.
    #[inline]
    pub fn num_of_rules(&self) -> u32 {
        self.num_of_rules
    }

    /// Total byte size of the kept iSets.
    #[inline]
    pub fn byte_size(&self) -> u32 {
        self.size_bytes
    }

    /// Build time recorded in the image, in milliseconds.
    #[inline]
    pub fn build_time_ms(&self) -> u32 {
        self.build_time_ms
    }

    /// Number of subsets assigned to this engine's own worker.
    #[inline]
    pub fn subset_count(&self) -> usize {
        self.worker.count()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Extend `into` with `rules`, projecting each rule onto the arbitrary
/// field list when one is configured so the remainder sees the same header
/// layout as the remapped iSets.
fn append_projected(
    into: &mut Vec<Rule>,
    rules: Vec<Rule>,
    arbitrary_fields: &[u32],
) -> Result<()> {
    if arbitrary_fields.is_empty() {
        into.extend(rules);
        return Ok(());
    }
    for rule in rules {
        let projected = rule.project_fields(arbitrary_fields).ok_or_else(|| {
            FlowMatchError::ConfigInvalid(format!(
                "arbitrary field list {:?} out of range for rule with {} fields",
                arbitrary_fields,
                rule.fields.len()
            ))
        })?;
        into.push(projected);
    }
    Ok(())
}

/// Load, rebuild, or pass through the remainder classifier.
fn load_remainder(
    config: &mut EngineConfig,
    image_object: ObjectReader,
    remainder_rules: &[Rule],
    any_filtered: bool,
) -> Result<Option<Arc<dyn RemainderClassifier>>> {
    if config.disable_remainder {
        config.remainder_classifier = None;
        return Ok(None);
    }

    let mut classifier = config.remainder_classifier.take().ok_or_else(|| {
        FlowMatchError::ConfigInvalid("remainder classifier is enabled but is not set".into())
    })?;

    // An external remainder is authoritative: the caller loaded it.
    if config.external_remainder {
        return Ok(Some(Arc::from(classifier)));
    }

    // Any filtered-out iSet means the image's packed remainder no longer
    // covers the right rule set.
    let rebuild = config.force_rebuilding_remainder || any_filtered;
    let source = if rebuild {
        ObjectReader::new(build_remainder(config, remainder_rules)?)
    } else {
        image_object
    };

    if let Err(err) = classifier.load(source) {
        warn!(error = %err, "Remainder classifier failed to load, rebuilding to recover");
        let packed = build_remainder(config, remainder_rules)
            .map_err(|e| FlowMatchError::RemainderLoad(e.to_string()))?;
        classifier
            .load(ObjectReader::new(packed))
            .map_err(|e| FlowMatchError::RemainderLoad(e.to_string()))?;
    }
    Ok(Some(Arc::from(classifier)))
}

/// Build a remainder classifier from the collected rules and return its
/// packed bytes. Building runs on a throwaway instance so the configured
/// classifier only ever sees packed input.
fn build_remainder(config: &EngineConfig, rules: &[Rule]) -> Result<Bytes> {
    info!(
        kind = %config.remainder_type,
        rules = rules.len(),
        "Building remainder classifier from extracted rules"
    );
    let mut builder = make_remainder(&config.remainder_type, config.remainder_factory.as_ref())?;
    builder.build(rules)?;
    Ok(builder.pack().into_bytes())
}

/// Greedy size-balanced packing of subsets onto cores. Core 0's group is
/// returned for the serial worker.
fn group_subsets_to_cores<const N: usize>(
    config: &EngineConfig,
    isets: Vec<Arc<IntervalSet>>,
    remainder: Option<Arc<dyn RemainderClassifier>>,
) -> Result<WorkerGroup<N>> {
    let mut subsets: Vec<Subset> = isets.into_iter().map(Subset::Iset).collect();
    if let Some(remainder) = remainder {
        subsets.push(Subset::Remainder(remainder));
    }
    if subsets.is_empty() {
        return Err(FlowMatchError::NoValidSubsets);
    }

    subsets.sort_by(|a, b| b.byte_size().cmp(&a.byte_size()));

    let cores = config.num_of_cores as usize;
    let mut groups: Vec<Vec<Subset>> = (0..cores).map(|_| Vec::new()).collect();
    let mut loads = vec![0usize; cores];
    for subset in subsets {
        // First core currently holding the least bytes.
        let target = (0..cores).min_by_key(|&c| loads[c]).unwrap_or(0);
        loads[target] += subset.byte_size();
        groups[target].push(subset);
    }

    for (core, group) in groups.iter().enumerate() {
        let held = group
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        info!(core, bytes = loads[core], holds = %held, "Worker assignment");
    }

    let mut core_isets = Vec::new();
    let mut core_remainder = None;
    for subset in groups.swap_remove(0) {
        match subset {
            Subset::Iset(iset) => core_isets.push(iset),
            Subset::Remainder(remainder) => core_remainder = Some(remainder),
        }
    }
    Ok(WorkerGroup::new(
        core_isets,
        core_remainder,
        config.worker_flags(),
    ))
}
