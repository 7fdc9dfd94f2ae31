//! Remainder classifiers.
//!
//! The remainder covers every rule the iSets cannot represent (wildcards on
//! the indexed field, filtered-out iSets, and the image's predefined
//! remainder set). The engine talks to it through the object-safe
//! [`RemainderClassifier`] trait and never relies on the concrete algorithm;
//! production deployments plug in decision-tree or tuple-space
//! implementations ("cutsplit", "tuplemerge") through the factory hook,
//! while this crate ships [`LinearRemainder`] as the reference
//! implementation and default rebuild target.

use std::sync::Arc;

use tracing::debug;

use crate::error::{FlowMatchError, Result};
use crate::object_io::{ObjectPacker, ObjectReader};
use crate::rule::{
    load_rule_database, pack_rule_database, sort_by_priority, ClassifierOutput, PacketHeader,
    Rule,
};

/// Exact multi-field classifier used behind the learned subsets.
///
/// `classify` must only overwrite an output slot when its candidate beats
/// the slot's current priority under the unsigned interpretation; this is
/// what makes the remainder pass monotone with respect to the iSet results.
pub trait RemainderClassifier: Send + Sync {
    /// Construct the classifier from a rule list.
    fn build(&mut self, rules: &[Rule]) -> Result<()>;

    /// Load a previously packed classifier.
    fn load(&mut self, reader: ObjectReader) -> Result<()>;

    /// Serialise the classifier.
    fn pack(&self) -> ObjectPacker;

    /// Classify a batch, improving `output` in place.
    fn classify(&self, headers: &[Option<PacketHeader>], output: &mut [ClassifierOutput]);

    /// Memory footprint used for load balancing, in bytes.
    fn byte_size(&self) -> usize;

    /// Number of rules held.
    fn num_rules(&self) -> usize;

    /// Implementation tag, e.g. `"linear"`, `"cutsplit"`, `"tuplemerge"`.
    fn name(&self) -> &'static str;
}

/// Hook for constructing remainder implementations that live outside this
/// crate. Returns `None` for tags the host does not provide.
pub type RemainderFactory =
    Arc<dyn Fn(&str) -> Option<Box<dyn RemainderClassifier>> + Send + Sync>;

/// Resolve a remainder tag, consulting the host factory first and falling
/// back to the built-in implementations.
pub fn make_remainder(
    tag: &str,
    factory: Option<&RemainderFactory>,
) -> Result<Box<dyn RemainderClassifier>> {
    if let Some(factory) = factory {
        if let Some(classifier) = factory(tag) {
            return Ok(classifier);
        }
    }
    match tag {
        LinearRemainder::TAG => Ok(Box::new(LinearRemainder::new())),
        other => Err(FlowMatchError::ConfigInvalid(format!(
            "cannot build a remainder classifier of type {:?}",
            other
        ))),
    }
}

// ============================================================================
// Linear reference implementation
// ============================================================================

/// Priority-ordered linear scan.
///
/// Rules are kept sorted best-first, so the first match per packet is the
/// final answer. Exact and simple; the production tree-based classifiers
/// replace it where rule counts make O(n) scans too slow.
#[derive(Debug, Default, Clone)]
pub struct LinearRemainder {
    rules: Vec<Rule>,
}

impl LinearRemainder {
    pub const TAG: &'static str = "linear";

    pub fn new() -> Self {
        Self::default()
    }

    /// Build directly from a rule list, for hosts constructing the
    /// classifier in memory.
    pub fn from_rules(mut rules: Vec<Rule>) -> Self {
        sort_by_priority(&mut rules);
        Self { rules }
    }

    /// Best match for a single header, independent of any iSet result.
    pub fn lookup(&self, header: &PacketHeader) -> ClassifierOutput {
        for rule in &self.rules {
            if rule.matches(header) {
                return ClassifierOutput {
                    priority: rule.priority as i32,
                    action: rule.action as i32,
                };
            }
        }
        ClassifierOutput::NO_MATCH
    }
}

impl RemainderClassifier for LinearRemainder {
    fn build(&mut self, rules: &[Rule]) -> Result<()> {
        self.rules = rules.to_vec();
        sort_by_priority(&mut self.rules);
        debug!(rules = self.rules.len(), "Built linear remainder");
        Ok(())
    }

    fn load(&mut self, mut reader: ObjectReader) -> Result<()> {
        let mut rules = load_rule_database(&mut reader)?;
        sort_by_priority(&mut rules);
        self.rules = rules;
        Ok(())
    }

    fn pack(&self) -> ObjectPacker {
        pack_rule_database(&self.rules)
    }

    fn classify(&self, headers: &[Option<PacketHeader>], output: &mut [ClassifierOutput]) {
        for (slot, header) in output.iter_mut().zip(headers.iter()) {
            let header = match header {
                Some(header) => header,
                None => continue,
            };
            let candidate = self.lookup(header);
            if candidate.beats(slot) {
                *slot = candidate;
            }
        }
    }

    fn byte_size(&self) -> usize {
        8 + self
            .rules
            .iter()
            .map(|r| 8 + 8 * r.fields.len())
            .sum::<usize>()
    }

    fn num_rules(&self) -> usize {
        self.rules.len()
    }

    fn name(&self) -> &'static str {
        Self::TAG
    }
}
