//! Interval sets: field-specialised learned-index classifiers.
//!
//! An iSet owns one RQRMI model together with the sorted interval database
//! it indexes: `S` normalised keys (ascending) and the `S` rules they map
//! to. Lookup is predict-then-validate: the model emits an approximate slot
//! with a bounded error, the worker's secondary search narrows it, and
//! `do_validation` checks the candidate rule against the full header tuple
//! to filter the model's false positives.

use std::fmt;

use tracing::debug;

use crate::error::{FlowMatchError, Result};
use crate::object_io::{ObjectPacker, ObjectReader};
use crate::rqrmi::{Rqrmi, RqrmiOutput};
use crate::rule::{
    load_rule_database, pack_rule_database, ClassifierOutput, PacketHeader, Rule,
};

/// Per-packet model output as consumed by the secondary search.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchInfo {
    /// Normalised value of the indexed field (the search key).
    pub input: f32,
    /// Predicted normalised position.
    pub output: f32,
    /// Error bound of the prediction, in slots.
    pub error: u32,
    /// Whether the prediction came from inside the leaf's validity window.
    pub valid: bool,
}

/// One interval set.
#[derive(Debug, Clone)]
pub struct IntervalSet {
    /// Ordinal of this iSet within the image, for logging.
    index: u32,
    field_index: u32,
    keys: Vec<f32>,
    rules: Vec<Rule>,
    model: Rqrmi,
}

impl IntervalSet {
    /// Assemble an iSet from its parts, checking the structural invariants.
    pub fn from_parts(
        index: u32,
        field_index: u32,
        keys: Vec<f32>,
        rules: Vec<Rule>,
        model: Rqrmi,
    ) -> Result<Self> {
        if keys.len() != rules.len() {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: {} keys but {} rules",
                index,
                keys.len(),
                rules.len()
            )));
        }
        if keys.windows(2).any(|w| w[0] > w[1]) {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: key array is not sorted",
                index
            )));
        }
        if let Some(rule) = rules.iter().find(|r| field_index as usize >= r.fields.len()) {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: field index {} out of range for rule with {} fields",
                index,
                field_index,
                rule.fields.len()
            )));
        }
        if rules.iter().any(|r| r.fields.len() > crate::rule::MAX_FIELDS) {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: rule declares more than {} fields",
                index,
                crate::rule::MAX_FIELDS
            )));
        }
        Ok(Self {
            index,
            field_index,
            keys,
            rules,
            model,
        })
    }

    /// Parse one iSet object.
    pub fn load(index: u32, reader: &mut ObjectReader) -> Result<Self> {
        let field_index = reader.read_u32()?;
        let num_intervals = reader.read_u32()? as usize;

        let mut key_reader = reader.sub_reader()?;
        if key_reader.remaining() != num_intervals * 4 {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: key array holds {} bytes, expected {}",
                index,
                key_reader.remaining(),
                num_intervals * 4
            )));
        }
        let mut keys = Vec::with_capacity(num_intervals);
        for _ in 0..num_intervals {
            keys.push(key_reader.read_f32()?);
        }

        let mut rule_reader = reader.sub_reader()?;
        let rules = load_rule_database(&mut rule_reader)?;
        if rules.len() != num_intervals {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "iSet {}: {} validation rules for {} intervals",
                index,
                rules.len(),
                num_intervals
            )));
        }

        let mut model_reader = reader.sub_reader()?;
        let model = Rqrmi::load(&mut model_reader)?;

        let iset = Self::from_parts(index, field_index, keys, rules, model)?;
        debug!(
            iset = index,
            field = iset.field_index,
            intervals = iset.len(),
            leaves = iset.model.num_leaves(),
            "Loaded iSet"
        );
        Ok(iset)
    }

    /// Encode this iSet as an object.
    pub fn pack(&self) -> ObjectPacker {
        let mut keys = ObjectPacker::new();
        for &key in &self.keys {
            keys.push_f32(key);
        }

        let mut packer = ObjectPacker::new();
        packer.push_u32(self.field_index);
        packer.push_u32(self.keys.len() as u32);
        packer.push_object(&keys);
        packer.push_object(&pack_rule_database(&self.rules));
        packer.push_object(&self.model.pack());
        packer
    }

    /// Number of interval slots (`S`).
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The header field this iSet indexes on.
    #[inline]
    pub fn field_index(&self) -> u32 {
        self.field_index
    }

    /// Ordinal of this iSet within the image.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.index
    }

    /// Memory footprint used for load balancing, in bytes.
    pub fn byte_size(&self) -> usize {
        let rule_bytes = self
            .rules
            .iter()
            .map(|r| 8 + 8 * r.fields.len())
            .sum::<usize>();
        self.keys.len() * 4 + rule_bytes + self.model.byte_size()
    }

    /// Mean model error, for statistics.
    #[inline]
    pub fn expected_error(&self) -> f32 {
        self.model.expected_error()
    }

    /// Per-leaf maximum model errors, for statistics.
    pub fn error_list(&self) -> Vec<u32> {
        self.model.error_list()
    }

    /// Project a raw field value onto the normalised key domain.
    #[inline]
    pub fn normalize(value: u32) -> f32 {
        value as f32 / u32::MAX as f32
    }

    /// Run model inference for every present packet in the batch.
    ///
    /// `info` must be at least as long as `headers`; absent slots produce a
    /// default (invalid) entry.
    pub fn rqrmi_search(&self, headers: &[Option<PacketHeader>], info: &mut [SearchInfo]) {
        debug_assert!(info.len() >= headers.len());
        for (slot, header) in info.iter_mut().zip(headers.iter()) {
            *slot = match header {
                Some(header) => {
                    let x = Self::normalize(header[self.field_index as usize]);
                    let RqrmiOutput {
                        output,
                        error,
                        valid,
                    } = self.model.evaluate(x);
                    SearchInfo {
                        input: x,
                        output,
                        error,
                        valid,
                    }
                }
                None => SearchInfo::default(),
            };
        }
    }

    /// Bounds-checked read of the sorted key array.
    ///
    /// Positions past the end return `+inf` so an out-of-window probe always
    /// reads as "above the key" and the search comparison terminates.
    /// Positions below zero cannot be represented; the search clamps its
    /// lower bound at zero.
    #[inline]
    pub fn get_index(&self, position: usize) -> f32 {
        self.keys.get(position).copied().unwrap_or(f32::INFINITY)
    }

    /// Validate the rule at `position` against the full header tuple.
    ///
    /// Returns the rule's `{priority, action}` on a full match and the
    /// no-match sentinel otherwise, including for out-of-range positions, so
    /// a model false positive can never surface as a match.
    #[inline]
    pub fn do_validation(&self, header: &PacketHeader, position: usize) -> ClassifierOutput {
        match self.rules.get(position) {
            Some(rule) if rule.matches(header) => ClassifierOutput {
                priority: rule.priority as i32,
                action: rule.action as i32,
            },
            _ => ClassifierOutput::NO_MATCH,
        }
    }

    /// Clone out the rules held by this iSet, for remainder rebuilding when
    /// the iSet is filtered out by configuration.
    pub fn extract_rules(&self) -> Vec<Rule> {
        self.rules.clone()
    }

    /// Remap field positions after the host restricted classification to an
    /// ordered subset of header fields.
    ///
    /// `fields` lists the original field indices that remain, in their new
    /// header order. The indexed field must appear in the list.
    pub fn rearrange_fields(&mut self, fields: &[u32]) -> Result<()> {
        let new_index = fields
            .iter()
            .position(|&f| f == self.field_index)
            .ok_or_else(|| {
                FlowMatchError::ConfigInvalid(format!(
                    "iSet {}: indexed field {} missing from arbitrary field list",
                    self.index, self.field_index
                ))
            })?;

        for rule in &mut self.rules {
            let mut remapped = Vec::with_capacity(fields.len());
            for &f in fields {
                let range = rule.fields.get(f as usize).copied().ok_or_else(|| {
                    FlowMatchError::ConfigInvalid(format!(
                        "arbitrary field {} out of range for rule with {} fields",
                        f,
                        rule.fields.len()
                    ))
                })?;
                remapped.push(range);
            }
            rule.fields = remapped;
        }
        self.field_index = new_index as u32;
        Ok(())
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iSet-{}(field={}, rules={})",
            self.index,
            self.field_index,
            self.len()
        )
    }
}
