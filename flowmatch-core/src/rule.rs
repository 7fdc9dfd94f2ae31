//! Rule database model.
//!
//! A rule is an OpenFlow-style match entry: a priority, an action, and one
//! inclusive `u32` range per header field. Rule sets are immutable after
//! load. The on-image encoding here is shared by the per-iSet validation
//! databases, the predefined remainder database, and [`LinearRemainder`]
//! packing.
//!
//! [`LinearRemainder`]: crate::remainder::LinearRemainder

use crate::error::{FlowMatchError, Result};
use crate::object_io::{ObjectPacker, ObjectReader};

/// Maximum number of header fields an image may declare.
///
/// Headers are fixed-width so batch jobs stay `Copy` across the pipeline
/// ring. The classic 5-tuple uses five of these slots.
pub const MAX_FIELDS: usize = 8;

/// A packet header: one `u32` value per field, unused slots zero.
pub type PacketHeader = [u32; MAX_FIELDS];

// ============================================================================
// Field ranges and rules
// ============================================================================

/// Inclusive match range on one header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRange {
    pub low: u32,
    pub high: u32,
}

impl FieldRange {
    /// Full-range wildcard.
    pub const ANY: FieldRange = FieldRange {
        low: 0,
        high: u32::MAX,
    };

    /// Range covering exactly one value.
    #[inline]
    pub fn exact(value: u32) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    #[inline]
    pub fn contains(&self, value: u32) -> bool {
        self.low <= value && value <= self.high
    }
}

/// One classification rule. Lower `priority` wins; priority 0 is highest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub priority: u32,
    pub action: u32,
    pub fields: Vec<FieldRange>,
}

impl Rule {
    /// Check the full field tuple against a header.
    #[inline]
    pub fn matches(&self, header: &PacketHeader) -> bool {
        self.fields
            .iter()
            .enumerate()
            .all(|(i, range)| range.contains(header[i]))
    }

    /// Project the rule onto an ordered subset of its fields, for
    /// configurations that restrict classification to chosen header fields.
    /// Returns `None` if any index is out of range.
    pub fn project_fields(&self, fields: &[u32]) -> Option<Rule> {
        let mut projected = Vec::with_capacity(fields.len());
        for &f in fields {
            projected.push(*self.fields.get(f as usize)?);
        }
        Some(Rule {
            priority: self.priority,
            action: self.action,
            fields: projected,
        })
    }
}

/// Sort rules best-first (ascending priority number).
pub fn sort_by_priority(rules: &mut [Rule]) {
    rules.sort_by_key(|r| r.priority);
}

// ============================================================================
// Classifier output
// ============================================================================

/// Result of classifying one packet.
///
/// Priority comparison uses the unsigned interpretation, which makes the
/// `-1` sentinel (`0xFFFFFFFF`) lose to every real priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierOutput {
    pub priority: i32,
    pub action: i32,
}

impl ClassifierOutput {
    /// Sentinel meaning "no rule matched".
    pub const NO_MATCH: ClassifierOutput = ClassifierOutput {
        priority: -1,
        action: -1,
    };

    #[inline]
    pub fn is_match(&self) -> bool {
        *self != Self::NO_MATCH
    }

    /// True if `self` dominates `other` under unsigned priority order.
    #[inline]
    pub fn beats(&self, other: &ClassifierOutput) -> bool {
        (self.priority as u32) < (other.priority as u32)
    }
}

impl Default for ClassifierOutput {
    fn default() -> Self {
        Self::NO_MATCH
    }
}

// ============================================================================
// Rule database encoding
// ============================================================================

/// Parse a rule database object: `[num_rules][num_fields]` followed by
/// `num_rules` entries of `[priority][action]` plus `num_fields` ranges.
pub fn load_rule_database(reader: &mut ObjectReader) -> Result<Vec<Rule>> {
    let num_rules = reader.read_u32()? as usize;
    let num_fields = reader.read_u32()? as usize;

    if num_fields > MAX_FIELDS {
        return Err(FlowMatchError::ImageCorrupt(format!(
            "rule database declares {} fields, maximum is {}",
            num_fields, MAX_FIELDS
        )));
    }
    // Each entry is 2 + 2*num_fields u32 words; reject impossible counts
    // before allocating.
    let entry_bytes = 4 * (2 + 2 * num_fields);
    if num_rules.saturating_mul(entry_bytes) > reader.remaining() {
        return Err(FlowMatchError::ImageCorrupt(format!(
            "rule database declares {} rules but only {} bytes remain",
            num_rules,
            reader.remaining()
        )));
    }

    let mut rules = Vec::with_capacity(num_rules);
    for _ in 0..num_rules {
        let priority = reader.read_u32()?;
        let action = reader.read_u32()?;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let low = reader.read_u32()?;
            let high = reader.read_u32()?;
            fields.push(FieldRange { low, high });
        }
        rules.push(Rule {
            priority,
            action,
            fields,
        });
    }
    Ok(rules)
}

/// Encode a rule database object. All rules must declare the same number of
/// fields; an empty set encodes zero fields.
pub fn pack_rule_database(rules: &[Rule]) -> ObjectPacker {
    let num_fields = rules.first().map_or(0, |r| r.fields.len());
    let mut packer = ObjectPacker::new();
    packer.push_u32(rules.len() as u32);
    packer.push_u32(num_fields as u32);
    for rule in rules {
        debug_assert_eq!(rule.fields.len(), num_fields);
        packer.push_u32(rule.priority);
        packer.push_u32(rule.action);
        for range in &rule.fields {
            packer.push_u32(range.low);
            packer.push_u32(range.high);
        }
    }
    packer
}
