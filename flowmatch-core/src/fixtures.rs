//! Shared test fixtures: deterministic in-memory classifiers and images.
//!
//! All key-bearing field values used by the fixtures live on a 256-aligned
//! grid. `f32` carries 24 mantissa bits, so aligned values project onto the
//! normalised key domain exactly and the learned-index slot arithmetic in
//! tests is free of rounding artifacts at interval boundaries.

use bytes::Bytes;

use crate::iset::IntervalSet;
use crate::object_io::ObjectPacker;
use crate::remainder::{LinearRemainder, RemainderClassifier};
use crate::rqrmi::{Rqrmi, RqrmiLeaf};
use crate::rule::{pack_rule_database, FieldRange, PacketHeader, Rule, MAX_FIELDS};

/// Fields used by the fixture rules: sip, dip, sport, dport, proto.
pub const TEST_FIELDS: usize = 5;

/// Number of equal-width strips the uniform fixtures tile field space with.
pub const STRIP_COUNT: u32 = 64;

/// log2 of a strip's width.
pub const STRIP_SHIFT: u32 = 26;

/// Route log output through the test harness capture. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build a header from leading field values; trailing slots stay zero.
pub fn header(values: &[u32]) -> PacketHeader {
    let mut h: PacketHeader = [0; MAX_FIELDS];
    h[..values.len()].copy_from_slice(values);
    h
}

/// A model that predicts the uniform-strip slot exactly: one identity leaf
/// with a zero error bound.
fn exact_model() -> Rqrmi {
    Rqrmi::new(
        0.0,
        0.0,
        0.0,
        vec![RqrmiLeaf {
            w: 1.0,
            b: 0.0,
            x_min: 0.0,
            x_max: 1.0,
            max_error: 0,
        }],
    )
    .unwrap()
}

/// Rules tiling the full `u32` domain of `field_index` with
/// [`STRIP_COUNT`] adjacent strips. Every rule also requires protocol 6 so
/// validation has a second field to reject on.
pub fn strip_rules(field_index: u32, priority_base: u32) -> Vec<Rule> {
    (0..STRIP_COUNT)
        .map(|strip| {
            let low = strip << STRIP_SHIFT;
            let high = if strip == STRIP_COUNT - 1 {
                u32::MAX
            } else {
                ((strip + 1) << STRIP_SHIFT) - 1
            };
            let mut fields = vec![FieldRange::ANY; TEST_FIELDS];
            fields[field_index as usize] = FieldRange { low, high };
            fields[4] = FieldRange::exact(6);
            Rule {
                priority: priority_base + 100 + strip,
                action: priority_base + 500 + strip,
                fields,
            }
        })
        .collect()
}

/// Uniform-strip iSet over `field_index` with an exact model.
pub fn strip_iset(field_index: u32, priority_base: u32) -> IntervalSet {
    strip_iset_with_rules(field_index, strip_rules(field_index, priority_base))
}

/// Uniform-strip iSet carrying caller-supplied rules (one per strip).
pub fn strip_iset_with_rules(field_index: u32, rules: Vec<Rule>) -> IntervalSet {
    assert_eq!(rules.len(), STRIP_COUNT as usize);
    let keys = (0..STRIP_COUNT)
        .map(|strip| IntervalSet::normalize(strip << STRIP_SHIFT))
        .collect();
    IntervalSet::from_parts(field_index, field_index, keys, rules, exact_model()).unwrap()
}

/// Number of intervals in the uneven fixture.
pub const UNEVEN_SLOTS: usize = 48;

/// Interval start points with quadratically growing widths, 65536-aligned.
fn uneven_boundaries() -> Vec<u32> {
    (0..UNEVEN_SLOTS as u64)
        .map(|j| (((j * j * 1_864_135) >> 16) << 16) as u32)
        .collect()
}

/// iSet with unevenly spaced intervals and a deliberately coarse model: the
/// identity leaf mispredicts badly, and a generous error bound makes the
/// secondary search do the real work.
pub fn uneven_iset(field_index: u32) -> IntervalSet {
    let bounds = uneven_boundaries();
    let rules: Vec<Rule> = (0..UNEVEN_SLOTS)
        .map(|j| {
            let low = bounds[j];
            let high = if j + 1 < UNEVEN_SLOTS {
                bounds[j + 1] - 1
            } else {
                u32::MAX
            };
            let mut fields = vec![FieldRange::ANY; TEST_FIELDS];
            fields[field_index as usize] = FieldRange { low, high };
            fields[4] = FieldRange::exact(6);
            Rule {
                priority: 200 + j as u32,
                action: 10_000 + j as u32,
                fields,
            }
        })
        .collect();
    let keys = bounds.iter().map(|&b| IntervalSet::normalize(b)).collect();
    let model = Rqrmi::new(
        0.0,
        0.0,
        24.0,
        vec![RqrmiLeaf {
            w: 1.0,
            b: 0.0,
            x_min: 0.0,
            x_max: 1.0,
            max_error: 8 * UNEVEN_SLOTS as u32,
        }],
    )
    .unwrap();
    IntervalSet::from_parts(field_index, field_index, keys, rules, model).unwrap()
}

// ============================================================================
// Engine images
// ============================================================================

/// Assemble an engine image from parts.
pub fn pack_image(
    isets: &[&IntervalSet],
    num_rules: u32,
    remainder: &dyn RemainderClassifier,
    predefined: &[Rule],
) -> Bytes {
    let mut image = ObjectPacker::new();
    image.push_u32(isets.len() as u32);
    image.push_u32(num_rules);
    image.push_u32(0); // size, informational
    image.push_u32(0); // build time, informational
    for iset in isets {
        image.push_object(&iset.pack());
    }
    image.push_object(&remainder.pack());
    image.push_object(&pack_rule_database(predefined));
    image.into_bytes()
}

/// The scenario fixture: a 100-rule image with one uniform iSet (64 rules)
/// and 36 predefined remainder rules, arranged so a handful of known
/// headers map to known actions.
pub struct ScenarioFixture {
    pub image: Bytes,
    pub iset_rules: Vec<Rule>,
    pub remainder_rules: Vec<Rule>,
}

impl ScenarioFixture {
    /// Every rule of the image, for oracle construction.
    pub fn all_rules(&self) -> Vec<Rule> {
        let mut rules = self.iset_rules.clone();
        rules.extend(self.remainder_rules.iter().cloned());
        rules
    }
}

/// Scenario headers and the strip (hence action) they land in.
pub const SCENARIO_ACTIONS: [(u32, u32); 4] = [
    (1_824_690_037, 23_682), // strip 27
    (2_735_466_734, 80_749), // strip 40
    (3_014_326_451, 61_796), // strip 44
    (4_000_926_507, 37_982), // strip 59
];

pub fn scenario_fixture() -> ScenarioFixture {
    let mut iset_rules = strip_rules(0, 0);
    for &(sip, action) in &SCENARIO_ACTIONS {
        let strip = (sip >> STRIP_SHIFT) as usize;
        iset_rules[strip].action = action;
    }

    // Predefined remainder rules match on source-port bands at priorities
    // that never beat the iSet rules.
    let remainder_rules: Vec<Rule> = (0..36u32)
        .map(|i| {
            let mut fields = vec![FieldRange::ANY; TEST_FIELDS];
            fields[2] = FieldRange {
                low: i * 1000,
                high: i * 1000 + 999,
            };
            fields[4] = FieldRange::exact(6);
            Rule {
                priority: 500 + i,
                action: 20_000 + i,
                fields,
            }
        })
        .collect();

    let iset = strip_iset_with_rules(0, iset_rules.clone());
    let image = pack_image(
        &[&iset],
        (iset_rules.len() + remainder_rules.len()) as u32,
        &LinearRemainder::from_rules(remainder_rules.clone()),
        &remainder_rules,
    );

    ScenarioFixture {
        image,
        iset_rules,
        remainder_rules,
    }
}

/// Image with two uniform iSets (fields 0 and 1) and an empty predefined
/// remainder set, for exercising the engine's filter policy.
pub fn two_iset_image() -> Bytes {
    let iset_a = strip_iset(0, 0);
    let iset_b = strip_iset(1, 1000);
    pack_image(
        &[&iset_a, &iset_b],
        2 * STRIP_COUNT,
        &LinearRemainder::new(),
        &[],
    )
}

/// Seeded LCG over `u64`; reproducible pseudo-random input for the fuzz
/// tests.
pub struct Lcg(pub u64);

impl Lcg {
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        (self.0 >> 32) as u32
    }

    /// Key-grid-aligned value (multiple of 256).
    #[inline]
    pub fn next_key_aligned(&mut self) -> u32 {
        self.next_u32() & !0xFF
    }
}
