//! RQRMI learned model.
//!
//! A two-stage piecewise-linear index: a single root linear model maps the
//! input scalar to one of `K` leaf linear models, and the selected leaf
//! predicts a normalised position in `[0, 1]`. Each leaf carries a maximum
//! prediction error (in interval slots) that bounds the secondary search,
//! and a validity window outside of which its prediction is flagged invalid.
//!
//! Evaluation is pure: no state is mutated, and the batched form writes into
//! caller-owned scratch so the hot path performs no allocation.

use crate::error::{FlowMatchError, Result};
use crate::object_io::{ObjectPacker, ObjectReader};

/// Clamp to the normalised prediction range.
#[inline]
fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// One second-stage leaf model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RqrmiLeaf {
    /// Slope of the linear model.
    pub w: f32,
    /// Bias of the linear model.
    pub b: f32,
    /// Inclusive lower edge of the validity window.
    pub x_min: f32,
    /// Inclusive upper edge of the validity window.
    pub x_max: f32,
    /// Maximum prediction error in interval slots.
    pub max_error: u32,
}

/// Result of evaluating the model on one input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RqrmiOutput {
    /// Predicted normalised position in `[0, 1]`.
    pub output: f32,
    /// Error bound of the leaf that produced the prediction.
    pub error: u32,
    /// Whether the input fell inside the leaf's validity window.
    pub valid: bool,
}

/// The two-stage model.
#[derive(Debug, Clone, PartialEq)]
pub struct Rqrmi {
    root_w: f32,
    root_b: f32,
    expected_error: f32,
    leaves: Vec<RqrmiLeaf>,
}

impl Rqrmi {
    /// Assemble a model from its parts. At least one leaf is required.
    pub fn new(
        root_w: f32,
        root_b: f32,
        expected_error: f32,
        leaves: Vec<RqrmiLeaf>,
    ) -> Result<Self> {
        if leaves.is_empty() {
            return Err(FlowMatchError::ImageCorrupt(
                "RQRMI model has no leaf models".into(),
            ));
        }
        Ok(Self {
            root_w,
            root_b,
            expected_error,
            leaves,
        })
    }

    /// Evaluate the model on one input in `[0, 1]`.
    #[inline]
    pub fn evaluate(&self, x: f32) -> RqrmiOutput {
        let y0 = clamp01(self.root_w * x + self.root_b);
        // floor(y0 * K), clamped so y0 == 1.0 still selects the last leaf.
        let k = ((y0 * self.leaves.len() as f32) as usize).min(self.leaves.len() - 1);
        let leaf = &self.leaves[k];
        RqrmiOutput {
            output: clamp01(leaf.w * x + leaf.b),
            error: leaf.max_error,
            valid: x >= leaf.x_min && x <= leaf.x_max,
        }
    }

    /// Evaluate a batch of inputs into caller scratch.
    ///
    /// `outputs` must be at least as long as `inputs`.
    pub fn evaluate_batch(&self, inputs: &[f32], outputs: &mut [RqrmiOutput]) {
        debug_assert!(outputs.len() >= inputs.len());
        for (out, &x) in outputs.iter_mut().zip(inputs.iter()) {
            *out = self.evaluate(x);
        }
    }

    /// Number of second-stage leaves.
    #[inline]
    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Mean prediction error reported by the builder, for statistics only.
    #[inline]
    pub fn expected_error(&self) -> f32 {
        self.expected_error
    }

    /// Per-leaf maximum error bounds, for statistics.
    pub fn error_list(&self) -> Vec<u32> {
        self.leaves.iter().map(|leaf| leaf.max_error).collect()
    }

    /// Size of the packed representation in bytes.
    pub fn byte_size(&self) -> usize {
        16 + self.leaves.len() * 20
    }

    /// Parse a model object.
    pub fn load(reader: &mut ObjectReader) -> Result<Self> {
        let num_leaves = reader.read_u32()? as usize;
        let root_w = reader.read_f32()?;
        let root_b = reader.read_f32()?;
        let expected_error = reader.read_f32()?;

        if num_leaves == 0 {
            return Err(FlowMatchError::ImageCorrupt(
                "RQRMI model declares zero leaf models".into(),
            ));
        }
        if num_leaves.saturating_mul(20) > reader.remaining() {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "RQRMI model declares {} leaves but only {} bytes remain",
                num_leaves,
                reader.remaining()
            )));
        }

        let mut leaves = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            let w = reader.read_f32()?;
            let b = reader.read_f32()?;
            let x_min = reader.read_f32()?;
            let x_max = reader.read_f32()?;
            let max_error = reader.read_u32()?;
            leaves.push(RqrmiLeaf {
                w,
                b,
                x_min,
                x_max,
                max_error,
            });
        }
        Self::new(root_w, root_b, expected_error, leaves)
    }

    /// Encode this model as an object.
    pub fn pack(&self) -> ObjectPacker {
        let mut packer = ObjectPacker::new();
        packer.push_u32(self.leaves.len() as u32);
        packer.push_f32(self.root_w);
        packer.push_f32(self.root_b);
        packer.push_f32(self.expected_error);
        for leaf in &self.leaves {
            packer.push_f32(leaf.w);
            packer.push_f32(leaf.b);
            packer.push_f32(leaf.x_min);
            packer.push_f32(leaf.x_max);
            packer.push_u32(leaf.max_error);
        }
        packer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity model: one leaf predicting y = x over the whole domain.
    fn identity_model(max_error: u32) -> Rqrmi {
        Rqrmi::new(
            0.0,
            0.0,
            1.0,
            vec![RqrmiLeaf {
                w: 1.0,
                b: 0.0,
                x_min: 0.0,
                x_max: 1.0,
                max_error,
            }],
        )
        .unwrap()
    }

    /// Two leaves with distinct biases so leaf selection is observable.
    fn two_leaf_model() -> Rqrmi {
        Rqrmi::new(
            1.0,
            0.0,
            2.0,
            vec![
                RqrmiLeaf {
                    w: 0.0,
                    b: 0.25,
                    x_min: 0.0,
                    x_max: 0.5,
                    max_error: 3,
                },
                RqrmiLeaf {
                    w: 0.0,
                    b: 0.75,
                    x_min: 0.5,
                    x_max: 1.0,
                    max_error: 5,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_output_stays_normalised_at_domain_edges() {
        let model = Rqrmi::new(
            2.0,
            -0.5,
            0.0,
            vec![RqrmiLeaf {
                w: 4.0,
                b: -1.0,
                x_min: 0.0,
                x_max: 1.0,
                max_error: 1,
            }],
        )
        .unwrap();

        for x in [0.0f32, 1.0] {
            let out = model.evaluate(x);
            assert!((0.0..=1.0).contains(&out.output), "x={} y={}", x, out.output);
        }
    }

    #[test]
    fn test_root_selects_leaf() {
        let model = two_leaf_model();
        // Root is identity, so x < 0.5 lands in leaf 0 and x >= 0.5 in leaf 1.
        let low = model.evaluate(0.2);
        assert_eq!(low.output, 0.25);
        assert_eq!(low.error, 3);

        let high = model.evaluate(0.8);
        assert_eq!(high.output, 0.75);
        assert_eq!(high.error, 5);
    }

    #[test]
    fn test_leaf_index_clamped_at_full_scale() {
        // y0 == 1.0 would index leaf K without the clamp.
        let model = two_leaf_model();
        let out = model.evaluate(1.0);
        assert_eq!(out.error, 5);
    }

    #[test]
    fn test_validity_window() {
        let model = two_leaf_model();
        assert!(model.evaluate(0.3).valid);
        assert!(model.evaluate(0.6).valid);

        // Single leaf with a narrow window; probe both sides of it.
        let model = Rqrmi::new(
            0.0,
            0.0,
            0.0,
            vec![RqrmiLeaf {
                w: 1.0,
                b: 0.0,
                x_min: 0.25,
                x_max: 0.75,
                max_error: 1,
            }],
        )
        .unwrap();
        assert!(!model.evaluate(0.1).valid);
        assert!(model.evaluate(0.5).valid);
        assert!(!model.evaluate(0.9).valid);
    }

    #[test]
    fn test_batch_matches_scalar() {
        let model = identity_model(2);
        let inputs = [0.0f32, 0.125, 0.5, 0.875, 1.0];
        let mut outputs = [RqrmiOutput::default(); 5];
        model.evaluate_batch(&inputs, &mut outputs);
        for (&x, out) in inputs.iter().zip(outputs.iter()) {
            assert_eq!(*out, model.evaluate(x));
        }
    }

    #[test]
    fn test_pack_load_roundtrip() {
        let model = two_leaf_model();
        let mut reader = ObjectReader::new(model.pack().into_bytes());
        let loaded = Rqrmi::load(&mut reader).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_zero_leaves_is_corrupt() {
        let mut packer = ObjectPacker::new();
        packer.push_u32(0);
        packer.push_f32(0.0);
        packer.push_f32(0.0);
        packer.push_f32(0.0);
        let mut reader = ObjectReader::new(packer.into_bytes());
        assert!(matches!(
            Rqrmi::load(&mut reader),
            Err(FlowMatchError::ImageCorrupt(_))
        ));
    }

    #[test]
    fn test_error_list_reports_all_leaves() {
        let model = two_leaf_model();
        assert_eq!(model.error_list(), vec![3, 5]);
        assert_eq!(model.expected_error(), 2.0);
    }
}
