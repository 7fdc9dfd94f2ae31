//! FlowMatch core: learned-index multi-field packet classification.
//!
//! A pre-built classifier image maps a fixed-width packet header vector to
//! the highest-priority matching rule. Key design principles:
//!
//! - **Predict, then validate**: each iSet replaces a sorted interval
//!   database with a small learned model whose output is an approximate
//!   position with a bounded maximum error; a bounded binary search plus a
//!   full-header validation turn the approximation into an exact answer.
//! - **Interleaved memory access**: the secondary search runs across all
//!   iSets in lockstep so their independent cache misses overlap.
//! - **One arena**: the engine owns a single image buffer; iSets reference
//!   into it through zero-copy sub-streams.
//! - **Infallible hot path**: every failure mode surfaces at load time.
//!
//! The serial engine classifies on the caller's thread; the parallel worker
//! variant owns a core-pinned pipeline thread fed by a bounded SPSC ring.

#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::unnecessary_to_owned)]

pub mod engine;
pub mod error;
pub mod iset;
pub mod object_io;
pub mod pipeline;
pub mod remainder;
pub mod rqrmi;
pub mod rule;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use engine::{EngineConfig, SerialEngine};
pub use error::{FlowMatchError, Result};
pub use iset::{IntervalSet, SearchInfo};
pub use object_io::{ObjectPacker, ObjectReader};
pub use pipeline::PipelineThread;
pub use remainder::{make_remainder, LinearRemainder, RemainderClassifier, RemainderFactory};
pub use rqrmi::{Rqrmi, RqrmiLeaf, RqrmiOutput};
pub use rule::{ClassifierOutput, FieldRange, PacketHeader, Rule, MAX_FIELDS};
pub use worker::{
    ActionBatch, Job, ParallelWorker, SerialWorker, WorkBatch, WorkerFlags, WorkerGroup,
    WorkerListener,
};
