//! Adapter Safety Gate
//!
//! Pre-flight evaluation of adapter runs: forbidden-actuation screening,
//! quantitative robotics checks, constraint packs, and deterministic
//! verdict certificates.

pub mod certificate;
pub mod gate;
pub mod packs;

pub use certificate::{build_certificate, canonical_json, sha256_hex};
pub use gate::{
    AdapterAction, AdapterRunOutcome, AdapterRunRequest, RoboticsSafetyInput, RunVerdict,
    SafetyGate,
};
pub use packs::{collect_telemetry, CheckOp, ConstraintPack, ConstraintPackRegistry, MetricCheck};
