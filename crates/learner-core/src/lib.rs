//! Interaction graph learning over recorded simulation traces: extraction of
//! causally-linked behavior groups, canonical state signatures, outcome
//! partition refinement, per-node predictor training, and runtime candidate
//! ranking.

pub mod estimator;
pub mod features;
pub mod graph;
pub mod interaction;
pub mod outcome;
pub mod policy;
pub mod signature;
pub mod trainer;

pub use graph::{NodeBinding, RuntimeGraph, RuntimeNode};
pub use policy::{bin_sort, candidate_calls, rank, RankedCandidate};
pub use signature::StateSignature;
pub use trainer::GraphTrainer;
