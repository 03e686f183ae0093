//! Loss stack for multi-model re-identification training
//!
//! The leaves are pure tensor functions: pairwise distances, hard-example
//! mining, and the margin/soft-margin triplet loss. On top of those sit the
//! per-model pipelines (global features, aligned local features) and the
//! cross-model mutual-learning penalties. The training step composes them;
//! nothing in this module owns state beyond its configuration.

pub mod distance;
pub mod global;
pub mod local;
pub mod mining;
pub mod mutual;
pub mod triplet;

pub use distance::{
    batch_pairwise_distances, normalize_rows, pairwise_distances, squared_pairwise_distances,
};
pub use global::{global_distances, global_loss, GlobalLossOutput};
pub use local::{
    batch_local_distances, local_distance_matrix, local_loss_independent, local_loss_shared,
    LocalLossOutput, LocalSamplePolicy,
};
pub use mining::{gather_mined, hard_example_mining, MinedTriplets};
pub use mutual::{distance_mutual_loss, probability_mutual_loss};
pub use triplet::{MarginMode, TripletLoss, TripletStats};
