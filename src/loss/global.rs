//! Global-feature triplet pipeline
//!
//! Glues the leaf pieces together for one model and one batch: optional
//! row normalization, euclidean distance matrix, hard-example mining,
//! differentiable gather of the mined distances, triplet loss. The distance
//! matrix and the mined indices are part of the result because later stages
//! reuse them (the distance-consistency mutual term and the shared-sample
//! local policy).

use candle_core::Tensor;

use crate::error::Result;
use crate::loss::distance::{normalize_rows, pairwise_distances};
use crate::loss::mining::{gather_mined, hard_example_mining, MinedTriplets};
use crate::loss::triplet::{TripletLoss, TripletStats};

/// Everything the global pipeline produces for one model.
#[derive(Debug)]
pub struct GlobalLossOutput {
    /// Scalar triplet loss.
    pub loss: Tensor,
    /// Ordering/margin statistics for this batch.
    pub stats: TripletStats,
    /// Mined hard triplets (indices reused by the shared local policy).
    pub mined: MinedTriplets,
    /// The N×N euclidean distance matrix (reused by the mutual term).
    pub dist_mat: Tensor,
}

/// Euclidean distance matrix over a feature batch, normalizing rows first
/// when requested.
pub fn global_distances(global_feat: &Tensor, normalize: bool) -> Result<Tensor> {
    let feat = if normalize {
        normalize_rows(global_feat)?
    } else {
        global_feat.clone()
    };
    pairwise_distances(&feat, &feat)
}

/// Full global triplet loss for one model.
pub fn global_loss(
    tri: &TripletLoss,
    global_feat: &Tensor,
    labels: &[u32],
    normalize: bool,
) -> Result<GlobalLossOutput> {
    let dist_mat = global_distances(global_feat, normalize)?;
    let mined = hard_example_mining(&dist_mat, labels)?;
    let (dist_ap, dist_an) = gather_mined(&dist_mat, &mined)?;
    let loss = tri.forward(&dist_ap, &dist_an)?;
    let stats = TripletStats::from_mined(&mined, tri.mode());
    Ok(GlobalLossOutput {
        loss,
        stats,
        mined,
        dist_mat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::triplet::MarginMode;
    use approx::assert_relative_eq;
    use candle_core::Device;

    /// Two tight clusters far apart: identities 0 and 1, two samples each.
    fn clustered_features() -> (Tensor, Vec<u32>) {
        let feat = Tensor::from_vec(
            vec![
                0.0f32, 0.0, //
                0.0, 0.1, //
                10.0, 0.0, //
                10.0, 0.1,
            ],
            (4, 2),
            &Device::Cpu,
        )
        .unwrap();
        (feat, vec![0, 0, 1, 1])
    }

    #[test]
    fn well_separated_clusters_pay_no_hinge() {
        let (feat, labels) = clustered_features();
        let tri = TripletLoss::new(MarginMode::Hard { margin: 0.5 });
        let out = global_loss(&tri, &feat, &labels, false).unwrap();
        assert_relative_eq!(out.loss.to_scalar::<f32>().unwrap(), 0.0, epsilon = 1e-5);
        assert_relative_eq!(out.stats.precision, 1.0);
        assert_relative_eq!(out.stats.satisfied, 1.0);
    }

    #[test]
    fn mined_indices_point_inside_the_right_identity() {
        let (feat, labels) = clustered_features();
        let tri = TripletLoss::new(MarginMode::Hard { margin: 0.5 });
        let out = global_loss(&tri, &feat, &labels, false).unwrap();
        assert_eq!(out.mined.pos_inds[0], 1);
        assert!(out.mined.neg_inds[0] == 2 || out.mined.neg_inds[0] == 3);
        assert_eq!(out.dist_mat.dims(), &[4, 4]);
    }

    #[test]
    fn normalization_shrinks_distances_onto_the_sphere() {
        let (feat, _) = clustered_features();
        let raw = global_distances(&feat, false).unwrap();
        let normed = global_distances(&feat, true).unwrap();
        let raw_max = raw.max_all().unwrap().to_scalar::<f32>().unwrap();
        let normed_max = normed.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(raw_max > 2.0);
        // unit vectors are at most 2 apart
        assert!(normed_max <= 2.0 + 1e-4);
    }
}
