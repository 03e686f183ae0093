//! Hard example mining over a batch distance matrix
//!
//! For every anchor the miner picks the farthest same-identity sample and
//! the nearest different-identity sample. Selection runs on host memory in
//! one O(N²) scan; the indices it returns are then used to gather the
//! corresponding entries out of the differentiable distance matrix, so the
//! loss keeps its gradient path while the argmax/argmin itself stays out of
//! the graph.

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Hardest positive and negative per anchor.
///
/// `dist_ap[i]` / `pos_inds[i]` describe the farthest sample sharing anchor
/// `i`'s label, `dist_an[i]` / `neg_inds[i]` the nearest sample with a
/// different label. Indices are absolute batch positions.
#[derive(Debug, Clone)]
pub struct MinedTriplets {
    /// Anchor-positive distances.
    pub dist_ap: Vec<f32>,
    /// Anchor-negative distances.
    pub dist_an: Vec<f32>,
    /// Batch index of each anchor's hardest positive.
    pub pos_inds: Vec<u32>,
    /// Batch index of each anchor's hardest negative.
    pub neg_inds: Vec<u32>,
}

impl MinedTriplets {
    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.dist_ap.len()
    }

    /// True when no anchors were mined.
    pub fn is_empty(&self) -> bool {
        self.dist_ap.is_empty()
    }
}

/// Select the hardest positive and hardest negative for every anchor.
///
/// `dist` must be a square `[N, N]` matrix and `labels` must have length N.
/// The anchor itself is not a positive candidate; a label that appears only
/// once in the batch (or a batch with a single identity) violates the
/// sampling contract and surfaces as [`Error::MalformedBatch`].
///
/// Ties on the maximal/minimal distance keep the lowest index, so the
/// result is deterministic for a given input.
pub fn hard_example_mining(dist: &Tensor, labels: &[u32]) -> Result<MinedTriplets> {
    if dist.rank() != 2 {
        return Err(Error::malformed_batch(format!(
            "distance matrix must be 2-D, got rank {}",
            dist.rank()
        )));
    }
    let (n, m) = dist.dims2()?;
    if n != m {
        return Err(Error::malformed_batch(format!(
            "distance matrix must be square, got {n}x{m}"
        )));
    }
    if labels.len() != n {
        return Err(Error::malformed_batch(format!(
            "label count {} does not match batch size {n}",
            labels.len()
        )));
    }

    let rows = dist.to_vec2::<f32>()?;
    let mut dist_ap = Vec::with_capacity(n);
    let mut dist_an = Vec::with_capacity(n);
    let mut pos_inds = Vec::with_capacity(n);
    let mut neg_inds = Vec::with_capacity(n);

    for i in 0..n {
        let mut hardest_pos: Option<(f32, usize)> = None;
        let mut hardest_neg: Option<(f32, usize)> = None;
        for (j, &d) in rows[i].iter().enumerate() {
            if labels[j] == labels[i] {
                if j != i && hardest_pos.map_or(true, |(best, _)| d > best) {
                    hardest_pos = Some((d, j));
                }
            } else if hardest_neg.map_or(true, |(best, _)| d < best) {
                hardest_neg = Some((d, j));
            }
        }
        let (ap, p) = hardest_pos.ok_or_else(|| {
            Error::malformed_batch(format!(
                "anchor {i} (label {}) has no positive partner in the batch",
                labels[i]
            ))
        })?;
        let (an, ng) = hardest_neg.ok_or_else(|| {
            Error::malformed_batch(format!(
                "anchor {i} (label {}) has no negative in the batch",
                labels[i]
            ))
        })?;
        dist_ap.push(ap);
        dist_an.push(an);
        pos_inds.push(p as u32);
        neg_inds.push(ng as u32);
    }

    Ok(MinedTriplets {
        dist_ap,
        dist_an,
        pos_inds,
        neg_inds,
    })
}

/// Gather each anchor's mined distances out of the differentiable matrix.
///
/// Returns `(dist_ap, dist_an)` as length-N tensors whose gradient flows
/// back into `dist`.
pub fn gather_mined(dist: &Tensor, mined: &MinedTriplets) -> Result<(Tensor, Tensor)> {
    let n = mined.len();
    let device = dist.device();
    let pos = Tensor::from_vec(mined.pos_inds.clone(), (n, 1), device)?;
    let neg = Tensor::from_vec(mined.neg_inds.clone(), (n, 1), device)?;
    let dist_ap = dist.gather(&pos, 1)?.squeeze(1)?;
    let dist_an = dist.gather(&neg, 1)?.squeeze(1)?;
    Ok((dist_ap, dist_an))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    /// Distance matrix with intra-A distance 1.0 and cross-label 5.0 for
    /// labels [A, A, B, B].
    fn two_pair_matrix() -> Tensor {
        let d = vec![
            0.0f32, 1.0, 5.0, 5.0, //
            1.0, 0.0, 5.0, 5.0, //
            5.0, 5.0, 0.0, 1.0, //
            5.0, 5.0, 1.0, 0.0,
        ];
        Tensor::from_vec(d, (4, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn picks_farthest_positive_and_nearest_negative() {
        let mined = hard_example_mining(&two_pair_matrix(), &[0, 0, 1, 1]).unwrap();
        assert_relative_eq!(mined.dist_ap[0], 1.0);
        assert_relative_eq!(mined.dist_an[0], 5.0);
        assert_eq!(mined.pos_inds[0], 1);
    }

    #[test]
    fn ties_keep_the_lowest_index() {
        // Anchor 0 sees negatives at indices 2 and 3 with equal distance.
        let mined = hard_example_mining(&two_pair_matrix(), &[0, 0, 1, 1]).unwrap();
        assert_eq!(mined.neg_inds[0], 2);

        // Three samples of one label at equal distance from anchor 0.
        let d = vec![
            0.0f32, 2.0, 2.0, 3.0, //
            2.0, 0.0, 1.0, 3.0, //
            2.0, 1.0, 0.0, 3.0, //
            3.0, 3.0, 3.0, 0.0,
        ];
        let t = Tensor::from_vec(d, (4, 4), &Device::Cpu).unwrap();
        let mined = hard_example_mining(&t, &[7, 7, 7, 9]).unwrap();
        assert_eq!(mined.pos_inds[0], 1);
    }

    #[test]
    fn singleton_identity_is_a_contract_violation() {
        let err = hard_example_mining(&two_pair_matrix(), &[0, 1, 2, 2]).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }

    #[test]
    fn single_identity_batch_has_no_negatives() {
        let err = hard_example_mining(&two_pair_matrix(), &[3, 3, 3, 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }

    #[test]
    fn label_count_must_match_matrix() {
        let err = hard_example_mining(&two_pair_matrix(), &[0, 0, 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }

    #[test]
    fn gathered_distances_match_mined_values() {
        let dist = two_pair_matrix();
        let mined = hard_example_mining(&dist, &[0, 0, 1, 1]).unwrap();
        let (ap, an) = gather_mined(&dist, &mined).unwrap();
        assert_eq!(ap.to_vec1::<f32>().unwrap(), mined.dist_ap);
        assert_eq!(an.to_vec1::<f32>().unwrap(), mined.dist_an);
    }
}
