//! Alignment-based distance over local (per-region) features
//!
//! Each image carries an ordered sequence of region descriptors. The
//! distance between two images is the cost of the cheapest monotonic
//! alignment between their sequences: build the pairwise region distance
//! grid, squash it into [0, 1), then take the shortest corner-to-corner
//! path moving only right or down. The whole computation is expressed in
//! tensor ops (`minimum` included) so gradients flow through the chosen
//! path.
//!
//! Two batch-level policies pick which sample pairs get aligned:
//! reusing the hard triplets mined on global distances, or re-mining on
//! the full local distance matrix. Both produce the same result shape.

use candle_core::{IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loss::distance::{batch_pairwise_distances, normalize_rows, pairwise_distances};
use crate::loss::mining::{gather_mined, hard_example_mining};
use crate::loss::triplet::{TripletLoss, TripletStats};

/// How the local loss chooses its triplets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSamplePolicy {
    /// Reuse the anchor/positive/negative indices mined on global
    /// distances; only the selected pairs get aligned.
    SharedWithGlobal,
    /// Compute the full local distance matrix and mine on it
    /// independently. The only policy that can feed the local-distance
    /// mutual term, which needs the full matrix.
    Independent,
}

/// Result of a local-loss evaluation. The shape is identical across
/// policies so downstream consumers stay policy-agnostic.
#[derive(Debug)]
pub struct LocalLossOutput {
    /// Scalar loss.
    pub loss: Tensor,
    /// Triplet statistics over the local distances.
    pub stats: TripletStats,
    /// Full N×N alignment distance matrix, present only under
    /// [`LocalSamplePolicy::Independent`].
    pub dist_mat: Option<Tensor>,
}

/// Map raw region distances into [0, 1): `(e^d - 1)/(e^d + 1)`.
fn squash(d: &Tensor) -> Result<Tensor> {
    Ok((d / 2.0)?.tanh()?)
}

/// Cheapest corner-to-corner path over a stack of cost grids.
///
/// `grid[i][j]` holds the cell costs at (i, j) for every pair in the
/// stack; movement is one step right or down. Differentiable through
/// `minimum`.
fn shortest_path(grid: &[Vec<Tensor>]) -> Result<Tensor> {
    let m = grid.len();
    let n = grid.first().map(Vec::len).unwrap_or(0);
    if m == 0 || n == 0 {
        return Err(Error::model("alignment grid has no cells"));
    }
    let mut dist: Vec<Vec<Tensor>> = Vec::with_capacity(m);
    for i in 0..m {
        let mut row: Vec<Tensor> = Vec::with_capacity(n);
        for j in 0..n {
            let cell = &grid[i][j];
            let best = if i == 0 && j == 0 {
                cell.clone()
            } else if i == 0 {
                (&row[j - 1] + cell)?
            } else if j == 0 {
                (&dist[i - 1][0] + cell)?
            } else {
                (&dist[i - 1][j].minimum(&row[j - 1])? + cell)?
            };
            row.push(best);
        }
        dist.push(row);
    }
    Ok(dist[m - 1][n - 1].clone())
}

/// Alignment distance between every sample pair.
///
/// `x` is `[Nx, Rx, C]`, `y` is `[Ny, Ry, C]`; output is `[Nx, Ny]`.
pub fn local_distance_matrix(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.rank() != 3 || y.rank() != 3 {
        return Err(Error::model(format!(
            "local features must be 3-D, got ranks {} and {}",
            x.rank(),
            y.rank()
        )));
    }
    let (nx, rx, c) = x.dims3()?;
    let (ny, ry, cy) = y.dims3()?;
    if c != cy {
        return Err(Error::model(format!(
            "local descriptor widths differ: {c} vs {cy}"
        )));
    }
    if rx == 0 || ry == 0 {
        return Err(Error::model("local features must have at least one region"));
    }
    let d = pairwise_distances(&x.reshape((nx * rx, c))?, &y.reshape((ny * ry, c))?)?;
    let d = squash(&d)?
        .reshape((nx, rx, ny, ry))?
        .permute((1, 3, 0, 2))?
        .contiguous()?; // [Rx, Ry, Nx, Ny]
    let mut grid = Vec::with_capacity(rx);
    for i in 0..rx {
        let mut row = Vec::with_capacity(ry);
        for j in 0..ry {
            row.push(d.i((i, j))?);
        }
        grid.push(row);
    }
    shortest_path(&grid)
}

/// Alignment distance per aligned pair: `x[k]` against `y[k]`.
///
/// Both inputs are `[N, R, C]` stacks; output is a length-N vector.
pub fn batch_local_distances(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let d = batch_pairwise_distances(x, y)?;
    let d = squash(&d)?;
    let (_, rx, ry) = d.dims3()?;
    if rx == 0 || ry == 0 {
        return Err(Error::model("local features must have at least one region"));
    }
    let d = d.permute((1, 2, 0))?.contiguous()?; // [Rx, Ry, N]
    let mut grid = Vec::with_capacity(rx);
    for i in 0..rx {
        let mut row = Vec::with_capacity(ry);
        for j in 0..ry {
            row.push(d.i((i, j))?);
        }
        grid.push(row);
    }
    shortest_path(&grid)
}

/// Local loss reusing hard indices mined on global distances. Aligns only
/// the N positive and N negative pairs instead of the full N² grid.
pub fn local_loss_shared(
    tri: &TripletLoss,
    local_feat: &Tensor,
    pos_inds: &[u32],
    neg_inds: &[u32],
    normalize: bool,
) -> Result<LocalLossOutput> {
    let feat = if normalize {
        normalize_rows(local_feat)?
    } else {
        local_feat.clone()
    };
    let device = feat.device();
    let pos = Tensor::from_vec(pos_inds.to_vec(), pos_inds.len(), device)?;
    let neg = Tensor::from_vec(neg_inds.to_vec(), neg_inds.len(), device)?;
    let dist_ap = batch_local_distances(&feat, &feat.index_select(&pos, 0)?)?;
    let dist_an = batch_local_distances(&feat, &feat.index_select(&neg, 0)?)?;
    let loss = tri.forward(&dist_ap, &dist_an)?;
    let stats = TripletStats::from_distances(
        &dist_ap.to_vec1::<f32>()?,
        &dist_an.to_vec1::<f32>()?,
        tri.mode(),
    );
    Ok(LocalLossOutput {
        loss,
        stats,
        dist_mat: None,
    })
}

/// Local loss that mines its own hard samples on the full alignment
/// distance matrix.
pub fn local_loss_independent(
    tri: &TripletLoss,
    local_feat: &Tensor,
    labels: &[u32],
    normalize: bool,
) -> Result<LocalLossOutput> {
    let feat = if normalize {
        normalize_rows(local_feat)?
    } else {
        local_feat.clone()
    };
    let dist_mat = local_distance_matrix(&feat, &feat)?;
    let mined = hard_example_mining(&dist_mat, labels)?;
    let (dist_ap, dist_an) = gather_mined(&dist_mat, &mined)?;
    let loss = tri.forward(&dist_ap, &dist_an)?;
    let stats = TripletStats::from_mined(&mined, tri.mode());
    Ok(LocalLossOutput {
        loss,
        stats,
        dist_mat: Some(dist_mat),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::triplet::MarginMode;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn cost_grid(costs: &[&[f32]]) -> Vec<Vec<Tensor>> {
        costs
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&c| Tensor::from_vec(vec![c], 1, &Device::Cpu).unwrap())
                    .collect()
            })
            .collect()
    }

    fn path_cost(costs: &[&[f32]]) -> f32 {
        shortest_path(&cost_grid(costs))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0]
    }

    #[test]
    fn shortest_path_takes_the_cheap_branch() {
        assert_relative_eq!(path_cost(&[&[1.0, 10.0], &[1.0, 1.0]]), 3.0);
        assert_relative_eq!(path_cost(&[&[1.0, 1.0], &[10.0, 1.0]]), 3.0);
    }

    #[test]
    fn shortest_path_handles_rectangular_grids() {
        assert_relative_eq!(
            path_cost(&[&[1.0, 2.0, 5.0], &[5.0, 1.0, 1.0]]),
            5.0
        );
        assert_relative_eq!(path_cost(&[&[2.0]]), 2.0);
    }

    #[test]
    fn squash_stays_inside_the_unit_interval() {
        let d = Tensor::from_vec(vec![0.0f32, 1.0, 50.0], 3, &Device::Cpu).unwrap();
        let s = squash(&d).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(s[0], 0.0, epsilon = 1e-6);
        assert!(s[1] > 0.0 && s[1] < 1.0);
        assert!(s[2] <= 1.0);
    }

    fn stack(data: Vec<f32>, n: usize, r: usize, c: usize) -> Tensor {
        Tensor::from_vec(data, (n, r, c), &Device::Cpu).unwrap()
    }

    #[test]
    fn nearby_sequences_score_closer_than_distant_ones() {
        let x = stack(vec![0.0, 0.0, 1.0, 0.0], 1, 2, 2);
        let near = stack(vec![0.1, 0.0, 1.1, 0.0], 1, 2, 2);
        let far = stack(vec![5.0, 5.0, 6.0, 5.0], 1, 2, 2);
        let d_near = batch_local_distances(&x, &near).unwrap().to_vec1::<f32>().unwrap()[0];
        let d_far = batch_local_distances(&x, &far).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!(d_near < d_far);
    }

    #[test]
    fn matrix_variant_is_symmetric() {
        let x = stack(
            vec![
                0.0, 0.0, 1.0, 0.0, //
                2.0, 1.0, 3.0, 1.0, //
                -1.0, 4.0, 0.0, 4.0,
            ],
            3,
            2,
            2,
        );
        let d = local_distance_matrix(&x, &x).unwrap().to_vec2::<f32>().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(d[i][j], d[j][i], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn independent_policy_exposes_the_full_matrix() {
        let tri = TripletLoss::new(MarginMode::Hard { margin: 0.3 });
        let feat = stack(
            vec![
                0.0, 0.0, 0.1, 0.0, //
                0.2, 0.0, 0.3, 0.0, //
                5.0, 5.0, 5.1, 5.0, //
                5.2, 5.0, 5.3, 5.0,
            ],
            4,
            2,
            2,
        );
        let labels = [0u32, 0, 1, 1];
        let out = local_loss_independent(&tri, &feat, &labels, true).unwrap();
        assert!(out.dist_mat.is_some());
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());

        let shared = local_loss_shared(&tri, &feat, &[1, 0, 3, 2], &[2, 2, 0, 0], true).unwrap();
        assert!(shared.dist_mat.is_none());
        assert!(shared.loss.to_scalar::<f32>().unwrap().is_finite());
    }
}
