//! Pairwise distance computation over embedding batches
//!
//! All distances are squared-Euclidean at the core, computed through the
//! `|a|² + |b|² - 2a·b` expansion so a batch against itself costs one matmul.
//! The expansion can go slightly negative from rounding, so squared distances
//! are floored at zero and euclidean distances at a small epsilon before the
//! square root.

use candle_core::{Tensor, D};

use crate::error::{Error, Result};

/// Floor applied under square roots to keep gradients finite.
const SQRT_FLOOR: f64 = 1e-12;

/// Epsilon added to row norms during normalization.
const NORM_EPS: f64 = 1e-12;

/// L2-normalize along the last dimension: `x / (|x| + eps)`.
///
/// Works on `[N, F]` global features and `[N, R, C]` local feature maps
/// alike (each region descriptor is normalized on its own).
pub fn normalize_rows(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(x.broadcast_div(&(norm + NORM_EPS)?)?)
}

/// Squared pairwise distances between the rows of `x` (`[m, F]`) and the
/// rows of `y` (`[n, F]`), clamped at zero. Output is `[m, n]`.
pub fn squared_pairwise_distances(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.rank() != 2 || y.rank() != 2 {
        return Err(Error::malformed_batch(format!(
            "feature matrices must be 2-D, got ranks {} and {}",
            x.rank(),
            y.rank()
        )));
    }
    let (_, fx) = x.dims2()?;
    let (_, fy) = y.dims2()?;
    if fx != fy {
        return Err(Error::malformed_batch(format!(
            "feature widths differ: {fx} vs {fy}"
        )));
    }
    let xx = x.sqr()?.sum_keepdim(1)?; // [m, 1]
    let yy = y.sqr()?.sum_keepdim(1)?.t()?; // [1, n]
    let xy = x.matmul(&y.t()?)?; // [m, n]
    let sq = xx.broadcast_add(&yy)?.sub(&(xy * 2.0)?)?;
    Ok(sq.maximum(0.0)?)
}

/// Euclidean pairwise distances, floored at `1e-12` before the root so the
/// diagonal of a self-comparison stays differentiable.
pub fn pairwise_distances(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let sq = squared_pairwise_distances(x, y)?;
    Ok(sq.maximum(SQRT_FLOOR)?.sqrt()?)
}

/// Euclidean distances between aligned stacks of descriptor sequences.
///
/// `x` is `[B, m, F]`, `y` is `[B, n, F]`; the output `[B, m, n]` holds, for
/// every batch entry `b`, the distances between `x[b]`'s and `y[b]`'s rows.
pub fn batch_pairwise_distances(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.rank() != 3 || y.rank() != 3 {
        return Err(Error::malformed_batch(format!(
            "descriptor stacks must be 3-D, got ranks {} and {}",
            x.rank(),
            y.rank()
        )));
    }
    let (bx, _, fx) = x.dims3()?;
    let (by, _, fy) = y.dims3()?;
    if bx != by || fx != fy {
        return Err(Error::malformed_batch(format!(
            "descriptor stacks disagree: [{bx}, _, {fx}] vs [{by}, _, {fy}]"
        )));
    }
    let xx = x.sqr()?.sum_keepdim(2)?; // [B, m, 1]
    let yy = y.sqr()?.sum_keepdim(2)?.transpose(1, 2)?; // [B, 1, n]
    let xy = x.matmul(&y.transpose(1, 2)?.contiguous()?)?; // [B, m, n]
    let sq = xx.broadcast_add(&yy)?.sub(&(xy * 2.0)?)?;
    Ok(sq.maximum(SQRT_FLOOR)?.sqrt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use proptest::prelude::*;

    fn tensor2(rows: &[&[f32]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn squared_distance_matches_hand_computation() {
        let x = tensor2(&[&[0.0, 0.0], &[3.0, 4.0]]);
        let d = squared_pairwise_distances(&x, &x).unwrap();
        let d = d.to_vec2::<f32>().unwrap();
        assert_relative_eq!(d[0][1], 25.0, epsilon = 1e-5);
        assert_relative_eq!(d[1][0], 25.0, epsilon = 1e-5);
    }

    #[test]
    fn euclidean_distance_takes_the_root() {
        let x = tensor2(&[&[0.0, 0.0], &[3.0, 4.0]]);
        let d = pairwise_distances(&x, &x).unwrap().to_vec2::<f32>().unwrap();
        assert_relative_eq!(d[0][1], 5.0, epsilon = 1e-4);
    }

    #[test]
    fn self_distance_sits_on_zero() {
        let x = tensor2(&[&[1.0, 2.0, 3.0], &[-4.0, 0.5, 2.0], &[7.0, 7.0, 7.0]]);
        let d = squared_pairwise_distances(&x, &x).unwrap();
        let d = d.to_vec2::<f32>().unwrap();
        for (i, row) in d.iter().enumerate() {
            assert!(row[i].abs() < 1e-4, "diagonal {} was {}", i, row[i]);
        }
    }

    #[test]
    fn normalized_rows_are_unit_length() {
        let x = tensor2(&[&[3.0, 4.0], &[0.1, 0.0]]);
        let n = normalize_rows(&x).unwrap().to_vec2::<f32>().unwrap();
        for row in &n {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn non_2d_input_is_rejected() {
        let x = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = squared_pairwise_distances(&x, &x).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }

    #[test]
    fn mismatched_feature_widths_are_rejected() {
        let x = tensor2(&[&[1.0, 2.0]]);
        let y = tensor2(&[&[1.0, 2.0, 3.0]]);
        assert!(squared_pairwise_distances(&x, &y).is_err());
    }

    #[test]
    fn batched_variant_agrees_with_flat_variant() {
        let x = Tensor::from_vec(
            vec![0.0f32, 0.0, 1.0, 1.0, 2.0, 0.0, 0.0, 3.0],
            (2, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let d = batch_pairwise_distances(&x, &x).unwrap();
        let d = d.to_vec3::<f32>().unwrap();
        // batch 0: rows (0,0) and (1,1), distance sqrt(2)
        assert_relative_eq!(d[0][0][1], 2f32.sqrt(), epsilon = 1e-4);
        // batch 1: rows (2,0) and (0,3), distance sqrt(13)
        assert_relative_eq!(d[1][0][1], 13f32.sqrt(), epsilon = 1e-4);
    }

    proptest! {
        #[test]
        fn squared_distances_are_symmetric_and_non_negative(
            values in proptest::collection::vec(-10.0f32..10.0, 24)
        ) {
            let x = Tensor::from_vec(values, (6, 4), &Device::Cpu).unwrap();
            let d = squared_pairwise_distances(&x, &x).unwrap();
            let d = d.to_vec2::<f32>().unwrap();
            for i in 0..6 {
                for j in 0..6 {
                    prop_assert!(d[i][j] >= 0.0);
                    prop_assert!((d[i][j] - d[j][i]).abs() < 1e-3);
                }
            }
        }
    }
}
