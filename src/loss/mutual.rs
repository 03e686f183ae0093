//! Mutual-learning penalties between co-trained models
//!
//! Each model is pulled toward its peers' predictions and embedding
//! geometry. The peer side of every term is a fixed target: peer tensors
//! are moved onto the consuming model's device and detached, so one
//! model's backward pass never reaches another model's parameters.
//!
//! Normalization follows the batch: the probability term divides the
//! element-sum KL by `(M-1)·N`, the distance terms divide their
//! element-sum squared differences by `(M-1)·N²`.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Floor under probabilities before taking logs in the KL entropy term.
const LOG_FLOOR: f64 = 1e-12;

/// KL-divergence pull of one model's predicted distribution toward each
/// peer's, `Σ_j Σ p_j·(ln p_j − log_p_i) / ((M-1)·N)`.
///
/// `log_probs` are the consuming model's log-softmax outputs `[N, K]`;
/// `peer_probs` are the other models' softmax outputs. Peers may live on
/// other devices and arrive detached regardless of their graph state.
pub fn probability_mutual_loss(
    log_probs: &Tensor,
    peer_probs: &[&Tensor],
    device: &Device,
) -> Result<Tensor> {
    if peer_probs.is_empty() {
        return Err(Error::config(
            "probability mutual loss requires at least one peer model",
        ));
    }
    let (n, _classes) = log_probs.dims2()?;
    let mut acc: Option<Tensor> = None;
    for peer in peer_probs {
        let target = peer.to_device(device)?.detach();
        let log_target = target.clamp(LOG_FLOOR, 1.0)?.log()?;
        let kl = (&target * (log_target - log_probs)?)?.sum_all()?;
        acc = Some(match acc {
            None => kl,
            Some(total) => (total + kl)?,
        });
    }
    let Some(total) = acc else {
        return Err(Error::config("no peer contributions accumulated"));
    };
    Ok((total / (peer_probs.len() * n) as f64)?)
}

/// Squared-difference pull of one model's distance matrix toward each
/// peer's, `Σ_j Σ (D_i − D_j)² / ((M-1)·N²)`.
///
/// Used for both global and local distance matrices; peers are detached.
pub fn distance_mutual_loss(
    dist_mat: &Tensor,
    peer_mats: &[&Tensor],
    device: &Device,
) -> Result<Tensor> {
    if peer_mats.is_empty() {
        return Err(Error::config(
            "distance mutual loss requires at least one peer model",
        ));
    }
    let (n, m) = dist_mat.dims2()?;
    if n != m {
        return Err(Error::model(format!(
            "distance matrix must be square, got {n}x{m}"
        )));
    }
    let mut acc: Option<Tensor> = None;
    for peer in peer_mats {
        let target = peer.to_device(device)?.detach();
        let gap = (dist_mat - target)?.sqr()?.sum_all()?;
        acc = Some(match acc {
            None => gap,
            Some(total) => (total + gap)?,
        });
    }
    let Some(total) = acc else {
        return Err(Error::config("no peer contributions accumulated"));
    };
    Ok((total / (peer_mats.len() * n * n) as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Var};
    use candle_nn::ops::{log_softmax, softmax};

    fn device() -> Device {
        Device::Cpu
    }

    fn probs2(rows: &[&[f32]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &device()).unwrap()
    }

    #[test]
    fn identical_distributions_have_zero_divergence() {
        let p = probs2(&[&[0.25, 0.75], &[0.5, 0.5]]);
        let log_p = p.log().unwrap();
        let loss = probability_mutual_loss(&log_p, &[&p], &device())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_relative_eq!(loss, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn divergence_matches_hand_computation() {
        let p = probs2(&[&[0.5, 0.5]]);
        let q = probs2(&[&[0.9, 0.1]]);
        let log_p = p.log().unwrap();
        let loss = probability_mutual_loss(&log_p, &[&q], &device())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // KL(q || p) = 0.9 ln(0.9/0.5) + 0.1 ln(0.1/0.5), one peer, batch 1
        let expected = 0.9 * (0.9f32 / 0.5).ln() + 0.1 * (0.1f32 / 0.5).ln();
        assert_relative_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn distance_gap_is_normalized_by_pairs_and_batch_squared() {
        let a = probs2(&[&[0.0, 1.0], &[1.0, 0.0]]);
        let b = probs2(&[&[1.0, 2.0], &[2.0, 1.0]]);
        // every element differs by 1, so the sum of squares is 4
        let loss = distance_mutual_loss(&a, &[&b], &device())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_relative_eq!(loss, 4.0 / 4.0, epsilon = 1e-6);

        // two identical peers double the sum and the divisor
        let loss2 = distance_mutual_loss(&a, &[&b, &b], &device())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_relative_eq!(loss2, loss, epsilon = 1e-6);
    }

    #[test]
    fn empty_peer_set_is_rejected() {
        let p = probs2(&[&[0.5, 0.5]]);
        assert!(probability_mutual_loss(&p.log().unwrap(), &[], &device()).is_err());
        assert!(distance_mutual_loss(&p, &[], &device()).is_err());
    }

    #[test]
    fn gradients_stop_at_the_peer_boundary() {
        let dev = device();
        let own = Var::from_tensor(
            &Tensor::from_vec(vec![0.2f32, -0.1, 0.4, 0.3], (2, 2), &dev).unwrap(),
        )
        .unwrap();
        let peer = Var::from_tensor(
            &Tensor::from_vec(vec![1.0f32, 0.0, -0.5, 0.25], (2, 2), &dev).unwrap(),
        )
        .unwrap();

        let log_p = log_softmax(own.as_tensor(), 1).unwrap();
        let peer_probs = softmax(peer.as_tensor(), 1).unwrap();
        let loss = probability_mutual_loss(&log_p, &[&peer_probs], &dev).unwrap();
        let grads = loss.backward().unwrap();

        assert!(grads.get(own.as_tensor()).is_some());
        assert!(grads.get(peer.as_tensor()).is_none());

        // same severing for the distance term
        let own_mat = own.as_tensor().sqr().unwrap();
        let peer_mat = peer.as_tensor().sqr().unwrap();
        let loss = distance_mutual_loss(&own_mat, &[&peer_mat], &dev).unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(own.as_tensor()).is_some());
        assert!(grads.get(peer.as_tensor()).is_none());
    }

    #[test]
    fn peer_tensors_keep_their_dtype_contract() {
        let p = probs2(&[&[0.3, 0.7]]);
        assert_eq!(p.dtype(), DType::F32);
        let loss = distance_mutual_loss(&p, &[&p], &device()).unwrap();
        assert_eq!(loss.dtype(), DType::F32);
    }
}
