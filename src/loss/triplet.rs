//! Margin-based triplet loss over mined anchor-positive / anchor-negative
//! distances
//!
//! Two formulations are supported: a hinge with a fixed margin,
//! `mean(max(0, d_ap - d_an + margin))`, and the soft-margin variant
//! `mean(ln(1 + e^{d_ap - d_an}))`. The same evaluator is applied twice per
//! model per step, once over global feature distances and once over local
//! alignment distances.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::loss::mining::MinedTriplets;

/// Margin formulation for the triplet loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    /// Hinge loss with a fixed margin.
    Hard {
        /// Required separation between negative and positive distances.
        margin: f64,
    },
    /// Soft-margin formulation, `ln(1 + e^{d_ap - d_an})`.
    Soft,
}

impl MarginMode {
    /// Margin used for the satisfied-margin statistic. Soft mode has no
    /// fixed margin, so the statistic degenerates to the ordering check.
    pub fn stat_margin(&self) -> f32 {
        match self {
            MarginMode::Hard { margin } => *margin as f32,
            MarginMode::Soft => 0.0,
        }
    }
}

/// Triplet loss evaluator. Stateless apart from its margin configuration.
#[derive(Debug, Clone, Copy)]
pub struct TripletLoss {
    mode: MarginMode,
}

impl TripletLoss {
    /// Build an evaluator for the given margin mode.
    pub fn new(mode: MarginMode) -> Self {
        Self { mode }
    }

    /// The configured margin mode.
    pub fn mode(&self) -> MarginMode {
        self.mode
    }

    /// Mean triplet loss over length-N distance vectors.
    pub fn forward(&self, dist_ap: &Tensor, dist_an: &Tensor) -> Result<Tensor> {
        let diff = (dist_ap - dist_an)?;
        let loss = match self.mode {
            MarginMode::Hard { margin } => (diff + margin)?.relu()?,
            MarginMode::Soft => softplus(&diff)?,
        };
        Ok(loss.mean_all()?)
    }
}

/// Numerically stable `ln(1 + e^x)`: `max(x, 0) + ln(1 + e^{-|x|})`.
fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.relu()?;
    let decay = ((x.abs()?.neg()?.exp()? + 1.0)?).log()?;
    Ok((linear + decay)?)
}

/// Summary statistics for one batch of mined triplets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TripletStats {
    /// Fraction of triplets with `d_an > d_ap`.
    pub precision: f32,
    /// Fraction of triplets with `d_an > d_ap + margin`.
    pub satisfied: f32,
    /// Mean anchor-positive distance.
    pub mean_dist_ap: f32,
    /// Mean anchor-negative distance.
    pub mean_dist_an: f32,
}

impl TripletStats {
    /// Statistics straight from a mining result.
    pub fn from_mined(mined: &MinedTriplets, mode: MarginMode) -> Self {
        Self::from_distances(&mined.dist_ap, &mined.dist_an, mode)
    }

    /// Statistics from paired anchor-positive / anchor-negative distances.
    pub fn from_distances(dist_ap: &[f32], dist_an: &[f32], mode: MarginMode) -> Self {
        let n = dist_ap.len().min(dist_an.len());
        if n == 0 {
            return Self::default();
        }
        let margin = mode.stat_margin();
        let mut ordered = 0usize;
        let mut satisfied = 0usize;
        let mut sum_ap = 0f64;
        let mut sum_an = 0f64;
        for (&ap, &an) in dist_ap.iter().zip(dist_an.iter()) {
            if an > ap {
                ordered += 1;
            }
            if an > ap + margin {
                satisfied += 1;
            }
            sum_ap += ap as f64;
            sum_an += an as f64;
        }
        Self {
            precision: ordered as f32 / n as f32,
            satisfied: satisfied as f32 / n as f32,
            mean_dist_ap: (sum_ap / n as f64) as f32,
            mean_dist_an: (sum_an / n as f64) as f32,
        }
    }
}
