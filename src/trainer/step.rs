//! One synchronized training step over the whole ensemble
//!
//! The step runs in two passes plus an update phase. Pass one runs every
//! forward and each model's own loss terms. Pass two assembles the mutual
//! terms from detached peer tensors, forms each model's weighted total, and
//! records its gradients. Only after every model has gradients do the
//! optimizers step, so no model ever regularizes toward a peer that already
//! moved within the same step.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

use crate::config::{EnabledTerms, LossConfig};
use crate::data::TrainBatch;
use crate::error::{Error, Result};
use crate::loss::{
    distance_mutual_loss, global_distances, global_loss, hard_example_mining,
    local_loss_independent, local_loss_shared, probability_mutual_loss, LocalSamplePolicy,
    MinedTriplets, TripletLoss, TripletStats,
};
use crate::model::ReidModel;
use crate::optim::ModelOptimizer;

/// Per-model scalars from one step.
///
/// Loss values are the unweighted term values; `total_loss` is the weighted
/// sum that was backpropagated. Terms the run disables stay `None`.
#[derive(Debug, Clone, Default)]
pub struct ModelStepStats {
    /// Global triplet loss
    pub global_loss: Option<f32>,
    /// Mining statistics of the global triplet term
    pub global_stats: Option<TripletStats>,
    /// Local alignment triplet loss
    pub local_loss: Option<f32>,
    /// Mining statistics of the local triplet term
    pub local_stats: Option<TripletStats>,
    /// Identity classification loss
    pub id_loss: Option<f32>,
    /// Probability mutual loss
    pub prob_mutual_loss: Option<f32>,
    /// Global-distance mutual loss
    pub global_mutual_loss: Option<f32>,
    /// Local-distance mutual loss
    pub local_mutual_loss: Option<f32>,
    /// Weighted total that was backpropagated
    pub total_loss: f32,
}

/// Result of one ensemble step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// One stats block per model, in ensemble order
    pub models: Vec<ModelStepStats>,
}

impl StepOutput {
    /// Stats of the last model, the one the log lines follow.
    pub fn last(&self) -> &ModelStepStats {
        &self.models[self.models.len() - 1]
    }
}

/// Everything pass two needs from one model's forward.
#[derive(Default)]
struct ForwardRecord {
    g_mat: Option<Tensor>,
    mined: Option<MinedTriplets>,
    g_loss: Option<Tensor>,
    g_stats: Option<TripletStats>,
    l_loss: Option<Tensor>,
    l_stats: Option<TripletStats>,
    l_mat: Option<Tensor>,
    id_loss: Option<Tensor>,
    probs: Option<Tensor>,
    log_probs: Option<Tensor>,
}

fn expect_term<'a>(term: &'a Option<Tensor>, what: &'static str) -> Result<&'a Tensor> {
    term.as_ref()
        .ok_or_else(|| Error::model(format!("{what} was not computed in the forward pass")))
}

fn finite_scalar(value: &Tensor, term: &'static str) -> Result<f32> {
    let v = value.to_scalar::<f32>()?;
    if !v.is_finite() {
        return Err(Error::non_finite(term, v));
    }
    Ok(v)
}

fn accumulate(total: Option<Tensor>, term: &Tensor, weight: f64) -> Result<Option<Tensor>> {
    let weighted = (term * weight)?;
    Ok(Some(match total {
        Some(sum) => (sum + weighted)?,
        None => weighted,
    }))
}

/// Run one training step over every model, then apply every optimizer.
///
/// Gradient stores for the whole ensemble are collected before any
/// parameter moves; a failure in any model's losses leaves every model
/// unstepped.
pub fn train_step(
    models: &[Box<dyn ReidModel>],
    optimizers: &mut [ModelOptimizer],
    batch: &TrainBatch,
    loss_cfg: &LossConfig,
    enabled: &EnabledTerms,
    g_tri: &TripletLoss,
    l_tri: &TripletLoss,
) -> Result<StepOutput> {
    batch.validate()?;
    if models.len() != optimizers.len() {
        return Err(Error::model(format!(
            "{} models but {} optimizers",
            models.len(),
            optimizers.len()
        )));
    }

    let shared_local = enabled.local
        && loss_cfg.local_hard_samples == LocalSamplePolicy::SharedWithGlobal;
    let need_mining = enabled.global || shared_local;
    let normalize = loss_cfg.normalize_features;

    // Pass one: forwards and per-model terms.
    let mut records = Vec::with_capacity(models.len());
    for model in models {
        let device = model.device();
        let images = batch.images_on(device)?;
        let out = model.forward(&images)?;
        let mut rec = ForwardRecord::default();

        if enabled.global {
            let g = global_loss(g_tri, &out.global, &batch.labels, normalize)?;
            rec.g_loss = Some(g.loss);
            rec.g_stats = Some(g.stats);
            rec.mined = Some(g.mined);
            rec.g_mat = Some(g.dist_mat);
        } else if need_mining || enabled.global_mutual {
            let g_mat = global_distances(&out.global, normalize)?;
            if need_mining {
                rec.mined = Some(hard_example_mining(&g_mat, &batch.labels)?);
            }
            rec.g_mat = Some(g_mat);
        }

        if enabled.local {
            let l_out = match loss_cfg.local_hard_samples {
                LocalSamplePolicy::Independent => {
                    local_loss_independent(l_tri, &out.local, &batch.labels, normalize)?
                }
                LocalSamplePolicy::SharedWithGlobal => {
                    let mined = rec.mined.as_ref().ok_or_else(|| {
                        Error::model("shared local sampling needs global mining results")
                    })?;
                    local_loss_shared(
                        l_tri,
                        &out.local,
                        &mined.pos_inds,
                        &mined.neg_inds,
                        normalize,
                    )?
                }
            };
            rec.l_loss = Some(l_out.loss);
            rec.l_stats = Some(l_out.stats);
            rec.l_mat = l_out.dist_mat;
        }

        if enabled.id {
            let labels = batch.labels_tensor(device)?;
            rec.id_loss = Some(candle_nn::loss::cross_entropy(&out.logits, &labels)?);
        }

        if enabled.prob_mutual {
            rec.probs = Some(softmax(&out.logits, D::Minus1)?);
            rec.log_probs = Some(log_softmax(&out.logits, D::Minus1)?);
        }

        records.push(rec);
    }

    // Pass two: mutual terms, weighted totals, gradients.
    let mut grad_stores: Vec<GradStore> = Vec::with_capacity(models.len());
    let mut stats_out: Vec<ModelStepStats> = Vec::with_capacity(models.len());
    for (k, rec) in records.iter().enumerate() {
        let device = models[k].device();
        let mut stats = ModelStepStats::default();
        let mut total: Option<Tensor> = None;

        if let Some(g_loss) = &rec.g_loss {
            stats.global_loss = Some(finite_scalar(g_loss, "global triplet loss")?);
            stats.global_stats = rec.g_stats.clone();
            total = accumulate(total, g_loss, loss_cfg.global_weight)?;
        }
        if let Some(l_loss) = &rec.l_loss {
            stats.local_loss = Some(finite_scalar(l_loss, "local triplet loss")?);
            stats.local_stats = rec.l_stats.clone();
            total = accumulate(total, l_loss, loss_cfg.local_weight)?;
        }
        if let Some(id_loss) = &rec.id_loss {
            stats.id_loss = Some(finite_scalar(id_loss, "identity loss")?);
            total = accumulate(total, id_loss, loss_cfg.id_weight)?;
        }

        if enabled.prob_mutual {
            let log_probs = expect_term(&rec.log_probs, "log-probabilities")?;
            let peers = peer_terms(&records, k, |r| &r.probs, "peer probabilities")?;
            let pm = probability_mutual_loss(log_probs, &peers, device)?;
            stats.prob_mutual_loss = Some(finite_scalar(&pm, "probability mutual loss")?);
            total = accumulate(total, &pm, loss_cfg.prob_mutual_weight)?;
        }
        if enabled.global_mutual {
            let g_mat = expect_term(&rec.g_mat, "global distance matrix")?;
            let peers = peer_terms(&records, k, |r| &r.g_mat, "peer global distances")?;
            let gdm = distance_mutual_loss(g_mat, &peers, device)?;
            stats.global_mutual_loss = Some(finite_scalar(&gdm, "global distance mutual loss")?);
            total = accumulate(total, &gdm, loss_cfg.global_mutual_weight)?;
        }
        if enabled.local_mutual {
            let l_mat = expect_term(&rec.l_mat, "local distance matrix")?;
            let peers = peer_terms(&records, k, |r| &r.l_mat, "peer local distances")?;
            let ldm = distance_mutual_loss(l_mat, &peers, device)?;
            stats.local_mutual_loss = Some(finite_scalar(&ldm, "local distance mutual loss")?);
            total = accumulate(total, &ldm, loss_cfg.local_mutual_weight)?;
        }

        let total = total.ok_or_else(|| Error::model("no loss terms are enabled"))?;
        stats.total_loss = finite_scalar(&total, "total loss")?;
        grad_stores.push(total.backward()?);
        stats_out.push(stats);
    }

    // Update phase: every model moves only after every gradient exists.
    for (optimizer, grads) in optimizers.iter_mut().zip(&grad_stores) {
        optimizer.step(grads)?;
    }

    Ok(StepOutput { models: stats_out })
}

fn peer_terms<'a>(
    records: &'a [ForwardRecord],
    k: usize,
    select: impl Fn(&'a ForwardRecord) -> &'a Option<Tensor>,
    what: &'static str,
) -> Result<Vec<&'a Tensor>> {
    records
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != k)
        .map(|(_, rec)| expect_term(select(rec), what))
        .collect()
}
