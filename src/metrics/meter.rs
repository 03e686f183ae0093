//! Running averages and the per-epoch meter block

use crate::config::EnabledTerms;
use crate::metrics::MetricsSink;
use crate::trainer::ModelStepStats;

use crate::error::Result;

/// Running average that also remembers its most recent sample.
///
/// Step logs print the latest value, epoch logs print the average.
#[derive(Debug, Default, Clone)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    /// Record one sample.
    pub fn update(&mut self, val: f64) {
        self.val = val;
        self.sum += val;
        self.count += 1;
    }

    /// Most recent sample, 0 before the first update.
    pub fn val(&self) -> f64 {
        self.val
    }

    /// Mean over all samples, 0 before the first update.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Number of samples recorded.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// All meters for one epoch.
///
/// Per-term meters follow the last model of the ensemble, which is the one
/// whose numbers the step and epoch log lines show. A fresh block is built
/// at every epoch start.
#[derive(Debug, Default)]
pub struct EpochMeters {
    g_prec: AverageMeter,
    g_margin: AverageMeter,
    g_dist_ap: AverageMeter,
    g_dist_an: AverageMeter,
    g_loss: AverageMeter,
    l_prec: AverageMeter,
    l_margin: AverageMeter,
    l_dist_ap: AverageMeter,
    l_dist_an: AverageMeter,
    l_loss: AverageMeter,
    id_loss: AverageMeter,
    pm_loss: AverageMeter,
    gdm_loss: AverageMeter,
    ldm_loss: AverageMeter,
    total_loss: AverageMeter,
}

impl EpochMeters {
    /// Fresh meters with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one step, taken from the last model's statistics. The step
    /// only fills the terms the run enables, so absent terms stay at zero
    /// samples.
    pub fn update(&mut self, stats: &ModelStepStats) {
        if let Some(s) = &stats.global_stats {
            self.g_prec.update(s.precision as f64);
            self.g_margin.update(s.satisfied as f64);
            self.g_dist_ap.update(s.mean_dist_ap as f64);
            self.g_dist_an.update(s.mean_dist_an as f64);
        }
        if let Some(loss) = stats.global_loss {
            self.g_loss.update(loss as f64);
        }
        if let Some(s) = &stats.local_stats {
            self.l_prec.update(s.precision as f64);
            self.l_margin.update(s.satisfied as f64);
            self.l_dist_ap.update(s.mean_dist_ap as f64);
            self.l_dist_an.update(s.mean_dist_an as f64);
        }
        if let Some(loss) = stats.local_loss {
            self.l_loss.update(loss as f64);
        }
        if let Some(loss) = stats.id_loss {
            self.id_loss.update(loss as f64);
        }
        if let Some(loss) = stats.prob_mutual_loss {
            self.pm_loss.update(loss as f64);
        }
        if let Some(loss) = stats.global_mutual_loss {
            self.gdm_loss.update(loss as f64);
        }
        if let Some(loss) = stats.local_mutual_loss {
            self.ldm_loss.update(loss as f64);
        }
        self.total_loss.update(stats.total_loss as f64);
    }

    /// Loss fragments for a step log line, latest values.
    pub fn step_line(&self, enabled: &EnabledTerms) -> String {
        self.line(enabled, false)
    }

    /// Loss fragments for an epoch summary line, epoch averages.
    pub fn epoch_line(&self, enabled: &EnabledTerms) -> String {
        self.line(enabled, true)
    }

    fn line(&self, enabled: &EnabledTerms, use_avg: bool) -> String {
        let v = |m: &AverageMeter| if use_avg { m.avg() } else { m.val() };
        let mut line = String::new();
        if enabled.global {
            line.push_str(&format!(
                ", gp {:.2}%, gm {:.2}%, gd_ap {:.4}, gd_an {:.4}, gL {:.4}",
                v(&self.g_prec) * 100.0,
                v(&self.g_margin) * 100.0,
                v(&self.g_dist_ap),
                v(&self.g_dist_an),
                v(&self.g_loss),
            ));
        }
        if enabled.local {
            line.push_str(&format!(
                ", lp {:.2}%, lm {:.2}%, ld_ap {:.4}, ld_an {:.4}, lL {:.4}",
                v(&self.l_prec) * 100.0,
                v(&self.l_margin) * 100.0,
                v(&self.l_dist_ap),
                v(&self.l_dist_an),
                v(&self.l_loss),
            ));
        }
        if enabled.id {
            line.push_str(&format!(", idL {:.4}", v(&self.id_loss)));
        }
        if enabled.prob_mutual {
            line.push_str(&format!(", pmL {:.4}", v(&self.pm_loss)));
        }
        if enabled.global_mutual {
            line.push_str(&format!(", gdmL {:.4}", v(&self.gdm_loss)));
        }
        if enabled.local_mutual {
            line.push_str(&format!(", ldmL {:.4}", v(&self.ldm_loss)));
        }
        line.push_str(&format!(", loss {:.4}", v(&self.total_loss)));
        line
    }

    /// Push the epoch averages for every enabled term to a sink, grouped
    /// the way downstream dashboards expect them.
    pub fn record_epoch(
        &self,
        epoch: usize,
        enabled: &EnabledTerms,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let mut losses: Vec<(&str, f64)> = Vec::new();
        if enabled.global {
            losses.push(("global_loss", self.g_loss.avg()));
        }
        if enabled.local {
            losses.push(("local_loss", self.l_loss.avg()));
        }
        if enabled.id {
            losses.push(("id_loss", self.id_loss.avg()));
        }
        if enabled.prob_mutual {
            losses.push(("pm_loss", self.pm_loss.avg()));
        }
        if enabled.global_mutual {
            losses.push(("gdm_loss", self.gdm_loss.avg()));
        }
        if enabled.local_mutual {
            losses.push(("ldm_loss", self.ldm_loss.avg()));
        }
        losses.push(("loss", self.total_loss.avg()));
        sink.record(epoch, "loss", &losses)?;

        let mut precision: Vec<(&str, f64)> = Vec::new();
        let mut margin: Vec<(&str, f64)> = Vec::new();
        if enabled.global {
            precision.push(("global_precision", self.g_prec.avg()));
            margin.push(("global_satisfy_margin", self.g_margin.avg()));
        }
        if enabled.local {
            precision.push(("local_precision", self.l_prec.avg()));
            margin.push(("local_satisfy_margin", self.l_margin.avg()));
        }
        if !precision.is_empty() {
            sink.record(epoch, "tri_precision", &precision)?;
            sink.record(epoch, "satisfy_margin", &margin)?;
        }

        if enabled.global {
            sink.record(
                epoch,
                "global_dist",
                &[
                    ("global_dist_ap", self.g_dist_ap.avg()),
                    ("global_dist_an", self.g_dist_an.avg()),
                ],
            )?;
        }
        if enabled.local {
            sink.record(
                epoch,
                "local_dist",
                &[
                    ("local_dist_ap", self.l_dist_ap.avg()),
                    ("local_dist_an", self.l_dist_an.avg()),
                ],
            )?;
        }
        Ok(())
    }

    /// Epoch-average total loss.
    pub fn avg_total_loss(&self) -> f64 {
        self.total_loss.avg()
    }
}
