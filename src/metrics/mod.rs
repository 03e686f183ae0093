//! Training metrics: running meters, log-line assembly, and sinks
//!
//! The driver keeps one [`EpochMeters`] block per epoch, updates it from
//! the last model's step statistics, prints step and epoch lines built from
//! only the enabled loss terms, and pushes epoch averages to a
//! [`MetricsSink`].

pub mod meter;
pub mod sink;

pub use meter::{AverageMeter, EpochMeters};
pub use sink::{JsonlSink, MetricsSink, TracingSink};
