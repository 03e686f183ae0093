//! Trainer test suite
//!
//! Covers the single-step orchestration (term plumbing, gradient
//! isolation, failure modes) and the epoch driver (scheduling,
//! checkpointing, metrics emission).

mod trainer_tests;
