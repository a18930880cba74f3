//! Learning-rate schedules
//!
//! Each schedule is a multiplicative factor over a parameter group's base
//! learning rate, evaluated at the number of completed optimisation steps.

use std::f64::consts::PI;

use crate::error::{FinetuneError, Result};

pub const SCHEDULER_KINDS: [&str; 6] = [
    "constant",
    "constant_with_warmup",
    "linear",
    "cosine",
    "cosine_with_restarts",
    "polynomial",
];

/// Learning rate scheduler trait
pub trait LRScheduler: Send {
    /// Factor applied to the base learning rate after `step` optimiser steps.
    fn lr_lambda(&self, step: usize) -> f64;

    fn get_lr(&self, base_lr: f64, step: usize) -> f64 {
        base_lr * self.lr_lambda(step)
    }
}

fn warmup(step: usize, warmup_steps: usize) -> Option<f64> {
    if step < warmup_steps {
        Some(step as f64 / warmup_steps.max(1) as f64)
    } else {
        None
    }
}

fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    (step.saturating_sub(warmup_steps)) as f64 / span as f64
}

struct ConstantScheduler;

impl LRScheduler for ConstantScheduler {
    fn lr_lambda(&self, _step: usize) -> f64 {
        1.0
    }
}

struct ConstantWithWarmupScheduler {
    warmup_steps: usize,
}

impl LRScheduler for ConstantWithWarmupScheduler {
    fn lr_lambda(&self, step: usize) -> f64 {
        warmup(step, self.warmup_steps).unwrap_or(1.0)
    }
}

struct LinearScheduler {
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for LinearScheduler {
    fn lr_lambda(&self, step: usize) -> f64 {
        warmup(step, self.warmup_steps)
            .unwrap_or_else(|| (1.0 - progress(step, self.warmup_steps, self.total_steps)).max(0.0))
    }
}

/// Half a cosine wave from the base rate down to zero. `num_cycles` only
/// applies to the restarting variant.
struct CosineScheduler {
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for CosineScheduler {
    fn lr_lambda(&self, step: usize) -> f64 {
        warmup(step, self.warmup_steps).unwrap_or_else(|| {
            let p = progress(step, self.warmup_steps, self.total_steps);
            (0.5 * (1.0 + (PI * p.min(1.0)).cos())).max(0.0)
        })
    }
}

struct CosineWithRestartsScheduler {
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: f64,
}

impl LRScheduler for CosineWithRestartsScheduler {
    fn lr_lambda(&self, step: usize) -> f64 {
        warmup(step, self.warmup_steps).unwrap_or_else(|| {
            let p = progress(step, self.warmup_steps, self.total_steps);
            if p >= 1.0 {
                return 0.0;
            }
            (0.5 * (1.0 + (PI * ((self.num_cycles * p) % 1.0)).cos())).max(0.0)
        })
    }
}

struct PolynomialScheduler {
    warmup_steps: usize,
    total_steps: usize,
    power: f64,
    // lr_end / lr_init
    end_factor: f64,
}

impl LRScheduler for PolynomialScheduler {
    fn lr_lambda(&self, step: usize) -> f64 {
        warmup(step, self.warmup_steps).unwrap_or_else(|| {
            if step > self.total_steps {
                return self.end_factor;
            }
            let remaining = 1.0 - progress(step, self.warmup_steps, self.total_steps);
            (1.0 - self.end_factor) * remaining.powf(self.power) + self.end_factor
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub num_cycles: f64,
    pub power: f64,
    pub base_lr: f64,
}

/// Create a learning rate scheduler
pub fn create_scheduler(kind: &str, opts: &SchedulerOptions) -> Result<Box<dyn LRScheduler>> {
    let SchedulerOptions {
        warmup_steps,
        total_steps,
        ..
    } = *opts;
    match kind {
        "constant" => Ok(Box::new(ConstantScheduler)),
        "constant_with_warmup" => Ok(Box::new(ConstantWithWarmupScheduler { warmup_steps })),
        "linear" => Ok(Box::new(LinearScheduler {
            warmup_steps,
            total_steps,
        })),
        "cosine" => Ok(Box::new(CosineScheduler {
            warmup_steps,
            total_steps,
        })),
        "cosine_with_restarts" => Ok(Box::new(CosineWithRestartsScheduler {
            warmup_steps,
            total_steps,
            num_cycles: opts.num_cycles,
        })),
        "polynomial" => {
            let end_factor = if opts.base_lr > 0.0 {
                (1e-7 / opts.base_lr).min(1.0)
            } else {
                0.0
            };
            Ok(Box::new(PolynomialScheduler {
                warmup_steps,
                total_steps,
                power: opts.power,
                end_factor,
            }))
        }
        other => Err(FinetuneError::config(format!(
            "unknown lr scheduler {} (expected one of {})",
            other,
            SCHEDULER_KINDS.join(", ")
        ))),
    }
}
