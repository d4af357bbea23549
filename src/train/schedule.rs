//! Learning-rate schedules applied at epoch boundaries.
//!
//! The default policy is multiplicative step decay:
//!
//! ```text
//! lr(e) = lr0 * factor ^ floor(e / interval)     // e = completed epochs
//! ```
//!
//! With the default `factor = 0.2` this divides the rate by five every
//! `interval` epochs.

use serde::{Deserialize, Serialize};

/// Learning rate to use once `completed_epochs` epochs have finished.
pub trait LrSchedule {
    fn lr(&self, initial_lr: f64, completed_epochs: usize) -> f64;

    fn name(&self) -> &str;
}

/// Multiply the rate by `factor` every `interval` epochs. `interval = 0`
/// keeps the initial rate for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepDecay {
    #[serde(default = "default_interval")]
    pub interval: usize,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for StepDecay {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            factor: default_factor(),
        }
    }
}

impl StepDecay {
    /// Whether a decay event happens at the end of `epoch` (1-based).
    pub fn decays_after(&self, epoch: usize) -> bool {
        self.interval > 0 && epoch > 0 && epoch % self.interval == 0
    }
}

impl LrSchedule for StepDecay {
    fn lr(&self, initial_lr: f64, completed_epochs: usize) -> f64 {
        if self.interval == 0 {
            return initial_lr;
        }
        initial_lr * self.factor.powi((completed_epochs / self.interval) as i32)
    }

    fn name(&self) -> &str {
        "step"
    }
}

fn default_interval() -> usize {
    4
}

fn default_factor() -> f64 {
    0.2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_divides_by_five() {
        let s = StepDecay::default();
        assert_eq!(s.lr(0.005, 0), 0.005);
        assert_eq!(s.lr(0.005, 3), 0.005);
        assert!((s.lr(0.005, 4) - 0.001).abs() < 1e-12);
        assert!((s.lr(0.005, 8) - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn decay_events() {
        let s = StepDecay {
            interval: 2,
            factor: 0.5,
        };
        let events: Vec<usize> = (1..=6).filter(|&e| s.decays_after(e)).collect();
        assert_eq!(events, vec![2, 4, 6]);
        let off = StepDecay {
            interval: 0,
            factor: 0.5,
        };
        assert!(!off.decays_after(4));
        assert_eq!(off.lr(1.0, 10), 1.0);
    }
}
