//! Adaptive volume budget: moves the volume-fraction target so that the external
//! constraint is driven towards zero.

use crate::options::{BudgetOptions, VolumeOptions};
use crate::window::RunningWindow;

/// Volume-fraction target plus the state of its corrective controller.
#[derive(Clone, Debug)]
pub struct VolumeBudget {
    target: f64,
    previous_target: f64,
    min_fraction: f64,
    max_fraction: f64,
    options: BudgetOptions,
    sensitivities: RunningWindow,
}

impl VolumeBudget {
    pub fn new(volume: &VolumeOptions, options: BudgetOptions) -> Self {
        let sensitivities = RunningWindow::new(options.history_length);
        Self {
            target: volume.target_fraction,
            previous_target: volume.target_fraction,
            min_fraction: volume.min_fraction,
            max_fraction: volume.max_fraction,
            options,
            sensitivities,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Target before the most recent correction.
    pub fn previous_target(&self) -> f64 {
        self.previous_target
    }

    /// Target used by the finite-difference probe.
    pub fn probe_target(&self) -> f64 {
        self.target + self.options.probe_step
    }

    pub fn probe_step(&self) -> f64 {
        self.options.probe_step
    }

    /// Sensitivity samples currently averaged by [`history_step`](Self::history_step).
    pub fn history(&self) -> &RunningWindow {
        &self.sensitivities
    }

    /// Corrective step from a known sensitivity `dg/dv`.
    pub fn sensitivity_step(constraint: f64, sensitivity: f64) -> f64 {
        -constraint / sensitivity
    }

    /// Corrective step from the empirical `Δg/Δv` history.
    ///
    /// A sample is recorded only when the previous correction moved the target;
    /// otherwise the configured fallback step is returned.
    pub fn history_step(&mut self, constraint: f64, previous_constraint: f64) -> f64 {
        let delta_target = self.target - self.previous_target;
        if delta_target == 0.0 {
            return self.options.fallback_step;
        }
        self.sensitivities
            .push((constraint - previous_constraint) / delta_target);
        match self.sensitivities.mean() {
            Some(sensitivity) => Self::sensitivity_step(constraint, sensitivity),
            None => self.options.fallback_step,
        }
    }

    /// Applies `step`, limited to a fraction of the current target, and clamps the result
    /// into the admissible fraction range. Returns the new target.
    pub fn apply(&mut self, step: f64) -> f64 {
        let limit = self.options.max_relative_step * self.target;
        let step = if step.is_nan() {
            0.0
        } else if step.abs() > limit {
            step.signum() * limit
        } else {
            step
        };

        self.previous_target = self.target;
        self.target = (self.target + step).clamp(self.min_fraction, self.max_fraction);
        self.target
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn budget(target: f64) -> VolumeBudget {
        VolumeBudget::new(
            &VolumeOptions::new(target, 1e-6, 50),
            BudgetOptions::default(),
        )
    }

    #[test]
    fn steps_are_limited_to_ten_percent_of_target() {
        let mut budget = budget(0.5);
        assert_relative_eq!(budget.apply(1.0), 0.55, epsilon = 1e-15);
        assert_relative_eq!(budget.previous_target(), 0.5);
        assert_relative_eq!(budget.apply(f64::NEG_INFINITY), 0.495, epsilon = 1e-15);
        assert_relative_eq!(budget.apply(0.001), 0.496, epsilon = 1e-15);
    }

    #[test]
    fn target_is_clamped_into_fraction_range() {
        let mut budget = VolumeBudget::new(
            &VolumeOptions::new(0.12, 1e-6, 50).with_fraction_bounds(0.11, 0.9),
            BudgetOptions::default(),
        );
        assert_relative_eq!(budget.apply(-1.0), 0.11);
        assert_eq!(budget.apply(f64::NAN), 0.11);
    }

    #[test]
    fn history_uses_fallback_until_target_moves() {
        let mut budget = budget(0.4);
        assert_eq!(budget.history_step(0.2, 0.0), 1e-3);
        assert!(budget.history().is_empty());

        budget.apply(0.01);
        // dg/dv = (0.1 - 0.2) / 0.01 = -10, so the step is -0.1 / -10 = 0.01.
        let step = budget.history_step(0.1, 0.2);
        assert_relative_eq!(step, 0.01, epsilon = 1e-12);
        assert_eq!(budget.history().len(), 1);
    }

    #[test]
    fn history_window_is_bounded() {
        let mut budget = VolumeBudget::new(
            &VolumeOptions::new(0.5, 1e-6, 50),
            BudgetOptions {
                history_length: 3,
                ..BudgetOptions::default()
            },
        );
        for k in 0..6 {
            budget.apply(0.01);
            budget.history_step(k as f64, 0.0);
        }
        assert_eq!(budget.history().len(), 3);
    }
}
