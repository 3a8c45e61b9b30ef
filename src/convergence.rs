//! Composable stopping rules for the outer optimization loop.

use log::{debug, info, warn};

use crate::options::{ComboType, ConvergenceOptions};
use crate::window::RunningWindow;

/// A single stopping criterion.
///
/// Relative variants normalize by the reference captured in
/// [`initialize`](Self::initialize) and never pass while that reference is zero.
#[derive(Clone, Debug)]
pub enum ConvergenceCriterion {
    /// `|Δp| < threshold`.
    AbsoluteTopologyChange { threshold: f64 },
    /// `|Δp / p0| < threshold`.
    RelativeTopologyChange { threshold: f64, reference: f64 },
    /// `|Δf| < threshold`.
    AbsoluteObjectiveChange { threshold: f64 },
    /// `|Δf / f0| < threshold`.
    RelativeObjectiveChange { threshold: f64, reference: f64 },
    /// Sum of the last `window` objective changes `< threshold`.
    AbsoluteRunningAverage {
        threshold: f64,
        window: RunningWindow,
    },
    /// `|Σ Δf / f0| / count < threshold` over the last `window` objective changes.
    RelativeRunningAverage {
        threshold: f64,
        reference: f64,
        window: RunningWindow,
    },
}

impl ConvergenceCriterion {
    pub fn absolute_topology_change(threshold: f64) -> Self {
        Self::AbsoluteTopologyChange { threshold }
    }

    pub fn relative_topology_change(threshold: f64) -> Self {
        Self::RelativeTopologyChange {
            threshold,
            reference: 0.0,
        }
    }

    pub fn absolute_objective_change(threshold: f64) -> Self {
        Self::AbsoluteObjectiveChange { threshold }
    }

    pub fn relative_objective_change(threshold: f64) -> Self {
        Self::RelativeObjectiveChange {
            threshold,
            reference: 0.0,
        }
    }

    pub fn absolute_running_average(threshold: f64, window: usize) -> Self {
        Self::AbsoluteRunningAverage {
            threshold,
            window: RunningWindow::new(window),
        }
    }

    pub fn relative_running_average(threshold: f64, window: usize) -> Self {
        Self::RelativeRunningAverage {
            threshold,
            reference: 0.0,
            window: RunningWindow::new(window),
        }
    }

    /// Human-readable name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AbsoluteTopologyChange { .. } => "Topology Change (Absolute)",
            Self::RelativeTopologyChange { .. } => "Topology Change (Relative)",
            Self::AbsoluteObjectiveChange { .. } => "Objective Change (Absolute)",
            Self::RelativeObjectiveChange { .. } => "Objective Change (Relative)",
            Self::AbsoluteRunningAverage { .. } => "Objective Change Running Average (Absolute)",
            Self::RelativeRunningAverage { .. } => "Objective Change Running Average (Relative)",
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            Self::AbsoluteTopologyChange { threshold }
            | Self::RelativeTopologyChange { threshold, .. }
            | Self::AbsoluteObjectiveChange { threshold }
            | Self::RelativeObjectiveChange { threshold, .. }
            | Self::AbsoluteRunningAverage { threshold, .. }
            | Self::RelativeRunningAverage { threshold, .. } => *threshold,
        }
    }

    /// Running sum of the retained objective changes, for the running-average variants.
    pub fn running_sum(&self) -> Option<f64> {
        match self {
            Self::AbsoluteRunningAverage { window, .. }
            | Self::RelativeRunningAverage { window, .. } => Some(window.sum()),
            _ => None,
        }
    }

    /// Seeds the reference objective and density norm.
    pub fn initialize(&mut self, objective: f64, density_norm: f64) {
        match self {
            Self::RelativeTopologyChange { reference, .. } => *reference = density_norm,
            Self::RelativeObjectiveChange { reference, .. }
            | Self::RelativeRunningAverage { reference, .. } => *reference = objective,
            _ => {}
        }
    }

    /// Tests the criterion against the latest changes; running variants record `delta_f`.
    pub fn passed(&mut self, delta_f: f64, delta_p: f64, report: bool) -> bool {
        let name = self.name();
        match self {
            Self::AbsoluteTopologyChange { threshold } => {
                let status = delta_p.abs() < *threshold;
                if report {
                    debug!("{name}: |dp| = {:e} < {threshold:e}: {status}", delta_p.abs());
                }
                status
            }
            Self::RelativeTopologyChange {
                threshold,
                reference,
            } => {
                let ratio = (delta_p / *reference).abs();
                let status = *reference != 0.0 && ratio < *threshold;
                if report {
                    debug!(
                        "{name}: |dp| = {:e}, |dp/p0| = {ratio:e} < {threshold:e}: {status}",
                        delta_p.abs()
                    );
                }
                status
            }
            Self::AbsoluteObjectiveChange { threshold } => {
                let status = delta_f.abs() < *threshold;
                if report {
                    debug!("{name}: |df| = {:e} < {threshold:e}: {status}", delta_f.abs());
                }
                status
            }
            Self::RelativeObjectiveChange {
                threshold,
                reference,
            } => {
                let ratio = (delta_f / *reference).abs();
                let status = *reference != 0.0 && ratio < *threshold;
                if report {
                    debug!(
                        "{name}: |df| = {:e}, |df/f0| = {ratio:e} < {threshold:e}: {status}",
                        delta_f.abs()
                    );
                }
                status
            }
            Self::AbsoluteRunningAverage { threshold, window } => {
                window.push(delta_f);
                let running = window.sum();
                let status = running < *threshold;
                if report {
                    debug!("{name}: <df> = {running:e} < {threshold:e}: {status}");
                }
                status
            }
            Self::RelativeRunningAverage {
                threshold,
                reference,
                window,
            } => {
                window.push(delta_f);
                let count = window.len() as f64;
                let relative = (window.sum() / *reference).abs() / count;
                let status = *reference != 0.0 && relative < *threshold;
                if report {
                    debug!(
                        "{name}: |<df>| = {:e}, |<df/f0>| = {relative:e} < {threshold:e}: {status}",
                        window.sum().abs() / count
                    );
                }
                status
            }
        }
    }
}

/// Outcome of one convergence query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Keep iterating.
    Continue,
    /// The combined criteria passed at or after the minimum iteration count.
    Converged,
    /// The criteria failed but the iteration cap was reached.
    IterationLimit,
}

impl ConvergenceStatus {
    /// `true` for both genuine convergence and iteration-limit termination.
    pub fn should_stop(self) -> bool {
        !matches!(self, Self::Continue)
    }

    pub fn is_iteration_limit(self) -> bool {
        matches!(self, Self::IterationLimit)
    }
}

/// Ordered collection of criteria with iteration bounds and a combination rule.
#[derive(Clone, Debug)]
pub struct ConvergenceTest {
    criteria: Vec<ConvergenceCriterion>,
    combo_type: ComboType,
    min_iterations: usize,
    max_iterations: usize,
    verbose: bool,
}

impl ConvergenceTest {
    /// Creates an engine without criteria.
    pub fn new(combo_type: ComboType, min_iterations: usize, max_iterations: usize) -> Self {
        Self {
            criteria: Vec::new(),
            combo_type,
            min_iterations,
            max_iterations,
            verbose: true,
        }
    }

    /// Builds the engine from validated options; enabled criteria keep a fixed order.
    pub fn from_options(options: &ConvergenceOptions) -> Self {
        let window = options.running_average_window;
        let enabled = [
            options
                .relative_topology_change
                .map(ConvergenceCriterion::relative_topology_change),
            options
                .absolute_topology_change
                .map(ConvergenceCriterion::absolute_topology_change),
            options
                .relative_objective_change
                .map(ConvergenceCriterion::relative_objective_change),
            options
                .absolute_objective_change
                .map(ConvergenceCriterion::absolute_objective_change),
            options
                .relative_running_average_change
                .map(|threshold| ConvergenceCriterion::relative_running_average(threshold, window)),
            options
                .absolute_running_average_change
                .map(|threshold| ConvergenceCriterion::absolute_running_average(threshold, window)),
        ];

        let mut test = Self::new(
            options.combo_type,
            options.min_iterations,
            options.max_iterations,
        )
        .with_verbose(options.verbose);
        test.criteria.extend(enabled.into_iter().flatten());
        test
    }

    pub fn with_criterion(mut self, criterion: ConvergenceCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn criteria(&self) -> &[ConvergenceCriterion] {
        &self.criteria
    }

    pub fn combo_type(&self) -> ComboType {
        self.combo_type
    }

    pub fn min_iterations(&self) -> usize {
        self.min_iterations
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Seeds every criterion with the reference objective and density norm.
    pub fn initialize(&mut self, objective: f64, density_norm: f64) {
        for criterion in &mut self.criteria {
            criterion.initialize(objective, density_norm);
        }
    }

    /// Evaluates all criteria for `iteration`; `report` enables logging on this worker.
    ///
    /// Iteration `0` never converges and does not touch the criteria.
    pub fn evaluate(
        &mut self,
        delta_f: f64,
        delta_p: f64,
        iteration: usize,
        report: bool,
    ) -> ConvergenceStatus {
        if iteration == 0 {
            return ConvergenceStatus::Continue;
        }

        let write = report && self.verbose;
        // Every criterion is evaluated so that running windows keep recording.
        let results: Vec<bool> = self
            .criteria
            .iter_mut()
            .map(|criterion| criterion.passed(delta_f, delta_p, write))
            .collect();

        let mut converged = match self.combo_type {
            ComboType::And => results.iter().all(|&passed| passed),
            ComboType::Or => results.iter().any(|&passed| passed),
        };

        if report {
            if converged && iteration < self.min_iterations {
                info!(
                    "converged, but continuing until {} iterations are reached",
                    self.min_iterations
                );
            } else if converged {
                info!("converged at iteration {iteration}");
            } else {
                debug!("not converged at iteration {iteration}");
            }
        }

        if iteration < self.min_iterations {
            converged = false;
        }

        if converged {
            ConvergenceStatus::Converged
        } else if iteration >= self.max_iterations {
            if report {
                warn!("not converged; exiting due to iteration limit ({iteration})");
            }
            ConvergenceStatus::IterationLimit
        } else {
            ConvergenceStatus::Continue
        }
    }

    /// Boolean form of [`evaluate`](Self::evaluate): `true` means stop.
    pub fn is_converged(&mut self, delta_f: f64, delta_p: f64, iteration: usize, report: bool) -> bool {
        self.evaluate(delta_f, delta_p, iteration, report).should_stop()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn and_test() -> ConvergenceTest {
        ConvergenceTest::new(ComboType::And, 0, 100)
            .with_criterion(ConvergenceCriterion::absolute_objective_change(1e-3))
            .with_criterion(ConvergenceCriterion::absolute_topology_change(1e-2))
    }

    #[test]
    fn iteration_zero_never_converges() {
        let mut test = ConvergenceTest::new(ComboType::Or, 0, 0)
            .with_criterion(ConvergenceCriterion::absolute_objective_change(10.0));
        test.initialize(1.0, 1.0);
        assert_eq!(test.evaluate(0.0, 0.0, 0, false), ConvergenceStatus::Continue);
    }

    #[test]
    fn and_combination_requires_every_criterion() {
        let mut test = and_test();
        test.initialize(1.0, 1.0);
        assert_eq!(test.evaluate(1e-4, 1.0, 1, false), ConvergenceStatus::Continue);
        assert_eq!(test.evaluate(1.0, 1e-3, 2, false), ConvergenceStatus::Continue);
        assert_eq!(test.evaluate(1e-4, 1e-3, 3, false), ConvergenceStatus::Converged);
    }

    #[test]
    fn or_combination_accepts_any_criterion() {
        let mut test = ConvergenceTest::new(ComboType::Or, 0, 100)
            .with_criterion(ConvergenceCriterion::absolute_objective_change(1e-3))
            .with_criterion(ConvergenceCriterion::absolute_topology_change(1e-2));
        assert_eq!(test.evaluate(1.0, 1.0, 1, false), ConvergenceStatus::Continue);
        assert_eq!(test.evaluate(1.0, 1e-3, 2, false), ConvergenceStatus::Converged);
    }

    #[test]
    fn minimum_iterations_suppress_convergence() {
        let mut test = and_test();
        test.min_iterations = 5;
        assert_eq!(test.evaluate(0.0, 0.0, 4, false), ConvergenceStatus::Continue);
        assert_eq!(test.evaluate(0.0, 0.0, 5, false), ConvergenceStatus::Converged);
    }

    #[test]
    fn iteration_limit_forces_termination() {
        let mut test = and_test();
        test.max_iterations = 7;
        assert_eq!(test.evaluate(1.0, 1.0, 6, false), ConvergenceStatus::Continue);
        let status = test.evaluate(1.0, 1.0, 7, false);
        assert_eq!(status, ConvergenceStatus::IterationLimit);
        assert!(status.should_stop());
        assert!(test.is_converged(1.0, 1.0, 8, false));
    }

    #[test]
    fn relative_criteria_fail_on_zero_reference() {
        let mut test = ConvergenceTest::new(ComboType::Or, 0, 100)
            .with_criterion(ConvergenceCriterion::relative_objective_change(0.5))
            .with_criterion(ConvergenceCriterion::relative_topology_change(0.5))
            .with_criterion(ConvergenceCriterion::relative_running_average(0.5, 10));
        test.initialize(0.0, 0.0);
        assert_eq!(test.evaluate(0.0, 0.0, 1, true), ConvergenceStatus::Continue);

        test.initialize(2.0, 4.0);
        assert_eq!(test.evaluate(10.0, 1.0, 2, false), ConvergenceStatus::Converged);
    }

    #[test]
    fn running_sum_is_bounded_by_window() {
        let mut criterion = ConvergenceCriterion::absolute_running_average(-9.5, 10);
        let mut outcomes = Vec::new();
        for _ in 0..15 {
            outcomes.push(criterion.passed(-1.0, 0.0, false));
        }
        assert_eq!(criterion.running_sum(), Some(-10.0));
        // The sum only drops below -9.5 once ten samples are present.
        assert_eq!(outcomes.iter().position(|&passed| passed), Some(9));
    }

    #[test]
    fn relative_running_average_normalizes_by_window_count() {
        let mut criterion = ConvergenceCriterion::relative_running_average(0.3, 3);
        criterion.initialize(-4.0, 1.0);
        let outcomes: Vec<bool> = [-2.0, -1.0, 0.5, 0.0]
            .into_iter()
            .map(|delta_f| criterion.passed(delta_f, 0.0, false))
            .collect();
        // 0.5, 0.375, 0.2083 and, after evicting -2.0, 0.0417.
        assert_eq!(outcomes, vec![false, false, true, true]);
        assert_eq!(criterion.running_sum(), Some(-0.5));
    }

    #[test]
    fn from_options_enables_configured_criteria_in_order() {
        let options = ConvergenceOptions::new(30)
            .with_absolute_objective_change(1e-6)
            .with_relative_topology_change(1e-3)
            .with_absolute_running_average_change(1e-4);
        let test = ConvergenceTest::from_options(&options);

        let names: Vec<_> = test.criteria().iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "Topology Change (Relative)",
                "Objective Change (Absolute)",
                "Objective Change Running Average (Absolute)",
            ]
        );
        assert_relative_eq!(test.criteria()[1].threshold(), 1e-6);
        assert_eq!(test.max_iterations(), 30);
    }
}
