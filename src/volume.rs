//! Volume enforcement: the multiplier search that makes the updated density field meet
//! a target volume fraction.
//!
//! The search runs in up to three phases. Bisection first brackets the multiplier;
//! with Newton refinement enabled it stops as soon as the residual turns positive
//! and hands the bracket to a secant iteration whose derivative is estimated with a
//! perturbed multiplier. If the secant iteration stalls, bisection resumes on the
//! same bracket with a fresh iteration budget. Whatever phase finishes, its final
//! residual must lie within the acceptance tolerance.

use std::fmt;

use log::{debug, info, warn};

use crate::error::{OptError, Result};
use crate::options::VolumeOptions;
use crate::reduction::{global_sum, Reduction};
use crate::simulation::SimulationInterface;
use crate::update::OcUpdate;

/// Extra iterations granted to the Newton phase beyond those already spent bracketing.
const NEWTON_EXTRA_ITERATIONS: usize = 10;
/// Relative perturbation of the multiplier used for the finite-difference derivative.
const NEWTON_PERTURBATION: f64 = 1e-5;
/// Factor applied to `-Σdfdp/Σdvdp` to form the initial upper multiplier bound.
const INITIAL_BRACKET_SCALE: f64 = 10.0;

/// Read-only inputs of one enforcement: the previous field and the current gradients.
#[derive(Clone, Copy, Debug)]
pub struct Sensitivities<'a> {
    pub p_last: &'a [f64],
    pub dfdp: &'a [f64],
    pub dvdp: &'a [f64],
}

/// Phase in which the multiplier search finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchPhase {
    Bisection,
    Newton,
    FallbackBisection,
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bisection => f.write_str("bisection"),
            Self::Newton => f.write_str("newton"),
            Self::FallbackBisection => f.write_str("fallback bisection"),
        }
    }
}

/// Diagnostics returned alongside the enforced density field.
#[derive(Clone, Debug, PartialEq)]
pub struct EnforcementSummary {
    /// Multiplier of the last trial update.
    pub multiplier: f64,
    /// Global volume of the final field.
    pub volume: f64,
    /// `volume - target * total_volume` of the final field.
    pub residual: f64,
    /// Iterations spent in the final phase, counted the way its budget is counted.
    pub iterations: usize,
    pub phase: SearchPhase,
}

impl EnforcementSummary {
    /// Residual normalized by the total design volume.
    pub fn relative_residual(&self, total_volume: f64) -> f64 {
        self.residual / total_volume
    }
}

/// Searches the multiplier that enforces the volume constraint.
#[derive(Clone, Debug)]
pub struct VolumeEnforcer {
    rule: OcUpdate,
    convergence_tolerance: f64,
    accept_tolerance: f64,
    max_iterations: usize,
    use_newton_search: bool,
}

/// One trial evaluation: applies the update for a multiplier and measures the volume.
struct Trial<'a, S: ?Sized, R: ?Sized> {
    rule: &'a OcUpdate,
    simulation: &'a mut S,
    comm: &'a R,
    sensitivities: Sensitivities<'a>,
    p: &'a mut [f64],
    goal: f64,
    volume: f64,
}

impl<S: SimulationInterface + ?Sized, R: Reduction + ?Sized> Trial<'_, S, R> {
    fn residual(&mut self, multiplier: f64) -> Result<f64> {
        let Sensitivities { p_last, dfdp, dvdp } = self.sensitivities;
        self.rule.apply(p_last, dfdp, dvdp, multiplier, self.p)?;
        let local = self.simulation.compute_volume(self.p)?;
        self.volume = self.comm.sum_all(local);
        Ok(self.volume - self.goal)
    }
}

impl VolumeEnforcer {
    pub fn new(rule: OcUpdate, options: &VolumeOptions) -> Self {
        Self {
            rule,
            convergence_tolerance: options.convergence_tolerance,
            accept_tolerance: options.accept_tolerance,
            max_iterations: options.max_iterations,
            use_newton_search: options.use_newton_search,
        }
    }

    /// Writes into `p` a field whose global volume matches `target * total_volume`.
    ///
    /// Fails with [`OptError::VolumeEnforcementFailed`] when the final residual exceeds
    /// the acceptance tolerance.
    pub fn enforce<S, R>(
        &self,
        simulation: &mut S,
        comm: &R,
        sensitivities: Sensitivities<'_>,
        target: f64,
        total_volume: f64,
        p: &mut [f64],
    ) -> Result<EnforcementSummary>
    where
        S: SimulationInterface + ?Sized,
        R: Reduction + ?Sized,
    {
        let reporting = comm.is_reporting();
        let goal = target * total_volume;
        let tolerance = self.convergence_tolerance * total_volume;

        let dfdp_total = global_sum(comm, sensitivities.dfdp);
        let dvdp_total = global_sum(comm, sensitivities.dvdp);
        let mut lower = 0.0_f64;
        let mut upper = -INITIAL_BRACKET_SCALE * dfdp_total / dvdp_total;
        if !upper.is_finite() {
            return Err(OptError::NumericalError {
                context: "initial multiplier bracket",
            });
        }
        // The field at the upper bound is assumed empty until a trial says otherwise.
        let mut upper_residual = -goal;

        if reporting {
            info!("volume enforcement: target = {target}; beginning bisection search");
        }

        let mut trial = Trial {
            rule: &self.rule,
            simulation,
            comm,
            sensitivities,
            p,
            goal,
            volume: 0.0,
        };

        let mut iterations = 0usize;
        let mut multiplier;
        let mut residual;
        let mut bracket_ratio = None;
        loop {
            multiplier = 0.5 * (lower + upper);
            residual = trial.residual(multiplier)?;
            iterations += 1;
            if reporting {
                debug!(
                    "volume enforcement (iteration {iterations}): residual = {:e}",
                    residual / total_volume
                );
            }

            if residual > 0.0 {
                lower = multiplier;
                if self.use_newton_search && residual.abs() >= tolerance {
                    bracket_ratio = Some(residual / upper_residual);
                    break;
                }
            } else {
                upper = multiplier;
                upper_residual = residual;
            }

            if residual.abs() < tolerance || iterations >= self.max_iterations {
                break;
            }
        }

        let mut phase = SearchPhase::Bisection;
        if let Some(ratio) = bracket_ratio {
            if reporting {
                info!("volume enforcement: bounds found; switching to Newton search");
            }

            let budget = iterations + NEWTON_EXTRA_ITERATIONS;
            let mut lambda = (ratio * upper - lower) / (ratio - 1.0);
            let epsilon = lambda * NEWTON_PERTURBATION;
            let mut converged = false;

            // The secant estimate must share the sign of the bracket.
            while lambda.is_finite() && lambda * upper > 0.0 {
                let f0 = trial.residual(lambda)?;
                multiplier = lambda;
                residual = f0;
                if reporting {
                    debug!(
                        "volume enforcement (iteration {iterations}): residual = {:e}",
                        f0 / total_volume
                    );
                }
                if f0.abs() < tolerance {
                    converged = true;
                    break;
                }

                let f1 = trial.residual(lambda + epsilon)?;
                if f1 - f0 == 0.0 {
                    break;
                }
                lambda -= epsilon * f0 / (f1 - f0);

                iterations += 1;
                if iterations >= budget {
                    break;
                }
            }

            if converged {
                phase = SearchPhase::Newton;
            } else {
                if reporting {
                    warn!("volume enforcement: Newton search failed; switching back to bisection");
                }
                phase = SearchPhase::FallbackBisection;
                iterations = 0;
                loop {
                    multiplier = 0.5 * (lower + upper);
                    residual = trial.residual(multiplier)?;
                    if residual > 0.0 {
                        lower = multiplier;
                    } else {
                        upper = multiplier;
                    }
                    iterations += 1;
                    if reporting {
                        debug!(
                            "volume enforcement (iteration {iterations}): residual = {:e}",
                            residual / total_volume
                        );
                    }
                    if residual.abs() < tolerance || iterations >= self.max_iterations {
                        break;
                    }
                }
            }
        }

        let volume = trial.volume;
        if residual.abs() > self.accept_tolerance * total_volume {
            return Err(OptError::VolumeEnforcementFailed {
                target,
                residual: residual / total_volume,
                tolerance: self.accept_tolerance,
                iterations,
            });
        }

        Ok(EnforcementSummary {
            multiplier,
            volume,
            residual,
            iterations,
            phase,
        })
    }
}
