//! Contract of the simulation collaborator that evaluates a density field.
//!
//! Implementations typically wrap a finite-element solve. All quantities are the
//! calling worker's partition contributions unless stated otherwise; the optimizer
//! reduces them through a [`Reduction`](crate::reduction::Reduction).

use crate::error::{OptError, Result};

/// Scalars produced by one objective evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Evaluation {
    /// Partition-local objective contribution.
    pub objective: f64,
    /// Constraint value, identical on every worker. Zero means "satisfied".
    pub constraint: f64,
}

impl Evaluation {
    pub fn new(objective: f64, constraint: f64) -> Self {
        Self {
            objective,
            constraint,
        }
    }

    /// Evaluation of an unconstrained problem.
    pub fn objective_only(objective: f64) -> Self {
        Self::new(objective, 0.0)
    }
}

/// Evaluates objective, constraint and volume for a density field.
///
/// Gradient buffers have the length reported by [`num_opt_dofs`](Self::num_opt_dofs)
/// and are overwritten in full.
pub trait SimulationInterface {
    /// Number of design variables owned by this worker.
    fn num_opt_dofs(&self) -> usize;

    /// One-time push of the initial density field.
    fn initialize_topology(&mut self, densities: &[f64]) -> Result<()>;

    /// Local contribution to the volume of the fully dense design domain.
    fn total_volume(&mut self) -> Result<f64>;

    /// Local volume of the material described by `densities`.
    fn compute_volume(&mut self, densities: &[f64]) -> Result<f64>;

    /// Local volume plus its gradient with respect to every density.
    fn compute_volume_with_gradient(&mut self, densities: &[f64], gradient: &mut [f64])
        -> Result<f64>;

    /// Objective, its gradient and the constraint value.
    fn compute(&mut self, densities: &[f64], objective_gradient: &mut [f64]) -> Result<Evaluation>;

    /// Like [`compute`](Self::compute), additionally filling the constraint gradient.
    fn compute_with_constraint_gradient(
        &mut self,
        _densities: &[f64],
        _objective_gradient: &mut [f64],
        _constraint_gradient: &mut [f64],
    ) -> Result<Evaluation> {
        Err(OptError::simulation(
            "constraint gradients are not provided by this simulation",
        ))
    }
}

impl<S: SimulationInterface + ?Sized> SimulationInterface for Box<S> {
    fn num_opt_dofs(&self) -> usize {
        (**self).num_opt_dofs()
    }

    fn initialize_topology(&mut self, densities: &[f64]) -> Result<()> {
        (**self).initialize_topology(densities)
    }

    fn total_volume(&mut self) -> Result<f64> {
        (**self).total_volume()
    }

    fn compute_volume(&mut self, densities: &[f64]) -> Result<f64> {
        (**self).compute_volume(densities)
    }

    fn compute_volume_with_gradient(
        &mut self,
        densities: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64> {
        (**self).compute_volume_with_gradient(densities, gradient)
    }

    fn compute(&mut self, densities: &[f64], objective_gradient: &mut [f64]) -> Result<Evaluation> {
        (**self).compute(densities, objective_gradient)
    }

    fn compute_with_constraint_gradient(
        &mut self,
        densities: &[f64],
        objective_gradient: &mut [f64],
        constraint_gradient: &mut [f64],
    ) -> Result<Evaluation> {
        (**self).compute_with_constraint_gradient(densities, objective_gradient, constraint_gradient)
    }
}
