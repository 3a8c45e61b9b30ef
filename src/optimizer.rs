//! The optimality-criteria driver: evaluates the design, adapts the volume budget,
//! enforces the volume constraint and queries the convergence test until it stops.

use std::fmt;

use log::{info, warn};
use nalgebra::DVector;

use crate::budget::VolumeBudget;
use crate::convergence::{ConvergenceStatus, ConvergenceTest};
use crate::error::{OptError, Result};
use crate::options::{ConstraintGradientMode, OptimizerOptions, OptimizerPackage};
use crate::reduction::{global_diff_norm, global_norm, Reduction, SerialReduction};
use crate::simulation::SimulationInterface;
use crate::topology::Topology;
use crate::update::OcUpdate;
use crate::volume::{EnforcementSummary, Sensitivities, VolumeEnforcer};

/// Lifecycle of an optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerState {
    Uninitialized,
    Ready,
    Iterating,
    Converged,
    Failed,
}

impl OptimizerState {
    fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Iterating => "iterating",
            Self::Converged => "converged",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OptimizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the outer loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Converged,
    IterationLimit,
}

/// Current and previous iterate together with the gradients evaluated at `p`.
///
/// Allocated once by [`OcOptimizer::initialize`]; never resized afterwards.
#[derive(Clone, Debug)]
pub struct IterateSnapshot {
    pub p: DVector<f64>,
    pub p_last: DVector<f64>,
    /// Partition-local objective.
    pub f: f64,
    pub f_last: f64,
    /// Global constraint value.
    pub g: f64,
    pub g_last: f64,
    pub dfdp: DVector<f64>,
    /// Present only for [`ConstraintGradientMode::Adjoint`].
    pub dgdp: Option<DVector<f64>>,
    pub dvdp: DVector<f64>,
}

impl IterateSnapshot {
    fn new(n: usize, initial_value: f64, with_constraint_gradient: bool) -> Self {
        Self {
            p: DVector::from_element(n, initial_value),
            p_last: DVector::zeros(n),
            f: 0.0,
            f_last: 0.0,
            g: 0.0,
            g_last: 0.0,
            dfdp: DVector::zeros(n),
            dgdp: with_constraint_gradient.then(|| DVector::zeros(n)),
            dvdp: DVector::zeros(n),
        }
    }

    /// Number of design variables in this partition.
    pub fn len(&self) -> usize {
        self.p.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }
}

/// Diagnostics of one outer iteration.
#[derive(Clone, Debug)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Global objective evaluated at the start of the iteration.
    pub objective: f64,
    /// Global objective change from the previous iteration.
    pub delta_objective: f64,
    /// Global norm of the density change produced by this iteration.
    pub delta_density: f64,
    /// Constraint value reported by the simulation.
    pub constraint: f64,
    /// Volume fraction enforced in this iteration.
    pub volume_target: f64,
    pub enforcement: EnforcementSummary,
    pub status: ConvergenceStatus,
}

/// Outcome of [`OcOptimizer::optimize`].
#[derive(Clone, Debug)]
pub struct OptimizationResult {
    /// Number of outer iterations performed.
    pub iterations: usize,
    pub termination: Termination,
    /// Global objective at the last evaluated field.
    pub objective: f64,
    /// Final volume-fraction target.
    pub volume_target: f64,
    /// This worker's partition of the final density field.
    pub densities: DVector<f64>,
    pub history: Vec<IterationRecord>,
}

/// Driver contract shared by every optimization backend.
pub trait Optimizer<S: SimulationInterface> {
    /// Binds the simulation that evaluates density fields.
    fn bind(&mut self, simulation: S);

    /// Allocates the design field and pushes the initial densities to the simulation.
    fn initialize(&mut self) -> Result<()>;

    /// Runs the outer loop until the convergence test stops it.
    fn optimize(&mut self) -> Result<OptimizationResult>;

    fn state(&self) -> OptimizerState;
}

/// Optimality-criteria optimizer with an adaptive volume budget.
pub struct OcOptimizer<S, R = SerialReduction> {
    options: OptimizerOptions,
    topology: Topology,
    comm: R,
    simulation: Option<S>,
    convergence: ConvergenceTest,
    enforcer: VolumeEnforcer,
    budget: VolumeBudget,
    snapshot: Option<IterateSnapshot>,
    total_volume: f64,
    state: OptimizerState,
}

impl<S: SimulationInterface, R: Reduction> OcOptimizer<S, R> {
    /// Validates the configuration and assembles the driver; no simulation is bound yet.
    pub fn new(options: OptimizerOptions, topology: Topology, comm: R) -> Result<Self> {
        options.validate()?;
        topology.validate()?;

        let rule = OcUpdate::new(&topology, options.stabilization_exponent, options.move_limit);
        let enforcer = VolumeEnforcer::new(rule, &options.volume);
        let convergence = ConvergenceTest::from_options(&options.convergence);
        let budget = VolumeBudget::new(&options.volume, options.constraint.budget.clone());

        Ok(Self {
            options,
            topology,
            comm,
            simulation: None,
            convergence,
            enforcer,
            budget,
            snapshot: None,
            total_volume: 0.0,
            state: OptimizerState::Uninitialized,
        })
    }

    /// Builder-style variant of [`Optimizer::bind`].
    pub fn with_simulation(mut self, simulation: S) -> Self {
        self.simulation = Some(simulation);
        self
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn simulation(&self) -> Option<&S> {
        self.simulation.as_ref()
    }

    /// Releases the bound simulation, e.g. to inspect it after optimizing.
    pub fn into_simulation(self) -> Option<S> {
        self.simulation
    }

    pub fn snapshot(&self) -> Option<&IterateSnapshot> {
        self.snapshot.as_ref()
    }

    /// This worker's partition of the current density field.
    pub fn densities(&self) -> Option<&[f64]> {
        self.snapshot.as_ref().map(|snapshot| snapshot.p.as_slice())
    }

    pub fn volume_target(&self) -> f64 {
        self.budget.target()
    }

    /// Global volume of the fully dense design domain.
    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    fn require_state(&self, operation: &'static str, allowed: &[OptimizerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(OptError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn run(&mut self) -> Result<OptimizationResult> {
        let Self {
            options,
            comm,
            simulation,
            convergence,
            enforcer,
            budget,
            snapshot,
            total_volume,
            ..
        } = self;
        let simulation = simulation.as_mut().ok_or(OptError::UnboundInterface)?;
        let snapshot = snapshot.as_mut().ok_or(OptError::InvalidState {
            operation: "optimize",
            state: OptimizerState::Uninitialized.name(),
        })?;
        let comm: &R = comm;
        let total_volume = *total_volume;
        let gradient_mode = options.constraint.gradient_mode;
        let reporting = comm.is_reporting();

        evaluate(simulation, snapshot)?;
        snapshot.p_last.copy_from(&snapshot.p);
        enforce(enforcer, simulation, comm, snapshot, budget.target(), total_volume)?;

        let reference_objective = comm.sum_all(snapshot.f);
        let reference_norm = global_norm(comm, snapshot.p.as_slice());
        convergence.initialize(reference_objective, reference_norm);

        let mut history = Vec::new();
        let mut iteration = 0usize;
        loop {
            snapshot.f_last = snapshot.f;
            snapshot.g_last = snapshot.g;
            evaluate(simulation, snapshot)?;
            snapshot.p_last.copy_from(&snapshot.p);
            let objective = comm.sum_all(snapshot.f);

            if snapshot.g != 0.0 {
                let step = match gradient_mode {
                    ConstraintGradientMode::Adjoint => {
                        let sensitivity = probe_sensitivity(
                            enforcer,
                            simulation,
                            comm,
                            snapshot,
                            budget,
                            total_volume,
                        )?;
                        VolumeBudget::sensitivity_step(snapshot.g, sensitivity)
                    }
                    ConstraintGradientMode::None => {
                        budget.history_step(snapshot.g, snapshot.g_last)
                    }
                };
                budget.apply(step);
            }

            let volume_target = budget.target();
            let enforcement =
                enforce(enforcer, simulation, comm, snapshot, volume_target, total_volume)?;

            if reporting {
                info!(
                    "optimization status (iteration {iteration}): objective = {objective}, \
                     constraint = {}, volume target = {volume_target}",
                    snapshot.g
                );
            }

            let delta_objective = comm.sum_all(snapshot.f - snapshot.f_last);
            let delta_density =
                global_diff_norm(comm, snapshot.p.as_slice(), snapshot.p_last.as_slice());
            let status =
                convergence.evaluate(delta_objective, delta_density, iteration, reporting);

            history.push(IterationRecord {
                iteration,
                objective,
                delta_objective,
                delta_density,
                constraint: snapshot.g,
                volume_target,
                enforcement,
                status,
            });
            iteration += 1;

            let termination = match status {
                ConvergenceStatus::Continue => continue,
                ConvergenceStatus::Converged => Termination::Converged,
                ConvergenceStatus::IterationLimit => Termination::IterationLimit,
            };

            return Ok(OptimizationResult {
                iterations: iteration,
                termination,
                objective,
                volume_target,
                densities: snapshot.p.clone(),
                history,
            });
        }
    }
}

impl<S: SimulationInterface, R: Reduction> Optimizer<S> for OcOptimizer<S, R> {
    fn bind(&mut self, simulation: S) {
        self.simulation = Some(simulation);
    }

    fn initialize(&mut self) -> Result<()> {
        self.require_state("initialize", &[OptimizerState::Uninitialized])?;
        let simulation = self
            .simulation
            .as_mut()
            .ok_or(OptError::UnboundInterface)?;

        let n = simulation.num_opt_dofs();
        let with_constraint_gradient =
            self.options.constraint.gradient_mode == ConstraintGradientMode::Adjoint;
        let snapshot = IterateSnapshot::new(n, self.topology.initial_value, with_constraint_gradient);

        let local_volume = simulation.total_volume()?;
        let total_volume = self.comm.sum_all(local_volume);
        if !(total_volume > 0.0) || !total_volume.is_finite() {
            return Err(OptError::NumericalError {
                context: "total design volume",
            });
        }
        simulation.initialize_topology(snapshot.p.as_slice())?;

        self.total_volume = total_volume;
        self.snapshot = Some(snapshot);
        self.state = OptimizerState::Ready;
        Ok(())
    }

    fn optimize(&mut self) -> Result<OptimizationResult> {
        if self.simulation.is_none() {
            return Err(OptError::UnboundInterface);
        }
        self.require_state("optimize", &[OptimizerState::Ready])?;

        self.state = OptimizerState::Iterating;
        match self.run() {
            Ok(result) => {
                self.state = OptimizerState::Converged;
                if result.termination == Termination::IterationLimit && self.comm.is_reporting() {
                    warn!("optimizer stopped at the iteration limit without converging");
                }
                Ok(result)
            }
            Err(error) => {
                self.state = OptimizerState::Failed;
                Err(error)
            }
        }
    }

    fn state(&self) -> OptimizerState {
        self.state
    }
}

/// Evaluates objective, constraint and volume gradients at the current field.
fn evaluate<S: SimulationInterface>(simulation: &mut S, snapshot: &mut IterateSnapshot) -> Result<()> {
    let IterateSnapshot {
        p, dfdp, dgdp, dvdp, ..
    } = &mut *snapshot;
    let evaluation = match dgdp {
        Some(dgdp) => simulation.compute_with_constraint_gradient(
            p.as_slice(),
            dfdp.as_mut_slice(),
            dgdp.as_mut_slice(),
        )?,
        None => simulation.compute(p.as_slice(), dfdp.as_mut_slice())?,
    };
    simulation.compute_volume_with_gradient(p.as_slice(), dvdp.as_mut_slice())?;

    snapshot.f = evaluation.objective;
    snapshot.g = evaluation.constraint;
    Ok(())
}

/// Runs the volume enforcer from `p_last` and writes the result into `p`.
fn enforce<S: SimulationInterface, R: Reduction>(
    enforcer: &VolumeEnforcer,
    simulation: &mut S,
    comm: &R,
    snapshot: &mut IterateSnapshot,
    target: f64,
    total_volume: f64,
) -> Result<EnforcementSummary> {
    let sensitivities = Sensitivities {
        p_last: snapshot.p_last.as_slice(),
        dfdp: snapshot.dfdp.as_slice(),
        dvdp: snapshot.dvdp.as_slice(),
    };
    enforcer.enforce(
        simulation,
        comm,
        sensitivities,
        target,
        total_volume,
        snapshot.p.as_mut_slice(),
    )
}

/// Finite-difference `dg/dv`: enforce a slightly larger target and project the
/// resulting density change onto the constraint gradient.
fn probe_sensitivity<S: SimulationInterface, R: Reduction>(
    enforcer: &VolumeEnforcer,
    simulation: &mut S,
    comm: &R,
    snapshot: &mut IterateSnapshot,
    budget: &VolumeBudget,
    total_volume: f64,
) -> Result<f64> {
    enforce(
        enforcer,
        simulation,
        comm,
        snapshot,
        budget.probe_target(),
        total_volume,
    )?;

    let dgdp = snapshot.dgdp.as_ref().ok_or(OptError::NumericalError {
        context: "constraint gradient probe",
    })?;
    let local: f64 = dgdp
        .iter()
        .zip(snapshot.p.iter().zip(snapshot.p_last.iter()))
        .map(|(dg, (p, p_last))| dg * (p - p_last))
        .sum();
    Ok(comm.sum_all(local) / budget.probe_step())
}

/// Builds optimizers by package name.
#[derive(Debug)]
pub struct OptimizerFactory;

impl OptimizerFactory {
    /// Creates the optimizer selected by `options.package`.
    pub fn create<S, R>(
        options: OptimizerOptions,
        topology: Topology,
        comm: R,
    ) -> Result<Box<dyn Optimizer<S>>>
    where
        S: SimulationInterface + 'static,
        R: Reduction + 'static,
    {
        match options.package {
            OptimizerPackage::Oc => Ok(Box::new(OcOptimizer::new(options, topology, comm)?)),
        }
    }

    /// Like [`create`](Self::create), selecting the package by its configured name.
    pub fn create_named<S, R>(
        package: &str,
        mut options: OptimizerOptions,
        topology: Topology,
        comm: R,
    ) -> Result<Box<dyn Optimizer<S>>>
    where
        S: SimulationInterface + 'static,
        R: Reduction + 'static,
    {
        options.package = package.parse()?;
        Self::create(options, topology, comm)
    }
}
