use std::thread;

use approx::assert_relative_eq;
use octopo::optimizer::{OcOptimizer, Optimizer, OptimizerState, Termination};
use octopo::options::{
    ConstraintGradientMode, ConvergenceOptions, OptimizerConfig, OptimizerOptions, VolumeOptions,
};
use octopo::reduction::{Reduction, SerialReduction, ThreadGroup};
use octopo::simulation::{Evaluation, SimulationInterface};
use octopo::topology::Topology;
use octopo::Result;

/// Unit-volume cells with a compliance-like objective `Σ c_i / p_i`.
///
/// With `volume_limit` set, the constraint is `Σ p_i - limit * n` over the cells this
/// worker owns, which is the global value when a single worker runs.
struct Cells {
    weights: Vec<f64>,
    volume_limit: Option<f64>,
}

impl Cells {
    fn new(weights: Vec<f64>) -> Self {
        Self {
            weights,
            volume_limit: None,
        }
    }

    fn with_volume_limit(mut self, limit: f64) -> Self {
        self.volume_limit = Some(limit);
        self
    }

    fn evaluate(&self, densities: &[f64], gradient: &mut [f64]) -> Evaluation {
        let mut objective = 0.0;
        for ((g, c), p) in gradient.iter_mut().zip(&self.weights).zip(densities) {
            objective += c / p;
            *g = -c / (p * p);
        }
        let constraint = self.volume_limit.map_or(0.0, |limit| {
            densities.iter().sum::<f64>() - limit * self.weights.len() as f64
        });
        Evaluation::new(objective, constraint)
    }
}

impl SimulationInterface for Cells {
    fn num_opt_dofs(&self) -> usize {
        self.weights.len()
    }

    fn initialize_topology(&mut self, densities: &[f64]) -> Result<()> {
        assert_eq!(densities.len(), self.weights.len());
        Ok(())
    }

    fn total_volume(&mut self) -> Result<f64> {
        Ok(self.weights.len() as f64)
    }

    fn compute_volume(&mut self, densities: &[f64]) -> Result<f64> {
        Ok(densities.iter().sum())
    }

    fn compute_volume_with_gradient(&mut self, densities: &[f64], gradient: &mut [f64]) -> Result<f64> {
        gradient.fill(1.0);
        Ok(densities.iter().sum())
    }

    fn compute(&mut self, densities: &[f64], objective_gradient: &mut [f64]) -> Result<Evaluation> {
        Ok(self.evaluate(densities, objective_gradient))
    }

    fn compute_with_constraint_gradient(
        &mut self,
        densities: &[f64],
        objective_gradient: &mut [f64],
        constraint_gradient: &mut [f64],
    ) -> Result<Evaluation> {
        constraint_gradient.fill(1.0);
        Ok(self.evaluate(densities, objective_gradient))
    }
}

fn weights() -> Vec<f64> {
    (1..=8).map(f64::from).collect()
}

fn topology() -> Topology {
    Topology::new(0.001, 1.0, 0.5).unwrap()
}

fn options(convergence: ConvergenceOptions) -> OptimizerOptions {
    OptimizerOptions::new(
        0.2,
        0.5,
        VolumeOptions::new(0.4, 1e-10, 60).with_accept_tolerance(1e-8),
        convergence,
    )
}

fn run<R: Reduction>(options: OptimizerOptions, simulation: Cells, comm: R) -> octopo::OptimizationResult {
    let mut optimizer = OcOptimizer::new(options, topology(), comm)
        .unwrap()
        .with_simulation(simulation);
    optimizer.initialize().unwrap();
    let result = optimizer.optimize().unwrap();
    assert_eq!(optimizer.state(), OptimizerState::Converged);
    result
}

#[test]
fn compliance_like_problem_reaches_optimality_condition() {
    let convergence = ConvergenceOptions::new(200).with_absolute_topology_change(1e-8);
    let result = run(options(convergence), Cells::new(weights()), SerialReduction);

    assert_eq!(result.termination, Termination::Converged);
    assert!(result.iterations < 200);

    let p = &result.densities;
    assert_relative_eq!(p.sum() / p.len() as f64, 0.4, epsilon = 1e-8);
    // Stationarity of Σ c/p under Σ p = V gives p_i proportional to sqrt(c_i).
    for (i, density) in p.iter().enumerate() {
        let expected = p[0] * ((i + 1) as f64).sqrt();
        assert_relative_eq!(*density, expected, epsilon = 1e-6);
    }

    let objectives: Vec<f64> = result.history.iter().map(|record| record.objective).collect();
    assert!(objectives.windows(2).all(|pair| pair[1] <= pair[0] + 1e-6));
}

#[test]
fn iteration_limit_stops_loop_without_criteria() {
    let result = run(
        options(ConvergenceOptions::new(3)),
        Cells::new(weights()),
        SerialReduction,
    );
    assert_eq!(result.termination, Termination::IterationLimit);
    assert_eq!(result.iterations, 4);
    assert_eq!(result.history.len(), 4);
    assert!(result.history.last().unwrap().status.is_iteration_limit());
}

#[test]
fn minimum_iterations_postpone_convergence() {
    let convergence = ConvergenceOptions::new(50)
        .with_min_iterations(6)
        .with_absolute_topology_change(1e-6);
    // Uniform weights keep the field at the target from the first iteration on.
    let result = run(options(convergence), Cells::new(vec![1.0; 5]), SerialReduction);

    assert_eq!(result.termination, Termination::Converged);
    assert_eq!(result.iterations, 7);
}

#[test]
fn thread_group_matches_serial_run() {
    let convergence = ConvergenceOptions::new(200).with_absolute_topology_change(1e-8);
    let serial = run(options(convergence.clone()), Cells::new(weights()), SerialReduction);

    let all = weights();
    let partitions = [all[..3].to_vec(), all[3..].to_vec()];
    let handles = ThreadGroup::new(partitions.len());
    let results: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = handles
            .into_iter()
            .zip(partitions)
            .map(|(comm, cells)| {
                let options = options(convergence.clone());
                scope.spawn(move || run(options, Cells::new(cells), comm))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    assert_eq!(results[0].iterations, results[1].iterations);
    assert_eq!(results[0].objective, results[1].objective);

    let combined: Vec<f64> = results
        .iter()
        .flat_map(|result| result.densities.iter().copied())
        .collect();
    for (threaded, single) in combined.iter().zip(serial.densities.iter()) {
        assert_relative_eq!(*threaded, *single, epsilon = 1e-7);
    }
}

#[test]
fn adjoint_budget_drives_constraint_to_zero() {
    let options = options(ConvergenceOptions::new(6))
        .with_gradient_mode(ConstraintGradientMode::Adjoint);
    let simulation = Cells::new(vec![1.0; 10]).with_volume_limit(0.3);
    let result = run(options, simulation, SerialReduction);

    let targets: Vec<f64> = result.history.iter().map(|record| record.volume_target).collect();
    assert_relative_eq!(targets[0], 0.36, epsilon = 1e-6);
    assert_relative_eq!(targets[1], 0.324, epsilon = 1e-6);
    assert_relative_eq!(result.volume_target, 0.3, epsilon = 1e-6);
    assert_relative_eq!(result.densities.sum(), 3.0, epsilon = 1e-5);
}

#[test]
fn history_budget_learns_constraint_sensitivity() {
    let options = options(ConvergenceOptions::new(4));
    let simulation = Cells::new(vec![1.0; 10]).with_volume_limit(0.3);
    let result = run(options, simulation, SerialReduction);

    let targets: Vec<f64> = result.history.iter().map(|record| record.volume_target).collect();
    // The first correction has no history and takes the fallback step.
    let expected = [0.401, 0.3609, 0.32481, 0.3, 0.3];
    assert_eq!(targets.len(), expected.len());
    for (target, expected) in targets.iter().zip(expected) {
        assert_relative_eq!(*target, expected, epsilon = 1e-6);
    }
}

#[test]
fn options_load_from_json_document() {
    let document = r#"{
        "package": "oc",
        "move_limit": 0.2,
        "stabilization_exponent": 0.5,
        "volume": {
            "convergence_tolerance": 1e-10,
            "accept_tolerance": 1e-8,
            "target_fraction": 0.4,
            "max_iterations": 60
        },
        "constraint": { "gradient_mode": "None" },
        "convergence": {
            "max_iterations": 200,
            "combo_type": "AND",
            "absolute_topology_change": 1e-8,
            "verbose": false
        }
    }"#;

    let config: OptimizerConfig = serde_json::from_str(document).unwrap();
    let options = config.build().unwrap();
    assert_eq!(options.volume.max_iterations, 60);

    let result = run(options, Cells::new(weights()), SerialReduction);
    assert_eq!(result.termination, Termination::Converged);
}
