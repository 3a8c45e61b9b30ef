//! Optimality-criteria (OC) topology optimization with an adaptive volume budget.
//!
//! The crate drives a density-based design field towards a stationary point of a
//! simulation-supplied objective under a volume constraint. It offers tools to
//!
//! - describe the admissible density range (`topology` module),
//! - apply the multiplicative OC update with move limits (`update` module),
//! - find the Lagrange multiplier that meets a volume target (`volume` module),
//! - adapt that target to an external constraint (`budget` module),
//! - decide when to stop (`convergence` module), and
//! - run the whole outer loop (`optimizer` module).
//!
//! Work may be partitioned across workers. Every global quantity goes through a
//! [`Reduction`](reduction::Reduction); [`SerialReduction`](reduction::SerialReduction)
//! covers the single-worker case and [`ThreadGroup`](reduction::ThreadGroup) gives a
//! shared-memory collective for threaded partitions.
//!
//! # Quick start
//!
//! ```no_run
//! use octopo::optimizer::{OcOptimizer, Optimizer};
//! use octopo::options::{ConvergenceOptions, OptimizerOptions, VolumeOptions};
//! use octopo::reduction::SerialReduction;
//! use octopo::simulation::{Evaluation, SimulationInterface};
//! use octopo::topology::Topology;
//! use octopo::Result;
//!
//! // Every cell has unit volume and contributes 1/p to the objective.
//! struct Cells(usize);
//!
//! impl SimulationInterface for Cells {
//!     fn num_opt_dofs(&self) -> usize {
//!         self.0
//!     }
//!     fn initialize_topology(&mut self, _densities: &[f64]) -> Result<()> {
//!         Ok(())
//!     }
//!     fn total_volume(&mut self) -> Result<f64> {
//!         Ok(self.0 as f64)
//!     }
//!     fn compute_volume(&mut self, densities: &[f64]) -> Result<f64> {
//!         Ok(densities.iter().sum())
//!     }
//!     fn compute_volume_with_gradient(&mut self, densities: &[f64], gradient: &mut [f64]) -> Result<f64> {
//!         gradient.fill(1.0);
//!         Ok(densities.iter().sum())
//!     }
//!     fn compute(&mut self, densities: &[f64], gradient: &mut [f64]) -> Result<Evaluation> {
//!         for (g, p) in gradient.iter_mut().zip(densities) {
//!             *g = -1.0 / (p * p);
//!         }
//!         Ok(Evaluation::objective_only(densities.iter().map(|p| 1.0 / p).sum()))
//!     }
//! }
//!
//! let options = OptimizerOptions::new(
//!     0.2,
//!     0.5,
//!     VolumeOptions::new(0.4, 1e-8, 50),
//!     ConvergenceOptions::new(100).with_absolute_topology_change(1e-6),
//! );
//! let topology = Topology::new(0.001, 1.0, 0.5)?;
//!
//! let mut optimizer = OcOptimizer::new(options, topology, SerialReduction)?.with_simulation(Cells(100));
//! optimizer.initialize()?;
//! let result = optimizer.optimize()?;
//! println!("stopped after {} iterations: {:?}", result.iterations, result.termination);
//! # Ok::<(), octopo::OptError>(())
//! ```
//!
//! External nonlinear-programming libraries can reuse the convergence machinery
//! through the `nlp` module.

pub mod budget;
pub mod convergence;
pub mod error;
pub mod nlp;
pub mod optimizer;
pub mod options;
pub mod reduction;
pub mod simulation;
pub mod topology;
pub mod update;
pub mod volume;
pub mod window;

pub use error::{OptError, Result};
pub use optimizer::{OcOptimizer, OptimizationResult, Optimizer, OptimizerFactory, Termination};
pub use options::{OptimizerConfig, OptimizerOptions};
pub use volume::{EnforcementSummary, VolumeEnforcer};
