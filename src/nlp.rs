//! Glue for general nonlinear-programming backends.
//!
//! Such libraries drive their own search and call back into user closures for the
//! objective and the volume constraint. [`NlpMonitor`] performs the bookkeeping those
//! closures need: it feeds every objective evaluation to the convergence test and
//! trips a [`StopToken`] that the closure uses to ask the library to stop.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::info;

use crate::convergence::{ConvergenceStatus, ConvergenceTest};
use crate::error::{OptError, Result};
use crate::reduction::{global_diff_norm, global_norm, Reduction};
use crate::simulation::SimulationInterface;

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    code: AtomicI32,
}

/// Cloneable cancellation flag shared with an external library's callbacks.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    inner: Arc<StopState>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop, recording the reason code reported to the library.
    pub fn force_stop(&self, code: i32) {
        self.inner.code.store(code, Ordering::SeqCst);
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Reason code of the stop request, if one was made.
    pub fn code(&self) -> Option<i32> {
        self.is_stopped()
            .then(|| self.inner.code.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.code.store(0, Ordering::SeqCst);
    }
}

/// Per-evaluation bookkeeping for NLP-library objective and constraint callbacks.
#[derive(Debug)]
pub struct NlpMonitor<R> {
    convergence: ConvergenceTest,
    comm: R,
    token: StopToken,
    target_fraction: f64,
    total_volume: f64,
    objective: f64,
    last_field: Vec<f64>,
    evaluations: usize,
}

impl<R: Reduction> NlpMonitor<R> {
    /// Stop code reported when the convergence test ends the search.
    pub const CONVERGED_STOP_CODE: i32 = 104;

    pub fn new(
        convergence: ConvergenceTest,
        comm: R,
        target_fraction: f64,
        total_volume: f64,
    ) -> Self {
        Self {
            convergence,
            comm,
            token: StopToken::new(),
            target_fraction,
            total_volume,
            objective: 0.0,
            last_field: Vec::new(),
            evaluations: 0,
        }
    }

    /// Handle to pass into the library's callback closure.
    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Seeds the convergence references from the starting point.
    pub fn initialize(&mut self, x: &[f64], local_objective: f64) {
        let objective = self.comm.sum_all(local_objective);
        let norm = global_norm(&self.comm, x);
        self.convergence.initialize(objective, norm);
        self.objective = local_objective;
        self.last_field = x.to_vec();
    }

    /// Records an objective evaluation at `x` and trips the token when the test stops.
    ///
    /// The reductions run before `x` is checked against the previous field, so a worker
    /// that reports a mismatch never leaves its peers waiting inside a collective.
    pub fn observe_objective(&mut self, x: &[f64], local_objective: f64) -> Result<ConvergenceStatus> {
        let reporting = self.comm.is_reporting();
        let delta_f = self.comm.sum_all(local_objective - self.objective);
        let delta_p = global_diff_norm(&self.comm, x, &self.last_field);
        if self.last_field.len() != x.len() {
            return Err(OptError::dimension_mismatch(
                "monitored design field",
                self.last_field.len(),
                x.len(),
            ));
        }
        self.objective = local_objective;
        self.last_field.copy_from_slice(x);

        let status = self
            .convergence
            .evaluate(delta_f, delta_p, self.evaluations, reporting);
        self.evaluations += 1;

        if status.should_stop() {
            if reporting {
                info!("optimizer converged; objective contribution = {local_objective}");
            }
            self.token.force_stop(Self::CONVERGED_STOP_CODE);
        }
        Ok(status)
    }

    /// Value of the volume inequality `volume - target * total_volume`, filling `gradient`.
    pub fn volume_constraint<S: SimulationInterface + ?Sized>(
        &self,
        simulation: &mut S,
        x: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64> {
        let local = simulation.compute_volume_with_gradient(x, gradient)?;
        let volume = self.comm.sum_all(local);
        Ok(volume - self.target_fraction * self.total_volume)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::convergence::ConvergenceCriterion;
    use crate::options::ComboType;
    use crate::reduction::{SerialReduction, ThreadGroup};

    #[test]
    fn token_clones_share_state() {
        let token = StopToken::new();
        let handle = token.clone();
        assert_eq!(handle.code(), None);
        token.force_stop(7);
        assert!(handle.is_stopped());
        assert_eq!(handle.code(), Some(7));
        handle.reset();
        assert!(!token.is_stopped());
    }

    #[test]
    fn monitor_trips_token_once_objective_settles() {
        let test = ConvergenceTest::new(ComboType::Or, 0, 50)
            .with_criterion(ConvergenceCriterion::absolute_objective_change(1e-3));
        let mut monitor = NlpMonitor::new(test, SerialReduction, 0.5, 4.0);
        let token = monitor.token();

        monitor.initialize(&[0.5; 4], 10.0);
        let objectives = [9.0, 8.5, 8.4, 8.4001];
        let mut stops = Vec::new();
        for (k, objective) in objectives.into_iter().enumerate() {
            let x = vec![0.5 - 0.01 * k as f64; 4];
            stops.push(monitor.observe_objective(&x, objective).unwrap().should_stop());
        }

        assert_eq!(stops, vec![false, false, false, true]);
        assert_eq!(token.code(), Some(NlpMonitor::<SerialReduction>::CONVERGED_STOP_CODE));
        assert_eq!(monitor.evaluations(), 4);
    }

    #[test]
    fn monitor_rejects_resized_fields() {
        let test = ConvergenceTest::new(ComboType::Or, 0, 5);
        let mut monitor = NlpMonitor::new(test, SerialReduction, 0.5, 4.0);
        monitor.initialize(&[0.5; 4], 1.0);
        assert!(monitor.observe_objective(&[0.5; 3], 1.0).is_err());
        assert_eq!(monitor.evaluations(), 0);
    }

    #[test]
    fn mismatched_worker_does_not_block_its_peer() {
        let outcomes: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let test = ConvergenceTest::new(ComboType::Or, 0, 5);
                    let mut monitor = NlpMonitor::new(test, comm, 0.5, 4.0);
                    monitor.initialize(&[0.5; 2], 1.0);
                    let x = if rank == 0 { vec![0.4; 2] } else { vec![0.4; 3] };
                    monitor.observe_objective(&x, 0.9).is_ok()
                })
            })
            .collect();

        let outcomes: Vec<bool> = outcomes
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(outcomes, vec![true, false]);
    }
}
