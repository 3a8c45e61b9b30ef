//! Collective reductions across the workers that share the design field.
//!
//! Every worker owns a disjoint slice of the design variables. Scalars such as the
//! objective, the density norm or the enforced volume are partition-local until they
//! pass through [`Reduction::sum_all`], which behaves as a barrier: all workers must
//! issue the same sequence of reductions.

use std::sync::{Arc, Barrier, Mutex, PoisonError};

/// Sum-all collective plus rank identification.
pub trait Reduction {
    /// Sums `local` over every worker; each worker receives the same total.
    fn sum_all(&self, local: f64) -> f64;

    /// Identifier of the calling worker.
    fn rank(&self) -> usize;

    /// Number of workers taking part in the collective.
    fn size(&self) -> usize {
        1
    }

    /// Worker responsible for observational output.
    fn reporting_rank(&self) -> usize {
        0
    }

    fn is_reporting(&self) -> bool {
        self.rank() == self.reporting_rank()
    }
}

impl<R: Reduction + ?Sized> Reduction for &R {
    fn sum_all(&self, local: f64) -> f64 {
        (**self).sum_all(local)
    }

    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn reporting_rank(&self) -> usize {
        (**self).reporting_rank()
    }
}

/// Single-worker reduction: every sum is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialReduction;

impl Reduction for SerialReduction {
    fn sum_all(&self, local: f64) -> f64 {
        local
    }

    fn rank(&self) -> usize {
        0
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<f64>>,
}

/// In-process collective over a fixed group of worker threads.
#[derive(Debug)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// Creates one handle per worker; hand each to its own thread.
    pub fn new(size: usize) -> Vec<ThreadReduction> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0.0; size]),
        });
        (0..size)
            .map(|rank| ThreadReduction {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// Handle of one worker inside a [`ThreadGroup`].
///
/// Contributions are summed in rank order, so every worker observes a bit-identical total.
#[derive(Clone, Debug)]
pub struct ThreadReduction {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl Reduction for ThreadReduction {
    fn sum_all(&self, local: f64) -> f64 {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[self.rank] = local;
        self.shared.barrier.wait();
        let total = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .sum();
        // Nobody may overwrite a slot until every worker has read the total.
        self.shared.barrier.wait();
        total
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Global sum of a partitioned vector.
pub fn global_sum<R: Reduction + ?Sized>(comm: &R, values: &[f64]) -> f64 {
    comm.sum_all(values.iter().sum())
}

/// Global Euclidean norm of a partitioned vector.
pub fn global_norm<R: Reduction + ?Sized>(comm: &R, values: &[f64]) -> f64 {
    let local: f64 = values.iter().map(|value| value * value).sum();
    clamped_sqrt(comm.sum_all(local))
}

/// Global Euclidean norm of `current - previous`.
pub fn global_diff_norm<R: Reduction + ?Sized>(comm: &R, current: &[f64], previous: &[f64]) -> f64 {
    let local: f64 = current
        .iter()
        .zip(previous)
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    clamped_sqrt(comm.sum_all(local))
}

fn clamped_sqrt(value: f64) -> f64 {
    if value > 0.0 {
        value.sqrt()
    } else {
        0.0
    }
}
