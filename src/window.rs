//! Fixed-capacity sample window with an eagerly maintained sum.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` samples and their running sum.
///
/// Pushing into a full window evicts the oldest sample, so every update is `O(1)`.
#[derive(Clone, Debug)]
pub struct RunningWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RunningWindow {
    /// Creates an empty window; a zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Appends a sample and returns the evicted one, if the window was full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            self.sum -= old;
        }
        self.values.push_back(value);
        self.sum += value;
        evicted
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Arithmetic mean of the retained samples, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates from the oldest to the newest sample.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
}
