//! Design-variable bounds and the initial density of the design field.

use serde::{Deserialize, Serialize};

use crate::error::{OptError, Result};

/// Describes the admissible density range of every design variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Lower bound enforced on every density.
    pub min_density: f64,
    /// Upper bound enforced on every density.
    pub max_density: f64,
    /// Density assigned to every variable when the optimizer is initialized.
    pub initial_value: f64,
}

impl Topology {
    /// Creates a validated topology description.
    pub fn new(min_density: f64, max_density: f64, initial_value: f64) -> Result<Self> {
        let topology = Self {
            min_density,
            max_density,
            initial_value,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Checks that the bounds are ordered and contain the initial value.
    pub fn validate(&self) -> Result<()> {
        if !self.min_density.is_finite() {
            return Err(OptError::invalid_parameter(
                "topology.min_density",
                self.min_density,
                "must be finite",
            ));
        }
        if !(self.max_density > self.min_density) || !self.max_density.is_finite() {
            return Err(OptError::invalid_parameter(
                "topology.max_density",
                self.max_density,
                "must be finite and exceed topology.min_density",
            ));
        }
        if !(self.min_density..=self.max_density).contains(&self.initial_value) {
            return Err(OptError::invalid_parameter(
                "topology.initial_value",
                self.initial_value,
                "must lie within the density bounds",
            ));
        }
        Ok(())
    }

    /// Reference point of the multiplicative update, placed 1% of the density range
    /// below the lower bound so that no admissible density coincides with it.
    pub fn offset(&self) -> f64 {
        self.min_density - 0.01 * (self.max_density - self.min_density)
    }
}
