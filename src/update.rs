//! The optimality-criteria density update.
//!
//! For a trial multiplier `λ` every density moves to
//!
//! ```text
//! be    = -dfdp / dvdp / λ
//! p_new = (p_old - offset) * be^η + offset
//! ```
//!
//! followed by move-limiting and clipping into the density bounds.

use rayon::prelude::*;

use crate::error::{OptError, Result};
use crate::topology::Topology;

/// Per-variable multiplicative update with move limit and bound clipping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OcUpdate {
    stabilization_exponent: f64,
    move_limit: f64,
    min_density: f64,
    max_density: f64,
    offset: f64,
}

impl OcUpdate {
    pub fn new(topology: &Topology, stabilization_exponent: f64, move_limit: f64) -> Self {
        Self {
            stabilization_exponent,
            move_limit,
            min_density: topology.min_density,
            max_density: topology.max_density,
            offset: topology.offset(),
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Sensitivity ratio `-dfdp / dvdp / λ` with degenerate inputs resolved:
    /// a variable without volume sensitivity, or an undefined ratio, keeps its density
    /// (ratio `1`); a negative ratio is clamped to `0` so the fractional power stays real.
    pub fn sensitivity_ratio(dfdp: f64, dvdp: f64, multiplier: f64) -> f64 {
        if dvdp == 0.0 {
            return 1.0;
        }
        let ratio = -dfdp / dvdp / multiplier;
        if ratio.is_nan() {
            1.0
        } else {
            ratio.max(0.0)
        }
    }

    /// Updated density of one variable.
    #[inline]
    pub fn update(&self, p_old: f64, dfdp: f64, dvdp: f64, multiplier: f64) -> f64 {
        let be = Self::sensitivity_ratio(dfdp, dvdp, multiplier);
        let mut p_new = (p_old - self.offset) * be.powf(self.stabilization_exponent) + self.offset;

        let step = p_new - p_old;
        if step.abs() > self.move_limit {
            p_new = p_old + step.signum() * self.move_limit;
        }
        p_new.clamp(self.min_density, self.max_density)
    }

    /// Applies [`update`](Self::update) to every variable, writing into `p`.
    pub fn apply(
        &self,
        p_last: &[f64],
        dfdp: &[f64],
        dvdp: &[f64],
        multiplier: f64,
        p: &mut [f64],
    ) -> Result<()> {
        let n = p_last.len();
        if dfdp.len() != n {
            return Err(OptError::dimension_mismatch("objective gradient", n, dfdp.len()));
        }
        if dvdp.len() != n {
            return Err(OptError::dimension_mismatch("volume gradient", n, dvdp.len()));
        }
        if p.len() != n {
            return Err(OptError::dimension_mismatch("density field", n, p.len()));
        }

        p.par_iter_mut()
            .zip(p_last.par_iter())
            .zip(dfdp.par_iter().zip(dvdp.par_iter()))
            .for_each(|((p_new, &p_old), (&df, &dv))| {
                *p_new = self.update(p_old, df, dv, multiplier);
            });
        Ok(())
    }
}
