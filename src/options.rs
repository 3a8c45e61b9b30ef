//! Optimizer configuration: raw deserializable documents and their validated counterparts.
//!
//! Configuration arrives as an [`OptimizerConfig`] (every key optional so that missing
//! entries can be reported by name) and is turned into an [`OptimizerOptions`] by
//! [`OptimizerConfig::build`], which fills defaults and validates ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OptError, Result};

/// Rule used to combine the individual convergence criteria.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComboType {
    /// Every criterion must pass.
    And,
    /// At least one criterion must pass.
    #[default]
    Or,
}

impl FromStr for ComboType {
    type Err = OptError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => Err(OptError::UnknownOption {
                name: "convergence.combo_type",
                value: value.to_string(),
                expected: "(AND, OR)",
            }),
        }
    }
}

impl fmt::Display for ComboType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => f.write_str("AND"),
            Self::Or => f.write_str("OR"),
        }
    }
}

/// Strategy used to estimate how the constraint responds to the volume target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintGradientMode {
    /// No constraint gradient; sensitivity is inferred from the iteration history.
    #[default]
    None,
    /// The simulation supplies `dg/dp`; sensitivity comes from a finite-difference probe.
    Adjoint,
}

impl FromStr for ConstraintGradientMode {
    type Err = OptError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "adjoint" => Ok(Self::Adjoint),
            _ => Err(OptError::UnknownOption {
                name: "constraint.gradient_mode",
                value: value.to_string(),
                expected: "(none, adjoint)",
            }),
        }
    }
}

/// Optimization backend selected by the factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerPackage {
    /// Optimality-criteria update with volume enforcement.
    #[default]
    #[serde(rename = "OC")]
    Oc,
}

impl FromStr for OptimizerPackage {
    type Err = OptError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "oc" => Ok(Self::Oc),
            _ => Err(OptError::UnknownOption {
                name: "package",
                value: value.to_string(),
                expected: "(OC)",
            }),
        }
    }
}

/// Constants of the adaptive volume-target controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetOptions {
    /// Volume-fraction perturbation used by the finite-difference probe.
    pub probe_step: f64,
    /// Step applied when the target did not move in the previous iteration.
    pub fallback_step: f64,
    /// Number of sensitivity samples averaged by the history estimator.
    pub history_length: usize,
    /// Largest correction, as a fraction of the current target.
    pub max_relative_step: f64,
}

impl Default for BudgetOptions {
    fn default() -> Self {
        Self {
            probe_step: 1e-3,
            fallback_step: 1e-3,
            history_length: 10,
            max_relative_step: 0.1,
        }
    }
}

/// Settings of the volume-enforcement multiplier search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Working tolerance, relative to the total design volume.
    pub convergence_tolerance: f64,
    /// Initial volume fraction target.
    pub target_fraction: f64,
    /// Iteration cap of each bisection phase.
    pub max_iterations: usize,
    /// Lower clamp applied to the adapted target.
    pub min_fraction: f64,
    /// Upper clamp applied to the adapted target.
    pub max_fraction: f64,
    /// Post-search acceptance tolerance, relative to the total design volume.
    pub accept_tolerance: f64,
    /// Whether to refine the bisection bracket with a secant/Newton search.
    pub use_newton_search: bool,
}

impl VolumeOptions {
    /// Creates volume options with the default fraction bounds and Newton refinement enabled.
    pub fn new(target_fraction: f64, convergence_tolerance: f64, max_iterations: usize) -> Self {
        Self {
            convergence_tolerance,
            target_fraction,
            max_iterations,
            min_fraction: 0.1,
            max_fraction: 1.0,
            accept_tolerance: convergence_tolerance,
            use_newton_search: true,
        }
    }

    pub fn with_fraction_bounds(mut self, min_fraction: f64, max_fraction: f64) -> Self {
        self.min_fraction = min_fraction;
        self.max_fraction = max_fraction;
        self
    }

    pub fn with_accept_tolerance(mut self, tolerance: f64) -> Self {
        self.accept_tolerance = tolerance;
        self
    }

    pub fn with_newton_search(mut self, enabled: bool) -> Self {
        self.use_newton_search = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        positive("volume.convergence_tolerance", self.convergence_tolerance)?;
        positive("volume.accept_tolerance", self.accept_tolerance)?;
        positive("volume.min_fraction", self.min_fraction)?;
        if self.max_iterations == 0 {
            return Err(OptError::invalid_parameter(
                "volume.max_iterations",
                0.0,
                "at least one iteration is required",
            ));
        }
        if !(self.max_fraction >= self.min_fraction) {
            return Err(OptError::invalid_parameter(
                "volume.max_fraction",
                self.max_fraction,
                "must not be below volume.min_fraction",
            ));
        }
        if !(self.min_fraction..=self.max_fraction).contains(&self.target_fraction) {
            return Err(OptError::invalid_parameter(
                "volume.target_fraction",
                self.target_fraction,
                "must lie within [volume.min_fraction, volume.max_fraction]",
            ));
        }
        Ok(())
    }
}

/// Constraint handling: gradient mode plus the adaptive controller's constants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintOptions {
    pub gradient_mode: ConstraintGradientMode,
    pub budget: BudgetOptions,
}

impl ConstraintOptions {
    fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        positive("constraint.budget.probe_step", budget.probe_step)?;
        finite("constraint.budget.fallback_step", budget.fallback_step)?;
        positive("constraint.budget.max_relative_step", budget.max_relative_step)?;
        if budget.history_length == 0 {
            return Err(OptError::invalid_parameter(
                "constraint.budget.history_length",
                0.0,
                "at least one sample is required",
            ));
        }
        Ok(())
    }
}

/// Stopping rules of the outer optimization loop.
///
/// Each `Some` threshold enables the matching criterion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceOptions {
    pub min_iterations: usize,
    pub max_iterations: usize,
    pub combo_type: ComboType,
    pub relative_topology_change: Option<f64>,
    pub absolute_topology_change: Option<f64>,
    pub relative_objective_change: Option<f64>,
    pub absolute_objective_change: Option<f64>,
    pub relative_running_average_change: Option<f64>,
    pub absolute_running_average_change: Option<f64>,
    /// Number of objective changes kept by the running-average criteria.
    pub running_average_window: usize,
    /// Whether criteria log their individual pass/fail lines.
    pub verbose: bool,
}

impl ConvergenceOptions {
    /// Creates options with no criteria enabled, combined with `OR`.
    pub fn new(max_iterations: usize) -> Self {
        Self {
            min_iterations: 0,
            max_iterations,
            combo_type: ComboType::Or,
            relative_topology_change: None,
            absolute_topology_change: None,
            relative_objective_change: None,
            absolute_objective_change: None,
            relative_running_average_change: None,
            absolute_running_average_change: None,
            running_average_window: 10,
            verbose: true,
        }
    }

    pub fn with_min_iterations(mut self, min_iterations: usize) -> Self {
        self.min_iterations = min_iterations;
        self
    }

    pub fn with_combo_type(mut self, combo_type: ComboType) -> Self {
        self.combo_type = combo_type;
        self
    }

    pub fn with_absolute_topology_change(mut self, threshold: f64) -> Self {
        self.absolute_topology_change = Some(threshold);
        self
    }

    pub fn with_relative_topology_change(mut self, threshold: f64) -> Self {
        self.relative_topology_change = Some(threshold);
        self
    }

    pub fn with_absolute_objective_change(mut self, threshold: f64) -> Self {
        self.absolute_objective_change = Some(threshold);
        self
    }

    pub fn with_relative_objective_change(mut self, threshold: f64) -> Self {
        self.relative_objective_change = Some(threshold);
        self
    }

    pub fn with_absolute_running_average_change(mut self, threshold: f64) -> Self {
        self.absolute_running_average_change = Some(threshold);
        self
    }

    pub fn with_relative_running_average_change(mut self, threshold: f64) -> Self {
        self.relative_running_average_change = Some(threshold);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.running_average_window == 0 {
            return Err(OptError::invalid_parameter(
                "convergence.running_average_window",
                0.0,
                "window must hold at least one sample",
            ));
        }
        let thresholds = [
            ("convergence.relative_topology_change", self.relative_topology_change),
            ("convergence.absolute_topology_change", self.absolute_topology_change),
            ("convergence.relative_objective_change", self.relative_objective_change),
            ("convergence.absolute_objective_change", self.absolute_objective_change),
            (
                "convergence.relative_running_average_change",
                self.relative_running_average_change,
            ),
            (
                "convergence.absolute_running_average_change",
                self.absolute_running_average_change,
            ),
        ];
        for (name, value) in thresholds {
            if let Some(value) = value {
                finite(name, value)?;
            }
        }
        Ok(())
    }
}

/// Validated configuration of the optimality-criteria optimizer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions {
    pub package: OptimizerPackage,
    /// Largest per-variable density change in one outer iteration.
    pub move_limit: f64,
    /// Exponent applied to the sensitivity ratio in the multiplicative update.
    pub stabilization_exponent: f64,
    pub volume: VolumeOptions,
    pub constraint: ConstraintOptions,
    pub convergence: ConvergenceOptions,
}

impl OptimizerOptions {
    /// Assembles options from their required parts; constraint handling uses defaults.
    pub fn new(
        move_limit: f64,
        stabilization_exponent: f64,
        volume: VolumeOptions,
        convergence: ConvergenceOptions,
    ) -> Self {
        Self {
            package: OptimizerPackage::Oc,
            move_limit,
            stabilization_exponent,
            volume,
            constraint: ConstraintOptions::default(),
            convergence,
        }
    }

    /// Selects the constraint-gradient strategy.
    pub fn with_gradient_mode(mut self, mode: ConstraintGradientMode) -> Self {
        self.constraint.gradient_mode = mode;
        self
    }

    /// Overrides the adaptive controller's constants.
    pub fn with_budget(mut self, budget: BudgetOptions) -> Self {
        self.constraint.budget = budget;
        self
    }

    /// Checks every numeric range; reports the first offending key.
    pub fn validate(&self) -> Result<()> {
        positive("move_limit", self.move_limit)?;
        finite("stabilization_exponent", self.stabilization_exponent)?;
        self.volume.validate()?;
        self.constraint.validate()?;
        self.convergence.validate()
    }
}

/// Raw `volume` section of an [`OptimizerConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub convergence_tolerance: Option<f64>,
    pub target_fraction: Option<f64>,
    pub max_iterations: Option<usize>,
    pub min_fraction: Option<f64>,
    pub max_fraction: Option<f64>,
    pub accept_tolerance: Option<f64>,
    pub use_newton_search: Option<bool>,
}

/// Raw `constraint` section of an [`OptimizerConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub gradient_mode: Option<String>,
    pub budget: Option<BudgetOptions>,
}

/// Raw `convergence` section of an [`OptimizerConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub min_iterations: Option<usize>,
    pub max_iterations: Option<usize>,
    pub combo_type: Option<String>,
    pub relative_topology_change: Option<f64>,
    pub absolute_topology_change: Option<f64>,
    pub relative_objective_change: Option<f64>,
    pub absolute_objective_change: Option<f64>,
    pub relative_running_average_change: Option<f64>,
    pub absolute_running_average_change: Option<f64>,
    pub running_average_window: Option<usize>,
    pub verbose: Option<bool>,
}

/// Deserializable optimizer configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub package: Option<String>,
    pub move_limit: Option<f64>,
    pub stabilization_exponent: Option<f64>,
    pub volume: Option<VolumeConfig>,
    pub constraint: ConstraintConfig,
    pub convergence: Option<ConvergenceConfig>,
}

impl OptimizerConfig {
    /// Fills defaults, rejects missing required keys and validates the result.
    pub fn build(self) -> Result<OptimizerOptions> {
        let package = match self.package.as_deref() {
            Some(name) => name.parse()?,
            None => OptimizerPackage::Oc,
        };

        let volume_config = self
            .volume
            .ok_or_else(|| OptError::missing_parameter("volume"))?;
        let convergence_tolerance = volume_config
            .convergence_tolerance
            .ok_or_else(|| OptError::missing_parameter("volume.convergence_tolerance"))?;
        let mut volume = VolumeOptions::new(
            volume_config
                .target_fraction
                .ok_or_else(|| OptError::missing_parameter("volume.target_fraction"))?,
            convergence_tolerance,
            volume_config
                .max_iterations
                .ok_or_else(|| OptError::missing_parameter("volume.max_iterations"))?,
        );
        if let Some(min_fraction) = volume_config.min_fraction {
            volume.min_fraction = min_fraction;
        }
        if let Some(max_fraction) = volume_config.max_fraction {
            volume.max_fraction = max_fraction;
        }
        if let Some(accept_tolerance) = volume_config.accept_tolerance {
            volume.accept_tolerance = accept_tolerance;
        }
        if let Some(use_newton_search) = volume_config.use_newton_search {
            volume.use_newton_search = use_newton_search;
        }

        let constraint = ConstraintOptions {
            gradient_mode: match self.constraint.gradient_mode.as_deref() {
                Some(mode) => mode.parse()?,
                None => ConstraintGradientMode::None,
            },
            budget: self.constraint.budget.unwrap_or_default(),
        };

        let convergence_config = self
            .convergence
            .ok_or_else(|| OptError::missing_parameter("convergence"))?;
        let mut convergence = ConvergenceOptions::new(
            convergence_config
                .max_iterations
                .ok_or_else(|| OptError::missing_parameter("convergence.max_iterations"))?,
        );
        convergence.min_iterations = convergence_config.min_iterations.unwrap_or(0);
        if let Some(combo) = convergence_config.combo_type.as_deref() {
            convergence.combo_type = combo.parse()?;
        }
        convergence.relative_topology_change = convergence_config.relative_topology_change;
        convergence.absolute_topology_change = convergence_config.absolute_topology_change;
        convergence.relative_objective_change = convergence_config.relative_objective_change;
        convergence.absolute_objective_change = convergence_config.absolute_objective_change;
        convergence.relative_running_average_change =
            convergence_config.relative_running_average_change;
        convergence.absolute_running_average_change =
            convergence_config.absolute_running_average_change;
        if let Some(window) = convergence_config.running_average_window {
            convergence.running_average_window = window;
        }
        if let Some(verbose) = convergence_config.verbose {
            convergence.verbose = verbose;
        }

        let options = OptimizerOptions {
            package,
            move_limit: self
                .move_limit
                .ok_or_else(|| OptError::missing_parameter("move_limit"))?,
            stabilization_exponent: self
                .stabilization_exponent
                .ok_or_else(|| OptError::missing_parameter("stabilization_exponent"))?,
            volume,
            constraint,
            convergence,
        };
        options.validate()?;
        Ok(options)
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(OptError::invalid_parameter(
            name,
            value,
            "must be positive and finite",
        ))
    }
}

fn finite(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(OptError::invalid_parameter(name, value, "must be finite"))
    }
}
