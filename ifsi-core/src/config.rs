//! Simulation configuration.
//!
//! The configuration is consumed, not owned: parameter-file parsing lives
//! outside the core. This struct carries exactly what the solver needs and
//! validates its preconditions once, at startup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Parameters of an incompressible IMEX fluid simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Spatial dimension. Only 2 is supported.
    pub dimension: usize,
    /// Dynamic viscosity mu (the pressure block is non-normalized).
    pub viscosity: f64,
    /// Fluid density.
    pub rho: f64,
    /// Grad-Div stabilization coefficient.
    pub gamma: f64,
    /// Pressure polynomial degree; velocity uses degree + 1 (Taylor-Hood).
    pub degree: usize,
    /// Time-step size.
    pub dt: f64,
    /// Simulation end time.
    pub end_time: f64,
    /// Relative tolerance of the outer linear solve.
    pub tolerance: f64,
    /// Iteration cap of the outer linear solve.
    pub max_iteration: usize,
    /// Refine the mesh every this many steps (0 disables adaptation).
    pub refinement_interval: u32,
    /// Output every this many steps (0 disables output).
    pub output_interval: u32,
    /// Coarsening never drops a cell below this refinement level.
    pub min_refine_level: u32,
    /// Refinement never pushes a cell above this level.
    pub max_refine_level: u32,
    /// Fraction of the total error indicator refined per adaptation.
    pub refine_fraction: f64,
    /// Fraction of the total error indicator coarsened per adaptation.
    pub coarsen_fraction: f64,
    /// Constant body force per unit mass (gravity).
    pub body_force: [f64; 2],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dimension: 2,
            viscosity: 1e-3,
            rho: 1.0,
            gamma: 1.0,
            degree: 1,
            dt: 1e-2,
            end_time: 1.0,
            tolerance: 1e-10,
            max_iteration: 2000,
            refinement_interval: 0,
            output_interval: 0,
            min_refine_level: 0,
            max_refine_level: 2,
            refine_fraction: 0.6,
            coarsen_fraction: 0.4,
            body_force: [0.0, 0.0],
        }
    }
}

impl SimulationConfig {
    /// Check startup preconditions. Violations are fatal and not
    /// recoverable.
    pub fn validate(&self) -> Result<()> {
        if self.dimension != 2 {
            return Err(Error::Config(format!(
                "unsupported spatial dimension {} (only 2 is supported)",
                self.dimension
            )));
        }
        if self.degree != 1 {
            return Err(Error::Config(format!(
                "unsupported pressure degree {} (Taylor-Hood Q2/Q1 requires degree 1)",
                self.degree
            )));
        }
        if self.viscosity <= 0.0 || self.rho <= 0.0 {
            return Err(Error::Config(
                "viscosity and density must be positive".into(),
            ));
        }
        if self.dt <= 0.0 || self.end_time <= 0.0 {
            return Err(Error::Config("dt and end_time must be positive".into()));
        }
        if self.min_refine_level > self.max_refine_level {
            return Err(Error::Config(format!(
                "min_refine_level {} exceeds max_refine_level {}",
                self.min_refine_level, self.max_refine_level
            )));
        }
        if !(0.0..=1.0).contains(&self.refine_fraction)
            || !(0.0..=1.0).contains(&self.coarsen_fraction)
        {
            return Err(Error::Config(
                "refine/coarsen fractions must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unsupported_dimension_rejected() {
        let config = SimulationConfig {
            dimension: 3,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_negative_viscosity_rejected() {
        let config = SimulationConfig {
            viscosity: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_level_bounds_checked() {
        let config = SimulationConfig {
            min_refine_level: 3,
            max_refine_level: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
