//! Solver and stepping configuration.
//!
//! Defaults match the reference tuning of the kernel: a 40 ms step, a
//! SOR-family speed solver at 30 iterations, and a 10-iteration
//! stabilization pass.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The closed set of interchangeable complementarity solver strategies.
///
/// Selecting a kind rebuilds both the speed and the stabilization solver
/// instances; see the system coordinator for the dispatch contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolverKind {
    /// Projected successive over-relaxation sweep.
    #[default]
    ProjectedSor,
    /// Symmetric SOR: forward plus backward sweep per iteration.
    ProjectedSymmSor,
    /// Projected Jacobi; all row updates applied together, under-relaxed.
    ProjectedJacobi,
    /// Accelerated projected gradient descent on the dual cone problem.
    ProjectedApgd,
    /// Dense Schur-complement direct solve with a bounded active-set loop.
    ActiveSetDirect,
    /// Rayon-parallel batched variant of the relaxation sweep.
    ProjectedSorMultithread,
}

/// Per-step integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntegrationScheme {
    /// Single combined velocity-level solve with penetration recovery baked
    /// into the right-hand side, then first-order position update.
    #[default]
    Anitescu,
    /// Velocity-level solve without positional stabilization, followed by a
    /// separate position-correction solve.
    Tasora,
}

/// Step-size adaption policy for the multi-step drivers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StepAdaption {
    /// The configured step is restored after any frame-boundary shrink.
    #[default]
    Fixed,
    /// The step may stay at whatever the last frame boundary forced, within
    /// the given bounds.
    Bounded {
        /// Smallest admissible step.
        min: f64,
        /// Largest admissible step.
        max: f64,
    },
}

/// Configuration pushed into the active solver instances before each solve.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverSettings {
    /// Iteration budget for the velocity-level ("speed") solve.
    pub max_iterations_speed: usize,
    /// Iteration budget for the position-stabilization solve.
    pub max_iterations_stab: usize,
    /// Convergence tolerance for position-level solves.
    pub tolerance: f64,
    /// Convergence tolerance for velocity-level solves.
    pub tolerance_speeds: f64,
    /// Over-relaxation factor for the relaxation family (0, 2).
    pub omega: f64,
    /// Multiplier-update smoothing for smoothed complementarity variants
    /// (1.0 = no smoothing).
    pub sharpness_lambda: f64,
    /// Seed iterative solves with the previous step's multipliers.
    pub warm_start: bool,
    /// Worker threads for parallel solver variants.
    pub threads: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations_speed: 30,
            max_iterations_stab: 10,
            tolerance: 2e-4,
            tolerance_speeds: 1e-6,
            omega: 1.0,
            sharpness_lambda: 1.0,
            warm_start: false,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

impl SolverSettings {
    /// High-accuracy preset: larger budgets, tighter tolerances.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            max_iterations_speed: 200,
            max_iterations_stab: 50,
            tolerance: 1e-8,
            tolerance_speeds: 1e-10,
            ..Default::default()
        }
    }

    /// Set the over-relaxation factor.
    #[must_use]
    pub const fn with_omega(mut self, omega: f64) -> Self {
        self.omega = omega;
        self
    }

    /// Enable or disable warm starting.
    #[must_use]
    pub const fn with_warm_start(mut self, enabled: bool) -> Self {
        self.warm_start = enabled;
        self
    }

    /// Validate ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if self.omega <= 0.0 || self.omega >= 2.0 {
            return Err(crate::MbdError::invalid_config(
                "omega must be in range (0, 2)",
            ));
        }
        if !(0.0..=1.0).contains(&self.sharpness_lambda) {
            return Err(crate::MbdError::invalid_config(
                "sharpness lambda must be in range [0, 1]",
            ));
        }
        if self.tolerance <= 0.0 || self.tolerance_speeds <= 0.0 {
            return Err(crate::MbdError::invalid_config("tolerances must be positive"));
        }
        if self.threads == 0 {
            return Err(crate::MbdError::invalid_config(
                "thread count must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Time stepping and stabilization configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepSettings {
    /// Nominal integration step (s).
    pub step: f64,
    /// Step adaption policy for the frame drivers.
    pub adaption: StepAdaption,
    /// End time for the whole-simulation drivers (s).
    pub end_time: f64,
    /// Newton iteration budget for assembly.
    pub max_iters_assembly: usize,
    /// Approach speeds below this produce no restitution bounce (m/s).
    pub min_bounce_speed: f64,
    /// Cap on the constraint-violation recovery speed injected by the
    /// Anitescu scheme (m/s, positive exiting).
    pub max_penetration_recovery_speed: f64,
    /// Upper bound on wake-up propagation passes per step.
    pub wake_up_passes: usize,
    /// Allow resting bodies to fall asleep.
    pub use_sleeping: bool,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            step: 0.04,
            adaption: StepAdaption::Fixed,
            end_time: 1.0,
            max_iters_assembly: 6,
            min_bounce_speed: 0.15,
            max_penetration_recovery_speed: 0.6,
            wake_up_passes: 4,
            use_sleeping: false,
        }
    }
}

impl StepSettings {
    /// Validate ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.step > 0.0 && self.step.is_finite()) {
            return Err(crate::MbdError::InvalidTimestep(self.step));
        }
        if self.max_penetration_recovery_speed < 0.0 {
            return Err(crate::MbdError::invalid_config(
                "penetration recovery speed cannot be negative",
            ));
        }
        if self.wake_up_passes == 0 {
            return Err(crate::MbdError::invalid_config(
                "wake-up pass budget must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SolverSettings::default().validate().is_ok());
        assert!(StepSettings::default().validate().is_ok());
    }

    #[test]
    fn test_solver_settings_rejects_bad_omega() {
        let s = SolverSettings::default().with_omega(2.5);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_step_settings_rejects_bad_step() {
        let s = StepSettings {
            step: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            s.validate(),
            Err(crate::MbdError::InvalidTimestep(_))
        ));
    }

    #[test]
    fn test_default_strategy_is_sor() {
        assert_eq!(SolverKind::default(), SolverKind::ProjectedSor);
        assert_eq!(IntegrationScheme::default(), IntegrationScheme::Anitescu);
    }
}
