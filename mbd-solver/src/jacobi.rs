//! Projected Jacobi iteration.

use tracing::trace;

use crate::descriptor::SystemDescriptor;
use crate::solver::{project_multiplier, seed_multipliers, CcpSolver, SolveStats};
use crate::sor::iterative_accessors;

/// Projected Jacobi: every row's update is computed against the frozen
/// iterate, then all deltas are applied together.
///
/// Simultaneous updates overshoot on coupled rows, so the default
/// relaxation is far below 1; raise it only for weakly coupled systems.
#[derive(Debug, Clone)]
pub struct ProjectedJacobi {
    max_iterations: usize,
    tolerance: f64,
    omega: f64,
    lambda: f64,
    warm_start: bool,
    stats: SolveStats,
    deltas: Vec<f64>,
}

impl Default for ProjectedJacobi {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            omega: 0.2,
            lambda: 1.0,
            warm_start: false,
            stats: SolveStats::default(),
            deltas: Vec::new(),
        }
    }
}

impl CcpSolver for ProjectedJacobi {
    fn solve(&mut self, descriptor: &mut SystemDescriptor) -> SolveStats {
        descriptor.build_unconstrained();
        seed_multipliers(descriptor, self.warm_start);

        let n = descriptor.n_rows();
        self.deltas.resize(n, 0.0);
        let mut stats = SolveStats::default();
        for iter in 0..self.max_iterations {
            // Compute all deltas against the frozen iterate.
            for i in 0..n {
                let row = &descriptor.constraints()[i];
                self.deltas[i] = if row.active {
                    let candidate =
                        row.multiplier - self.omega * descriptor.row_residual(i) / row.g;
                    self.lambda * (project_multiplier(descriptor, i, candidate) - row.multiplier)
                } else {
                    0.0
                };
            }
            // Apply them together.
            let mut max_delta: f64 = 0.0;
            for i in 0..n {
                let delta = self.deltas[i];
                if delta != 0.0 {
                    descriptor.apply_row_impulse(i, delta);
                    descriptor.constraints_mut()[i].multiplier += delta;
                }
                max_delta = max_delta.max(delta.abs());
            }
            stats.iterations = iter + 1;
            stats.residual = max_delta;
            if max_delta < self.tolerance {
                stats.converged = true;
                break;
            }
        }
        trace!(
            iterations = stats.iterations,
            residual = stats.residual,
            "projected Jacobi finished"
        );
        self.stats = stats;
        stats
    }

    iterative_accessors!();
}
