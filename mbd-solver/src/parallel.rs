//! Rayon-parallel batched relaxation.

use rayon::prelude::*;
use tracing::trace;

use crate::constraints::ConstraintMode;
use crate::descriptor::SystemDescriptor;
use crate::solver::{seed_multipliers, CcpSolver, SolveStats};

/// Batched parallel relaxation: per iteration, all row deltas are computed
/// concurrently against the frozen iterate, then applied sequentially in
/// row order.
///
/// The apply pass is sequential on purpose: it keeps the result bitwise
/// identical run-to-run regardless of the worker count, which the stepping
/// coordinator relies on for reproducibility. Like plain Jacobi this wants
/// under-relaxation; the thread count only changes wall-clock time.
#[derive(Debug, Clone)]
pub struct ProjectedSorMultithread {
    max_iterations: usize,
    tolerance: f64,
    omega: f64,
    lambda: f64,
    warm_start: bool,
    threads: usize,
    stats: SolveStats,
}

impl Default for ProjectedSorMultithread {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            omega: 0.2,
            lambda: 1.0,
            warm_start: false,
            threads: 1,
            stats: SolveStats::default(),
        }
    }
}

impl CcpSolver for ProjectedSorMultithread {
    fn solve(&mut self, descriptor: &mut SystemDescriptor) -> SolveStats {
        descriptor.build_unconstrained();
        seed_multipliers(descriptor, self.warm_start);

        let n = descriptor.n_rows();
        let mut deltas = vec![0.0f64; n];
        let mut stats = SolveStats::default();
        let omega = self.omega;
        let lambda = self.lambda;

        for iter in 0..self.max_iterations {
            {
                let desc = &*descriptor;
                deltas.par_iter_mut().enumerate().for_each(|(i, delta)| {
                    let row = &desc.constraints()[i];
                    if !row.active {
                        *delta = 0.0;
                        return;
                    }
                    let candidate = row.multiplier - omega * desc.row_residual(i) / row.g;
                    let projected = match row.mode {
                        ConstraintMode::Bilateral => candidate,
                        ConstraintMode::Unilateral => candidate.max(0.0),
                        ConstraintMode::Friction { cone, mu } => {
                            let limit = mu * desc.constraints()[cone].multiplier.max(0.0);
                            candidate.clamp(-limit, limit)
                        }
                    };
                    *delta = lambda * (projected - row.multiplier);
                });
            }

            let mut max_delta: f64 = 0.0;
            for (i, &delta) in deltas.iter().enumerate() {
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
            threads = self.threads,
            "parallel relaxation finished"
        );
        self.stats = stats;
        stats
    }

    fn set_max_iterations(&mut self, max_iterations: usize) {
        self.max_iterations = max_iterations;
    }

    fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn set_warm_start(&mut self, warm_start: bool) {
        self.warm_start = warm_start;
    }

    fn set_omega(&mut self, omega: f64) {
        self.omega = omega;
    }

    fn set_sharpness_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    fn set_threads(&mut self, threads: usize) {
        self.threads = threads.max(1);
    }

    fn last_stats(&self) -> SolveStats {
        self.stats
    }
}
