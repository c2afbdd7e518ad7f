//! Dense direct strategy with a bounded active-set loop.

use nalgebra::{DMatrix, DVector};
use tracing::{trace, warn};

use crate::constraints::ConstraintMode;
use crate::descriptor::SystemDescriptor;
use crate::solver::{CcpSolver, SolveStats};

const ACTIVATION_EPS: f64 = 1e-10;

/// Dense Schur-complement direct solve with a bounded active-set loop over
/// the unilateral rows.
///
/// The non-iterative strategy of the family: it assembles the full `H`
/// matrix (mass blocks plus any tangent-operator blocks — this is the only
/// strategy that consumes them), solves the equality-constrained system for
/// a trial active set, and swaps rows in or out until the set is
/// complementarity-consistent or the swap budget runs out. Friction rows
/// are solved as equalities and clamped to their cone in a final pass.
///
/// Intended for small, mostly-bilateral systems (statics, assembly); cost
/// grows cubically with system size.
#[derive(Debug, Clone)]
pub struct ActiveSetDirect {
    max_swaps: usize,
    stats: SolveStats,
}

impl Default for ActiveSetDirect {
    fn default() -> Self {
        Self {
            max_swaps: 64,
            stats: SolveStats::default(),
        }
    }
}

impl ActiveSetDirect {
    fn assemble_h(descriptor: &SystemDescriptor, n: usize) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(n, n);
        for block in descriptor.variables() {
            block.mass.add_to_dense(&mut h, block.offset);
        }
        for krm in descriptor.krm_blocks() {
            // Offsets of each spanned block; a block whose owner did not
            // inject this cycle invalidates the whole contribution.
            let mut offsets = Vec::with_capacity(krm.keys.len());
            let mut dofs = Vec::with_capacity(krm.keys.len());
            let mut resolved = true;
            for key in &krm.keys {
                match descriptor.variable_index(*key) {
                    Some(idx) => {
                        offsets.push(descriptor.variables()[idx].offset);
                        dofs.push(descriptor.variables()[idx].dof());
                    }
                    None => {
                        resolved = false;
                        break;
                    }
                }
            }
            if !resolved {
                continue;
            }
            let mut row_base = 0;
            for (bi, &off_r) in offsets.iter().enumerate() {
                let mut col_base = 0;
                for (bj, &off_c) in offsets.iter().enumerate() {
                    for r in 0..dofs[bi] {
                        for c in 0..dofs[bj] {
                            h[(off_r + r, off_c + c)] += krm.matrix[(row_base + r, col_base + c)];
                        }
                    }
                    col_base += dofs[bj];
                }
                row_base += dofs[bi];
            }
        }
        h
    }

    /// Dense jacobian row `i` over the full unknown vector.
    fn dense_row(descriptor: &SystemDescriptor, i: usize, n: usize) -> DVector<f64> {
        let row = &descriptor.constraints()[i];
        let mut j = DVector::zeros(n);
        if let Some(a) = row.idx_a {
            let off = descriptor.variables()[a].offset;
            for k in 0..row.jac_a.len() {
                j[off + k] = row.jac_a[k];
            }
        }
        if let (Some(b), Some(jac_b)) = (row.idx_b, row.jac_b.as_ref()) {
            let off = descriptor.variables()[b].offset;
            for k in 0..jac_b.len() {
                j[off + k] = jac_b[k];
            }
        }
        j
    }

    fn write_back(descriptor: &mut SystemDescriptor, v: &DVector<f64>, l: &DVector<f64>) {
        for block in descriptor.variables_mut() {
            let off = block.offset;
            for k in 0..block.dof() {
                block.qb[k] = v[off + k];
            }
        }
        for (i, row) in descriptor.constraints_mut().iter_mut().enumerate() {
            row.multiplier = l[i];
        }
    }
}

impl CcpSolver for ActiveSetDirect {
    #[allow(clippy::too_many_lines)]
    fn solve(&mut self, descriptor: &mut SystemDescriptor) -> SolveStats {
        let n = descriptor.n_variable_scalars();
        let m = descriptor.n_rows();
        descriptor.build_unconstrained();

        let h = Self::assemble_h(descriptor, n);
        let mut fb = DVector::zeros(n);
        for block in descriptor.variables() {
            let off = block.offset;
            for k in 0..block.dof() {
                fb[off + k] = block.fb[k];
            }
        }

        let h_lu = h.lu();
        let Some(v0) = h_lu.solve(&fb) else {
            warn!("direct strategy: singular system matrix, leaving unconstrained solution");
            self.stats = SolveStats::default();
            return self.stats;
        };

        if m == 0 {
            let l = DVector::zeros(0);
            Self::write_back(descriptor, &v0, &l);
            let stats = SolveStats {
                iterations: 0,
                residual: 0.0,
                converged: true,
            };
            self.stats = stats;
            return stats;
        }

        // Precompute W_i = H^-1 J_iᵀ for every row that can act.
        let rows: Vec<DVector<f64>> = (0..m).map(|i| Self::dense_row(descriptor, i, n)).collect();
        let w: Vec<Option<DVector<f64>>> = rows
            .iter()
            .enumerate()
            .map(|(i, j)| {
                if descriptor.constraints()[i].active {
                    h_lu.solve(j)
                } else {
                    None
                }
            })
            .collect();

        let mut in_set: Vec<bool> = (0..m)
            .map(|i| descriptor.constraints()[i].active && w[i].is_some())
            .collect();
        let mut l = DVector::zeros(m);
        let mut v = v0.clone();
        let mut swaps = 0;
        let mut converged = false;

        while swaps < self.max_swaps {
            swaps += 1;
            let active: Vec<usize> = (0..m).filter(|&i| in_set[i]).collect();
            if active.is_empty() {
                v = v0.clone();
                l.fill(0.0);
            } else {
                let a = active.len();
                let mut schur = DMatrix::zeros(a, a);
                let mut rhs = DVector::zeros(a);
                for (p, &i) in active.iter().enumerate() {
                    for (q, &j) in active.iter().enumerate() {
                        if let Some(wj) = &w[j] {
                            schur[(p, q)] = rows[i].dot(wj);
                        }
                    }
                    schur[(p, p)] += descriptor.constraints()[i].cfm + 1e-12;
                    rhs[p] = -(rows[i].dot(&v0) + descriptor.constraints()[i].rhs);
                }
                let Some(l_active) = schur.lu().solve(&rhs) else {
                    warn!("direct strategy: singular Schur complement, giving up");
                    break;
                };
                l.fill(0.0);
                v = v0.clone();
                for (p, &i) in active.iter().enumerate() {
                    l[i] = l_active[p];
                    if let Some(wi) = &w[i] {
                        v += wi * l_active[p];
                    }
                }
            }

            // Complementarity bookkeeping: release pushing-the-wrong-way
            // unilateral rows first, then admit violated ones.
            let mut worst: Option<(usize, f64)> = None;
            for i in 0..m {
                if !matches!(descriptor.constraints()[i].mode, ConstraintMode::Unilateral) {
                    continue;
                }
                if in_set[i] && l[i] < -ACTIVATION_EPS {
                    if worst.is_none_or(|(_, s)| l[i] < s) {
                        worst = Some((i, l[i]));
                    }
                }
            }
            if let Some((i, _)) = worst {
                in_set[i] = false;
                continue;
            }
            for i in 0..m {
                if !matches!(descriptor.constraints()[i].mode, ConstraintMode::Unilateral)
                    || in_set[i]
                    || w[i].is_none()
                {
                    continue;
                }
                let gap = rows[i].dot(&v) + descriptor.constraints()[i].rhs;
                if gap < -ACTIVATION_EPS {
                    if worst.is_none_or(|(_, s)| gap < s) {
                        worst = Some((i, gap));
                    }
                }
            }
            if let Some((i, _)) = worst {
                in_set[i] = true;
                continue;
            }
            converged = true;
            break;
        }

        // Friction rows were solved as equalities: clamp to the cone and
        // re-apply the clamped impulses once.
        let mut clamped = false;
        for i in 0..m {
            if let ConstraintMode::Friction { cone, mu } = descriptor.constraints()[i].mode {
                let limit = mu * l[cone].max(0.0);
                let clipped = l[i].clamp(-limit, limit);
                if clipped != l[i] {
                    l[i] = clipped;
                    clamped = true;
                }
            }
        }
        if clamped {
            v = v0.clone();
            for i in 0..m {
                if l[i] != 0.0 {
                    if let Some(wi) = &w[i] {
                        v += wi * l[i];
                    }
                }
            }
        }

        let mut residual: f64 = 0.0;
        for i in 0..m {
            if in_set[i] && matches!(descriptor.constraints()[i].mode, ConstraintMode::Bilateral) {
                residual = residual.max((rows[i].dot(&v) + descriptor.constraints()[i].rhs).abs());
            }
        }

        Self::write_back(descriptor, &v, &l);
        let stats = SolveStats {
            iterations: swaps,
            residual,
            converged,
        };
        trace!(swaps, residual, converged, "active-set direct finished");
        self.stats = stats;
        stats
    }

    fn set_max_iterations(&mut self, max_iterations: usize) {
        self.max_swaps = max_iterations.max(1);
    }

    fn last_stats(&self) -> SolveStats {
        self.stats
    }
}
