//! The global block index: every variable and constraint block of the
//! system, gathered once per solve.
//!
//! Items register their blocks between [`SystemDescriptor::begin_insertion`]
//! and [`SystemDescriptor::end_insertion`]; ending insertion resolves the
//! constraint rows' variable keys to block indices, caches per-row effective
//! masses, and assigns contiguous global offsets (variables first, then
//! constraint rows) in insertion order. Insertion order therefore fully
//! determines the offsets — keep it stable run-to-run.

use hashbrown::HashMap;
use nalgebra::{DMatrix, DVector};

use crate::constraints::{ConstraintBlock, ConstraintMode};
use crate::variables::{VariableBlock, VariableKey};

/// A dense tangent-operator contribution (stiffness/damping/mass) spanning
/// one or more variable blocks, loaded by items that have one (e.g. finite
/// elements) as `K*kf + R*rf + M*mf`.
///
/// Only non-Schur strategies consume these; the relaxation family ignores
/// them.
#[derive(Debug, Clone)]
pub struct KrmBlock {
    /// The variable blocks this matrix spans, in row/column order.
    pub keys: Vec<VariableKey>,
    /// The combined dense matrix; square, sized to the summed DOF of `keys`.
    pub matrix: DMatrix<f64>,
}

/// Constraint-violation diagnostics over the currently assembled rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationReport {
    /// Max |C| over bilateral rows, max(0, -C) over unilateral rows.
    pub residual: f64,
    /// Max |l * C| over unilateral rows.
    pub complementarity: f64,
}

/// The assembled global system: an ordered, indexable collection of every
/// active item's blocks.
#[derive(Debug, Default)]
pub struct SystemDescriptor {
    variables: Vec<VariableBlock>,
    constraints: Vec<ConstraintBlock>,
    krm: Vec<KrmBlock>,
    index: HashMap<VariableKey, usize>,
    n_variable_scalars: usize,
    sealed: bool,
    threads: usize,
}

impl SystemDescriptor {
    /// Create an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: 1,
            ..Default::default()
        }
    }

    /// Set the worker-thread count hint for parallel strategies.
    pub fn set_threads(&mut self, threads: usize) {
        self.threads = threads.max(1);
    }

    /// Worker-thread count hint.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Clear all block lists and reopen the descriptor for insertion.
    pub fn begin_insertion(&mut self) {
        self.variables.clear();
        self.constraints.clear();
        self.krm.clear();
        self.index.clear();
        self.n_variable_scalars = 0;
        self.sealed = false;
    }

    /// Register a variable block; returns its index.
    ///
    /// # Panics
    ///
    /// Panics if insertion is not open, or if the key was already inserted
    /// this cycle (an item injected twice).
    pub fn insert_variable(&mut self, block: VariableBlock) -> usize {
        assert!(!self.sealed, "insert_variable outside an insertion cycle");
        let idx = self.variables.len();
        let prev = self.index.insert(block.key, idx);
        assert!(prev.is_none(), "variable key injected twice");
        self.variables.push(block);
        idx
    }

    /// Register a constraint row; returns its index.
    ///
    /// # Panics
    ///
    /// Panics if insertion is not open.
    pub fn insert_constraint(&mut self, row: ConstraintBlock) -> usize {
        assert!(!self.sealed, "insert_constraint outside an insertion cycle");
        let idx = self.constraints.len();
        self.constraints.push(row);
        idx
    }

    /// Register a tangent-operator block.
    pub fn insert_krm(&mut self, block: KrmBlock) {
        assert!(!self.sealed, "insert_krm outside an insertion cycle");
        self.krm.push(block);
    }

    /// Seal the descriptor: resolve row keys, assign offsets, cache
    /// per-row effective masses.
    pub fn end_insertion(&mut self) {
        let mut offset = 0;
        for block in &mut self.variables {
            block.offset = offset;
            offset += block.dof();
        }
        self.n_variable_scalars = offset;

        for (i, row) in self.constraints.iter_mut().enumerate() {
            row.offset = self.n_variable_scalars + i;
            row.idx_a = self.index.get(&row.var_a).copied();
            row.idx_b = row.var_b.and_then(|k| self.index.get(&k).copied());

            let mut g = row.cfm;
            if let Some(a) = row.idx_a {
                let minv_j = self.variables[a].mass.apply_inv(&row.jac_a);
                g += row.jac_a.dot(&minv_j);
            }
            if let (Some(b), Some(jac_b)) = (row.idx_b, row.jac_b.as_ref()) {
                let minv_j = self.variables[b].mass.apply_inv(jac_b);
                g += jac_b.dot(&minv_j);
            }
            row.g = g;
            row.active = g > 0.0 && (row.idx_a.is_some() || row.idx_b.is_some());
        }
        self.sealed = true;
    }

    /// All variable blocks, injection order.
    #[must_use]
    pub fn variables(&self) -> &[VariableBlock] {
        &self.variables
    }

    /// Mutable access to the variable blocks.
    pub fn variables_mut(&mut self) -> &mut [VariableBlock] {
        &mut self.variables
    }

    /// All constraint rows, injection order.
    #[must_use]
    pub fn constraints(&self) -> &[ConstraintBlock] {
        &self.constraints
    }

    /// Mutable access to the constraint rows.
    pub fn constraints_mut(&mut self) -> &mut [ConstraintBlock] {
        &mut self.constraints
    }

    /// The tangent-operator blocks.
    #[must_use]
    pub fn krm_blocks(&self) -> &[KrmBlock] {
        &self.krm
    }

    /// Total scalar unknowns over all variable blocks.
    #[must_use]
    pub fn n_variable_scalars(&self) -> usize {
        self.n_variable_scalars
    }

    /// Number of constraint rows.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.constraints.len()
    }

    /// Total scalar slots (unknowns plus multipliers) with assigned offsets.
    #[must_use]
    pub fn n_scalars(&self) -> usize {
        self.n_variable_scalars + self.constraints.len()
    }

    /// Look up a variable block by key.
    #[must_use]
    pub fn variable(&self, key: VariableKey) -> Option<&VariableBlock> {
        self.index.get(&key).map(|&i| &self.variables[i])
    }

    /// Resolved block index of a key, if its owner injected this cycle.
    #[must_use]
    pub fn variable_index(&self, key: VariableKey) -> Option<usize> {
        self.index.get(&key).copied()
    }

    /// Set every block's solution slot to the unconstrained velocity
    /// `qb = M^-1 fb`.
    pub fn build_unconstrained(&mut self) {
        for block in &mut self.variables {
            block.qb = block.mass.apply_inv(&block.fb);
        }
    }

    /// Relative velocity of row `i` under the current iterate: `J qb`.
    #[must_use]
    pub fn row_velocity(&self, i: usize) -> f64 {
        let row = &self.constraints[i];
        let mut v = 0.0;
        if let Some(a) = row.idx_a {
            v += row.jac_a.dot(&self.variables[a].qb);
        }
        if let (Some(b), Some(jac_b)) = (row.idx_b, row.jac_b.as_ref()) {
            v += jac_b.dot(&self.variables[b].qb);
        }
        v
    }

    /// Residual of row `i`: `J qb + b + cfm l`.
    #[must_use]
    pub fn row_residual(&self, i: usize) -> f64 {
        let row = &self.constraints[i];
        self.row_velocity(i) + row.rhs + row.cfm * row.multiplier
    }

    /// Apply an impulse `delta` along row `i` to the coupled blocks:
    /// `qb += M^-1 Jᵀ delta`.
    pub fn apply_row_impulse(&mut self, i: usize, delta: f64) {
        if delta == 0.0 {
            return;
        }
        let (idx_a, idx_b) = (self.constraints[i].idx_a, self.constraints[i].idx_b);
        if let Some(a) = idx_a {
            let jac = &self.constraints[i].jac_a;
            let dq = self.variables[a].mass.apply_inv(&(jac * delta));
            self.variables[a].qb += dq;
        }
        if let Some(b) = idx_b {
            if let Some(jac_b) = self.constraints[i].jac_b.clone() {
                let dq = self.variables[b].mass.apply_inv(&(jac_b * delta));
                self.variables[b].qb += dq;
            }
        }
    }

    /// Schur-operator product over the multipliers:
    /// `out = J M^-1 Jᵀ l + cfm .* l`.
    ///
    /// Used by the gradient strategies, which work on the dual problem.
    pub fn schur_product(&self, l: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(l.len(), self.constraints.len());
        debug_assert_eq!(out.len(), self.constraints.len());

        // Accumulate Jᵀ l per variable block, push through M^-1 once.
        let mut acc: Vec<DVector<f64>> = self
            .variables
            .iter()
            .map(|b| DVector::zeros(b.dof()))
            .collect();
        for (i, row) in self.constraints.iter().enumerate() {
            if !row.active || l[i] == 0.0 {
                continue;
            }
            if let Some(a) = row.idx_a {
                acc[a] += &row.jac_a * l[i];
            }
            if let (Some(b), Some(jac_b)) = (row.idx_b, row.jac_b.as_ref()) {
                acc[b] += jac_b * l[i];
            }
        }
        for (block, v) in self.variables.iter().zip(acc.iter_mut()) {
            *v = block.mass.apply_inv(v);
        }
        for (i, row) in self.constraints.iter().enumerate() {
            let mut y = row.cfm * l[i];
            if row.active {
                if let Some(a) = row.idx_a {
                    y += row.jac_a.dot(&acc[a]);
                }
                if let (Some(b), Some(jac_b)) = (row.idx_b, row.jac_b.as_ref()) {
                    y += jac_b.dot(&acc[b]);
                }
            }
            out[i] = y;
        }
    }

    /// Constraint-violation diagnostics from the violations recorded at
    /// load time.
    #[must_use]
    pub fn violation_report(&self) -> ViolationReport {
        let mut report = ViolationReport::default();
        for row in &self.constraints {
            if !row.active {
                continue;
            }
            let res = match row.mode {
                ConstraintMode::Bilateral => row.violation.abs(),
                ConstraintMode::Unilateral => (-row.violation).max(0.0),
                ConstraintMode::Friction { .. } => 0.0,
            };
            report.residual = report.residual.max(res);
            if matches!(row.mode, ConstraintMode::Unilateral) {
                report.complementarity = report
                    .complementarity
                    .max((row.multiplier * row.violation).abs());
            }
        }
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::variables::MassOperator;
    use approx::assert_relative_eq;
    use mbd_types::{BodyId, Matrix3};

    fn body_block(id: u64, mass: f64) -> VariableBlock {
        VariableBlock::new(
            VariableKey::Body(BodyId::new(id)),
            MassOperator::rigid_body(mass, Matrix3::identity()),
        )
    }

    #[test]
    fn test_offsets_contiguous_from_zero() {
        let mut desc = SystemDescriptor::new();
        desc.begin_insertion();
        desc.insert_variable(body_block(0, 1.0));
        desc.insert_variable(body_block(1, 2.0));
        let row = ConstraintBlock::two_blocks(
            VariableKey::Body(BodyId::new(0)),
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            VariableKey::Body(BodyId::new(1)),
            DVector::from_vec(vec![-1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            ConstraintMode::Bilateral,
        );
        desc.insert_constraint(row);
        desc.end_insertion();

        assert_eq!(desc.variables()[0].offset, 0);
        assert_eq!(desc.variables()[1].offset, 6);
        assert_eq!(desc.constraints()[0].offset, 12);
        assert_eq!(desc.n_scalars(), 13);
    }

    #[test]
    fn test_effective_mass_two_unit_bodies() {
        let mut desc = SystemDescriptor::new();
        desc.begin_insertion();
        desc.insert_variable(body_block(0, 1.0));
        desc.insert_variable(body_block(1, 1.0));
        let row = ConstraintBlock::two_blocks(
            VariableKey::Body(BodyId::new(0)),
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            VariableKey::Body(BodyId::new(1)),
            DVector::from_vec(vec![-1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            ConstraintMode::Bilateral,
        );
        desc.insert_constraint(row);
        desc.end_insertion();

        // g = 1/m_a + 1/m_b = 2
        assert_relative_eq!(desc.constraints()[0].effective_mass(), 2.0, epsilon = 1e-12);
        assert!(desc.constraints()[0].is_active());
    }

    #[test]
    fn test_unresolved_side_drops_out() {
        let mut desc = SystemDescriptor::new();
        desc.begin_insertion();
        desc.insert_variable(body_block(0, 1.0));
        // Body 7 never injects (fixed): only side A contributes.
        let row = ConstraintBlock::two_blocks(
            VariableKey::Body(BodyId::new(0)),
            DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0]),
            VariableKey::Body(BodyId::new(7)),
            DVector::from_vec(vec![0.0, 0.0, -1.0, 0.0, 0.0, 0.0]),
            ConstraintMode::Unilateral,
        );
        desc.insert_constraint(row);
        desc.end_insertion();

        assert_relative_eq!(desc.constraints()[0].effective_mass(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_begin_insertion_idempotent() {
        let mut desc = SystemDescriptor::new();
        desc.begin_insertion();
        desc.insert_variable(body_block(0, 1.0));
        desc.begin_insertion();
        desc.begin_insertion();
        assert_eq!(desc.variables().len(), 0);
        desc.insert_variable(body_block(0, 1.0));
        desc.end_insertion();
        assert_eq!(desc.n_variable_scalars(), 6);
    }

    #[test]
    fn test_schur_product_matches_manual() {
        let mut desc = SystemDescriptor::new();
        desc.begin_insertion();
        desc.insert_variable(body_block(0, 2.0));
        let row = ConstraintBlock::one_block(
            VariableKey::Body(BodyId::new(0)),
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            ConstraintMode::Bilateral,
        );
        desc.insert_constraint(row);
        desc.end_insertion();

        let l = DVector::from_vec(vec![3.0]);
        let mut out = DVector::zeros(1);
        desc.schur_product(&l, &mut out);
        // N = J M^-1 Jᵀ = 1/2; N l = 1.5
        assert_relative_eq!(out[0], 1.5, epsilon = 1e-12);
    }
}
