//! Constraint blocks: scalar rows of the global jacobian.

use nalgebra::DVector;

use crate::variables::VariableKey;

/// Complementarity semantics of one constraint row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstraintMode {
    /// Equality row, multiplier unbounded.
    Bilateral,
    /// Inequality row, multiplier clamped to `l >= 0`.
    Unilateral,
    /// Tangential friction row, clamped to the box `[-mu l_n, +mu l_n]` of
    /// its governing normal row.
    Friction {
        /// Descriptor index of the normal row of this friction cone, set at
        /// injection time by the contact container.
        cone: usize,
        /// Friction coefficient.
        mu: f64,
    },
}

/// One scalar constraint row coupling up to two variable blocks.
///
/// Rows are built and owned by physics items, loaded with right-hand-side
/// terms by the assembly pass, and copied into the descriptor at injection.
/// A side whose key does not resolve (fixed or sleeping endpoint) simply
/// drops out of the row.
#[derive(Debug, Clone)]
pub struct ConstraintBlock {
    /// First coupled block.
    pub var_a: VariableKey,
    /// Second coupled block, if any.
    pub var_b: Option<VariableKey>,
    /// Jacobian segment over `var_a`'s DOF.
    pub jac_a: DVector<f64>,
    /// Jacobian segment over `var_b`'s DOF.
    pub jac_b: Option<DVector<f64>>,
    /// Right-hand-side term `b_i` (violation recovery, rheonomic rate,
    /// restitution bias).
    pub rhs: f64,
    /// Multiplier slot `l_i`; nonzero on entry seeds warm starting.
    pub multiplier: f64,
    /// Constraint-force mixing (compliance regularization).
    pub cfm: f64,
    /// Raw constraint violation `C` recorded at load time, for feasibility
    /// diagnostics; never consumed by the solvers.
    pub violation: f64,
    /// Complementarity semantics.
    pub mode: ConstraintMode,

    // Resolved by the descriptor at end_insertion.
    pub(crate) idx_a: Option<usize>,
    pub(crate) idx_b: Option<usize>,
    pub(crate) g: f64,
    pub(crate) active: bool,
    /// Global scalar offset assigned at injection.
    pub offset: usize,
}

impl ConstraintBlock {
    /// Create a two-block row.
    #[must_use]
    pub fn two_blocks(
        var_a: VariableKey,
        jac_a: DVector<f64>,
        var_b: VariableKey,
        jac_b: DVector<f64>,
        mode: ConstraintMode,
    ) -> Self {
        Self {
            var_a,
            var_b: Some(var_b),
            jac_a,
            jac_b: Some(jac_b),
            rhs: 0.0,
            multiplier: 0.0,
            cfm: 0.0,
            violation: 0.0,
            mode,
            idx_a: None,
            idx_b: None,
            g: 0.0,
            active: false,
            offset: 0,
        }
    }

    /// Create a row coupling a single block.
    #[must_use]
    pub fn one_block(var_a: VariableKey, jac_a: DVector<f64>, mode: ConstraintMode) -> Self {
        Self {
            var_a,
            var_b: None,
            jac_a,
            jac_b: None,
            rhs: 0.0,
            multiplier: 0.0,
            cfm: 0.0,
            violation: 0.0,
            mode,
            idx_a: None,
            idx_b: None,
            g: 0.0,
            active: false,
            offset: 0,
        }
    }

    /// Zero the bookkeeping accumulators (`rhs`, recorded violation).
    ///
    /// The multiplier slot survives the reset: it is the warm-start cache.
    pub fn bi_reset(&mut self) {
        self.rhs = 0.0;
        self.violation = 0.0;
    }

    /// Whether this row took part in the last solve.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The per-row effective mass `J M^-1 Jᵀ + cfm`, valid after injection.
    #[must_use]
    pub fn effective_mass(&self) -> f64 {
        self.g
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use mbd_types::BodyId;

    #[test]
    fn test_bi_reset_preserves_multiplier() {
        let mut row = ConstraintBlock::one_block(
            VariableKey::Body(BodyId::new(0)),
            DVector::from_vec(vec![1.0; 6]),
            ConstraintMode::Bilateral,
        );
        row.rhs = 0.5;
        row.violation = 0.1;
        row.multiplier = 2.0;
        row.bi_reset();
        assert_eq!(row.rhs, 0.0);
        assert_eq!(row.violation, 0.0);
        assert_eq!(row.multiplier, 2.0);
    }
}
