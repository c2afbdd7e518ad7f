//! Variable blocks: per-item unknowns and their mass operators.

use mbd_types::{BodyId, ItemId, Matrix3};
use nalgebra::DVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable identity of a variable block across injection cycles.
///
/// Constraint rows name the blocks they couple through these keys; the
/// descriptor resolves keys to block indices when insertion ends. A key that
/// does not resolve simply means the owning item did not inject this cycle
/// (fixed or sleeping), and that side of the row contributes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VariableKey {
    /// The 6-DOF block of a rigid body.
    Body(BodyId),
    /// The `slot`-th block of a generic physics item.
    Item(ItemId, u32),
}

/// The mass operator of one variable block.
///
/// For a rigid body no 6x6 matrix is ever built: the scalar mass and the 3x3
/// inertia (with cached inverses) are enough, and the products are unrolled
/// over the linear and angular halves.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MassOperator {
    /// 6-DOF rigid body: scalar mass plus world-frame inertia tensor.
    RigidBody {
        /// Translational mass.
        mass: f64,
        /// Rotational inertia, world frame.
        inertia: Matrix3<f64>,
        /// Cached 1/mass (0 for infinite mass).
        inv_mass: f64,
        /// Cached inertia inverse (zero matrix if singular).
        inv_inertia: Matrix3<f64>,
    },
    /// Diagonal (lumped) mass, arbitrary DOF count.
    Diagonal(DVector<f64>),
    /// Dense mass matrix with its cached inverse.
    Dense {
        /// Mass matrix.
        m: nalgebra::DMatrix<f64>,
        /// Cached inverse.
        inv: nalgebra::DMatrix<f64>,
    },
}

impl MassOperator {
    /// Build a rigid-body operator, caching the inverses.
    #[must_use]
    pub fn rigid_body(mass: f64, inertia: Matrix3<f64>) -> Self {
        let inv_mass = if mass > 0.0 && mass.is_finite() {
            1.0 / mass
        } else {
            0.0
        };
        let inv_inertia = inertia.try_inverse().unwrap_or_else(Matrix3::zeros);
        Self::RigidBody {
            mass,
            inertia,
            inv_mass,
            inv_inertia,
        }
    }

    /// Build a diagonal operator from lumped masses.
    #[must_use]
    pub fn diagonal(masses: DVector<f64>) -> Self {
        Self::Diagonal(masses)
    }

    /// Build a dense operator.
    ///
    /// A singular matrix yields a zero inverse: the block absorbs impulses
    /// without moving, like a fixed body.
    #[must_use]
    pub fn dense(m: nalgebra::DMatrix<f64>) -> Self {
        let inv = m
            .clone()
            .try_inverse()
            .unwrap_or_else(|| nalgebra::DMatrix::zeros(m.nrows(), m.ncols()));
        Self::Dense { m, inv }
    }

    /// Degrees of freedom this operator acts on.
    #[must_use]
    pub fn dof(&self) -> usize {
        match self {
            Self::RigidBody { .. } => 6,
            Self::Diagonal(d) => d.len(),
            Self::Dense { m, .. } => m.nrows(),
        }
    }

    /// result = M^-1 * v
    #[must_use]
    pub fn apply_inv(&self, v: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(v.len(), self.dof());
        match self {
            Self::RigidBody {
                inv_mass,
                inv_inertia,
                ..
            } => {
                let mut out = DVector::zeros(6);
                let lin = *inv_mass * v.fixed_rows::<3>(0);
                let ang = inv_inertia * v.fixed_rows::<3>(3);
                out.fixed_rows_mut::<3>(0).copy_from(&lin);
                out.fixed_rows_mut::<3>(3).copy_from(&ang);
                out
            }
            Self::Diagonal(d) => DVector::from_fn(d.len(), |i, _| {
                if d[i] > 0.0 {
                    v[i] / d[i]
                } else {
                    0.0
                }
            }),
            Self::Dense { inv, .. } => inv * v,
        }
    }

    /// out += M * v
    pub fn apply_inc(&self, out: &mut DVector<f64>, v: &DVector<f64>) {
        debug_assert_eq!(v.len(), self.dof());
        debug_assert_eq!(out.len(), self.dof());
        match self {
            Self::RigidBody { mass, inertia, .. } => {
                let lin = *mass * v.fixed_rows::<3>(0);
                let ang = inertia * v.fixed_rows::<3>(3);
                let mut o = out.fixed_rows_mut::<3>(0);
                o += lin;
                let mut o = out.fixed_rows_mut::<3>(3);
                o += ang;
            }
            Self::Diagonal(d) => {
                for i in 0..d.len() {
                    out[i] += d[i] * v[i];
                }
            }
            Self::Dense { m, .. } => {
                *out += m * v;
            }
        }
    }

    /// Add the operator into a dense matrix at the given diagonal offset.
    ///
    /// Used by the direct strategy, which assembles the full `H` matrix.
    pub fn add_to_dense(&self, h: &mut nalgebra::DMatrix<f64>, offset: usize) {
        match self {
            Self::RigidBody { mass, inertia, .. } => {
                for k in 0..3 {
                    h[(offset + k, offset + k)] += mass;
                }
                for r in 0..3 {
                    for c in 0..3 {
                        h[(offset + 3 + r, offset + 3 + c)] += inertia[(r, c)];
                    }
                }
            }
            Self::Diagonal(d) => {
                for i in 0..d.len() {
                    h[(offset + i, offset + i)] += d[i];
                }
            }
            Self::Dense { m, .. } => {
                for r in 0..m.nrows() {
                    for c in 0..m.ncols() {
                        h[(offset + r, offset + c)] += m[(r, c)];
                    }
                }
            }
        }
    }
}

/// One item's contribution of unknowns to the global system.
///
/// `fb` accumulates right-hand-side terms between `reset` and `solve`;
/// `qb` receives the solution (new velocities, or position corrections for
/// a stabilization solve). The `offset` is assigned by the descriptor when
/// insertion ends and is only meaningful until the next injection cycle.
#[derive(Debug, Clone)]
pub struct VariableBlock {
    /// Stable identity of this block.
    pub key: VariableKey,
    /// Mass operator.
    pub mass: MassOperator,
    /// Right-hand-side accumulator (forces/impulses).
    pub fb: DVector<f64>,
    /// Solution slot.
    pub qb: DVector<f64>,
    /// Global scalar offset assigned at injection.
    pub offset: usize,
}

impl VariableBlock {
    /// Create a zeroed block for the given key and mass operator.
    #[must_use]
    pub fn new(key: VariableKey, mass: MassOperator) -> Self {
        let dof = mass.dof();
        Self {
            key,
            mass,
            fb: DVector::zeros(dof),
            qb: DVector::zeros(dof),
            offset: 0,
        }
    }

    /// Degrees of freedom of this block.
    #[must_use]
    pub fn dof(&self) -> usize {
        self.mass.dof()
    }

    /// Zero the right-hand-side accumulator.
    pub fn fb_reset(&mut self) {
        self.fb.fill(0.0);
    }

    /// fb += M * qb (the `[M] v_old` term of the impulse formulation;
    /// call after loading the old velocity into `qb`).
    pub fn fb_increment_mq(&mut self) {
        let qb = self.qb.clone();
        self.mass.apply_inc(&mut self.fb, &qb);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use mbd_types::Vector3;

    #[test]
    fn test_rigid_body_apply_inv() {
        let op = MassOperator::rigid_body(2.0, Matrix3::from_diagonal(&Vector3::new(4.0, 4.0, 4.0)));
        let v = DVector::from_vec(vec![2.0, 0.0, 0.0, 0.0, 8.0, 0.0]);
        let out = op.apply_inv(&v);
        assert_relative_eq!(out[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(out[4], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rigid_body_apply_inc_roundtrip() {
        let op = MassOperator::rigid_body(3.0, Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0)));
        let v = DVector::from_vec(vec![1.0, -1.0, 0.5, 0.2, 0.1, -0.3]);
        let mut mv = DVector::zeros(6);
        op.apply_inc(&mut mv, &v);
        let back = op.apply_inv(&mv);
        assert_relative_eq!(back, v, epsilon = 1e-12);
    }

    #[test]
    fn test_infinite_mass_absorbs() {
        let op = MassOperator::rigid_body(f64::INFINITY, Matrix3::zeros());
        let v = DVector::from_vec(vec![1.0; 6]);
        let out = op.apply_inv(&v);
        assert_relative_eq!(out.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_block_fb_increment_mq() {
        let op = MassOperator::diagonal(DVector::from_vec(vec![2.0, 2.0]));
        let mut block = VariableBlock::new(VariableKey::Item(mbd_types::ItemId::new(0), 0), op);
        block.qb = DVector::from_vec(vec![3.0, -1.0]);
        block.fb_increment_mq();
        assert_relative_eq!(block.fb[0], 6.0, epsilon = 1e-12);
        assert_relative_eq!(block.fb[1], -2.0, epsilon = 1e-12);
    }
}
