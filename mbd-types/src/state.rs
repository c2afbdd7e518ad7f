//! Rigid body kinematic state types.
//!
//! [`Pose`] and [`Twist`] describe where a body is and how fast it moves;
//! [`MassProperties`] describes how it resists motion. The inertia inverse is
//! cached because the constraint solver asks for it on every sweep.

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position and orientation of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Position in world coordinates.
    pub position: Point3<f64>,
    /// Orientation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Create an identity pose (origin, no rotation).
    #[must_use]
    pub fn identity() -> Self {
        Self {
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Create a pose from position only (identity rotation).
    #[must_use]
    pub fn from_position(position: Point3<f64>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Create a pose from position and rotation.
    #[must_use]
    pub const fn from_position_rotation(
        position: Point3<f64>,
        rotation: UnitQuaternion<f64>,
    ) -> Self {
        Self { position, rotation }
    }

    /// Transform a point from local to world coordinates.
    #[must_use]
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords
    }

    /// Transform a vector from local to world coordinates (rotation only).
    #[must_use]
    pub fn transform_vector(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * local
    }

    /// Transform a point from world to local coordinates.
    #[must_use]
    pub fn inverse_transform_point(&self, world: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation.inverse() * (world - self.position))
    }

    /// Transform a vector from world to local coordinates.
    #[must_use]
    pub fn inverse_transform_vector(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * world
    }

    /// Compose two poses: self * other.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            position: self.transform_point(&other.position),
            rotation: self.rotation * other.rotation,
        }
    }

    /// Compute the inverse pose.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        Self {
            position: Point3::from(-(inv_rotation * self.position.coords)),
            rotation: inv_rotation,
        }
    }

    /// Check if the pose contains `NaN` or `Inf` values.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|x| x.is_finite())
            && self.rotation.coords.iter().all(|x| x.is_finite())
    }
}

/// Linear and angular velocity of a rigid body, world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Twist {
    /// Linear velocity (m/s).
    pub linear: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub angular: Vector3<f64>,
}

impl Default for Twist {
    fn default() -> Self {
        Self::zero()
    }
}

impl Twist {
    /// Create a twist with specified linear and angular velocity.
    #[must_use]
    pub const fn new(linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self { linear, angular }
    }

    /// Create a zero twist (at rest).
    #[must_use]
    pub fn zero() -> Self {
        Self {
            linear: Vector3::zeros(),
            angular: Vector3::zeros(),
        }
    }

    /// Create a twist with linear velocity only.
    #[must_use]
    pub fn from_linear(v: Vector3<f64>) -> Self {
        Self {
            linear: v,
            angular: Vector3::zeros(),
        }
    }

    /// Compute the velocity at a point offset from the body origin.
    ///
    /// `v_point = v + omega x r`
    #[must_use]
    pub fn velocity_at_point(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(offset)
    }

    /// Get the linear speed (magnitude of linear velocity).
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.linear.norm()
    }

    /// Get the angular speed (magnitude of angular velocity).
    #[must_use]
    pub fn angular_speed(&self) -> f64 {
        self.angular.norm()
    }

    /// Check if the twist contains `NaN` or `Inf` values.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.linear.iter().all(|x| x.is_finite()) && self.angular.iter().all(|x| x.is_finite())
    }
}

/// Mass properties of a rigid body.
///
/// The inverses are cached at construction; setters keep them in sync.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    mass: f64,
    inertia: Matrix3<f64>,
    inv_mass: f64,
    inv_inertia: Matrix3<f64>,
}

impl Default for MassProperties {
    fn default() -> Self {
        Self::new(1.0, Matrix3::identity())
    }
}

impl MassProperties {
    /// Create mass properties from mass and an inertia tensor about the
    /// center of mass, in local coordinates.
    ///
    /// A singular inertia tensor yields a zero inverse (infinite rotational
    /// resistance), mirroring the zero inverse mass of a fixed body.
    #[must_use]
    pub fn new(mass: f64, inertia: Matrix3<f64>) -> Self {
        let inv_mass = if mass > 0.0 && mass.is_finite() {
            1.0 / mass
        } else {
            0.0
        };
        let inv_inertia = inertia.try_inverse().unwrap_or_else(Matrix3::zeros);
        Self {
            mass,
            inertia,
            inv_mass,
            inv_inertia,
        }
    }

    /// Create mass properties for a uniform sphere: I = (2/5) m r^2.
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self::new(mass, Matrix3::from_diagonal(&Vector3::new(i, i, i)))
    }

    /// Create mass properties for a uniform box with the given half-extents.
    #[must_use]
    pub fn box_shape(mass: f64, half_extents: Vector3<f64>) -> Self {
        let x2 = 4.0 * half_extents.x * half_extents.x;
        let y2 = 4.0 * half_extents.y * half_extents.y;
        let z2 = 4.0 * half_extents.z * half_extents.z;
        Self::new(
            mass,
            Matrix3::from_diagonal(&Vector3::new(
                mass * (y2 + z2) / 12.0,
                mass * (x2 + z2) / 12.0,
                mass * (x2 + y2) / 12.0,
            )),
        )
    }

    /// Total mass (kg).
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Inertia tensor about the center of mass, local frame.
    #[must_use]
    pub fn inertia(&self) -> &Matrix3<f64> {
        &self.inertia
    }

    /// Cached inverse mass (0 for infinite mass).
    #[must_use]
    pub fn inv_mass(&self) -> f64 {
        self.inv_mass
    }

    /// Cached inverse inertia tensor (zero matrix if singular).
    #[must_use]
    pub fn inv_inertia(&self) -> &Matrix3<f64> {
        &self.inv_inertia
    }

    /// Replace the mass, refreshing the cached inverse.
    pub fn set_mass(&mut self, mass: f64) {
        *self = Self::new(mass, self.inertia);
    }

    /// Replace the inertia tensor, refreshing the cached inverse.
    pub fn set_inertia(&mut self, inertia: Matrix3<f64>) {
        *self = Self::new(self.mass, inertia);
    }

    /// Inertia tensor rotated into the world frame: R I R^T.
    #[must_use]
    pub fn inertia_world(&self, rotation: &UnitQuaternion<f64>) -> Matrix3<f64> {
        let r = rotation.to_rotation_matrix().into_inner();
        r * self.inertia * r.transpose()
    }

    /// Validate that the mass properties are physically plausible.
    pub fn validate(&self) -> crate::Result<()> {
        if self.mass < 0.0 {
            return Err(crate::MbdError::invalid_mass("mass cannot be negative"));
        }
        if !self.mass.is_finite() {
            return Err(crate::MbdError::invalid_mass("mass must be finite"));
        }
        let eigenvalues = self.inertia.symmetric_eigenvalues();
        if eigenvalues.iter().any(|&e| e < -1e-10) {
            return Err(crate::MbdError::invalid_mass(
                "inertia tensor must be positive semi-definite",
            ));
        }
        Ok(())
    }
}
