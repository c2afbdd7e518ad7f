//! The collision boundary: shapes, the engine trait, and a built-in
//! brute-force engine.
//!
//! The stepping coordinator never computes collisions itself; it
//! synchronizes every collidable item's geometry, runs the engine, and
//! routes the reported manifolds into the contact container (and into any
//! other item that accepts them). Any engine implementing
//! [`CollisionEngine`] can be swapped in while no bodies are attached.

use mbd_types::{BodyId, ItemId, Point3, Pose, Vector3};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Collision geometry of one collider.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CollisionShape {
    /// Sphere centered at the collider frame origin.
    Sphere {
        /// Sphere radius in meters.
        radius: f64,
    },
    /// Infinite plane: `normal . x = distance`.
    Plane {
        /// Unit normal vector of the plane.
        normal: Vector3<f64>,
        /// Distance from origin along the normal.
        distance: f64,
    },
}

impl CollisionShape {
    /// Create a sphere shape.
    #[must_use]
    pub fn sphere(radius: f64) -> Self {
        Self::Sphere { radius }
    }

    /// Create a ground plane (Z-up at given height).
    #[must_use]
    pub fn ground_plane(height: f64) -> Self {
        Self::Plane {
            normal: Vector3::z(),
            distance: height,
        }
    }

    /// Bounding sphere radius for broad-phase culling.
    #[must_use]
    pub fn bounding_radius(&self) -> f64 {
        match self {
            Self::Sphere { radius } => *radius,
            Self::Plane { .. } => f64::INFINITY,
        }
    }
}

/// Surface material entering the contact constraint rows.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SurfaceMaterial {
    /// Coulomb friction coefficient.
    pub friction: f64,
    /// Restitution coefficient (0 = perfectly plastic).
    pub restitution: f64,
}

impl Default for SurfaceMaterial {
    fn default() -> Self {
        Self {
            friction: 0.6,
            restitution: 0.0,
        }
    }
}

impl SurfaceMaterial {
    /// Combine the materials of a contact pair: conservative friction,
    /// bounciest restitution.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            friction: self.friction.min(other.friction),
            restitution: self.restitution.max(other.restitution),
        }
    }
}

/// Collision data attached to a body or item.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollisionModel {
    /// The collider geometry.
    pub shape: CollisionShape,
    /// Detection envelope: pairs closer than the summed envelopes report a
    /// contact even before touching, so constraints exist one step early.
    pub envelope: f64,
    /// Surface material.
    pub material: SurfaceMaterial,
}

impl CollisionModel {
    /// Create a model with the default envelope and material.
    #[must_use]
    pub fn new(shape: CollisionShape) -> Self {
        Self {
            shape,
            envelope: 0.03,
            material: SurfaceMaterial::default(),
        }
    }

    /// Set the detection envelope.
    #[must_use]
    pub fn with_envelope(mut self, envelope: f64) -> Self {
        self.envelope = envelope;
        self
    }

    /// Set the surface material.
    #[must_use]
    pub fn with_material(mut self, material: SurfaceMaterial) -> Self {
        self.material = material;
        self
    }
}

/// Identity of a collider as registered with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColliderKey {
    /// A rigid body's collision model.
    Body(BodyId),
    /// The `slot`-th collision model of a generic physics item.
    Item(ItemId, u32),
}

/// One contact manifold point reported by the engine.
#[derive(Debug, Clone)]
pub struct ContactReport {
    /// First collider.
    pub key_a: ColliderKey,
    /// Second collider.
    pub key_b: ColliderKey,
    /// Contact point on the surface of collider A, world frame.
    pub point_a: Point3<f64>,
    /// Contact point on the surface of collider B, world frame.
    pub point_b: Point3<f64>,
    /// Contact normal, pointing from B toward A.
    pub normal: Vector3<f64>,
    /// Signed surface distance (negative = penetrating).
    pub distance: f64,
    /// Combined pair material.
    pub material: SurfaceMaterial,
}

/// A near-miss pair reported to proximity-aware items.
#[derive(Debug, Clone)]
pub struct ProximityReport {
    /// First collider.
    pub key_a: ColliderKey,
    /// Second collider.
    pub key_b: ColliderKey,
    /// Separation distance.
    pub distance: f64,
}

/// Verdict of the user contact-point filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContactDecision {
    /// Record the contact as reported.
    Accept,
    /// Record the contact with this material instead.
    Override(SurfaceMaterial),
    /// Drop the contact.
    Reject,
}

/// The external collision engine contract.
///
/// Given the current collider poses, `run` must produce a set of contact
/// manifolds that is deterministic within a call; the coordinator relies on
/// stable report ordering for reproducible constraint offsets.
pub trait CollisionEngine: Send {
    /// Register a collider.
    fn add_model(&mut self, key: ColliderKey, model: CollisionModel, pose: Pose);

    /// Unregister a collider. Unknown keys are ignored.
    fn remove_model(&mut self, key: ColliderKey);

    /// Update a collider's pose to the owner's current kinematic state.
    fn synchronize(&mut self, key: ColliderKey, pose: Pose);

    /// Run broad and narrow phase over the registered colliders.
    fn run(&mut self);

    /// Contacts found by the last `run`, in deterministic order.
    fn contacts(&self) -> &[ContactReport];

    /// Near-miss pairs found by the last `run`.
    fn proximities(&self) -> &[ProximityReport] {
        &[]
    }

    /// Number of registered colliders.
    fn n_models(&self) -> usize;
}

/// Built-in all-pairs engine: bounding-sphere broad phase, sphere/sphere
/// and sphere/plane narrow phase.
///
/// Quadratic in the collider count, which is fine for the scene sizes the
/// built-in engine is meant for; larger scenes plug in an external engine.
/// Pair order follows registration order, so reports are stable run-to-run.
#[derive(Debug, Default)]
pub struct BruteForceEngine {
    entries: Vec<Entry>,
    contacts: Vec<ContactReport>,
    proximities: Vec<ProximityReport>,
    /// Pairs separated by less than this (beyond their envelopes) are
    /// reported as proximities.
    pub proximity_margin: f64,
}

#[derive(Debug)]
struct Entry {
    key: ColliderKey,
    model: CollisionModel,
    pose: Pose,
}

impl BruteForceEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            proximity_margin: 0.1,
            ..Default::default()
        }
    }

    fn narrow_phase(a: &Entry, b: &Entry) -> Option<(Point3<f64>, Point3<f64>, Vector3<f64>, f64)> {
        match (&a.model.shape, &b.model.shape) {
            (CollisionShape::Sphere { radius: ra }, CollisionShape::Sphere { radius: rb }) => {
                let ca = a.pose.position;
                let cb = b.pose.position;
                let delta = ca - cb;
                let center_dist = delta.norm();
                if center_dist < 1e-12 {
                    return None;
                }
                let normal = delta / center_dist;
                let distance = center_dist - ra - rb;
                Some((ca - normal * *ra, cb + normal * *rb, normal, distance))
            }
            (CollisionShape::Sphere { radius }, CollisionShape::Plane { normal, distance }) => {
                let c = a.pose.position;
                let gap = normal.dot(&c.coords) - distance - radius;
                Some((c - normal * *radius, c - normal * (radius + gap), *normal, gap))
            }
            (CollisionShape::Plane { .. }, CollisionShape::Sphere { .. }) => {
                // Swap so the sphere is side A, then flip the report.
                Self::narrow_phase(b, a).map(|(pa, pb, n, d)| (pb, pa, -n, d))
            }
            (CollisionShape::Plane { .. }, CollisionShape::Plane { .. }) => None,
        }
    }
}

impl CollisionEngine for BruteForceEngine {
    fn add_model(&mut self, key: ColliderKey, model: CollisionModel, pose: Pose) {
        debug_assert!(
            self.entries.iter().all(|e| e.key != key),
            "collider registered twice"
        );
        self.entries.push(Entry { key, model, pose });
    }

    fn remove_model(&mut self, key: ColliderKey) {
        self.entries.retain(|e| e.key != key);
    }

    fn synchronize(&mut self, key: ColliderKey, pose: Pose) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.pose = pose;
        }
    }

    fn run(&mut self) {
        self.contacts.clear();
        self.proximities.clear();
        for i in 0..self.entries.len() {
            for j in (i + 1)..self.entries.len() {
                let (a, b) = (&self.entries[i], &self.entries[j]);

                // Broad phase: bounding spheres inflated by the envelopes.
                let reach = a.model.shape.bounding_radius()
                    + b.model.shape.bounding_radius()
                    + a.model.envelope
                    + b.model.envelope
                    + self.proximity_margin;
                if reach.is_finite() && (a.pose.position - b.pose.position).norm() > reach {
                    continue;
                }

                let Some((point_a, point_b, normal, distance)) = Self::narrow_phase(a, b) else {
                    continue;
                };
                let envelope = a.model.envelope + b.model.envelope;
                if distance < envelope {
                    self.contacts.push(ContactReport {
                        key_a: a.key,
                        key_b: b.key,
                        point_a,
                        point_b,
                        normal,
                        distance,
                        material: a.model.material.combine(&b.model.material),
                    });
                } else if distance < envelope + self.proximity_margin {
                    self.proximities.push(ProximityReport {
                        key_a: a.key,
                        key_b: b.key,
                        distance,
                    });
                }
            }
        }
        debug!(
            contacts = self.contacts.len(),
            proximities = self.proximities.len(),
            "collision pass complete"
        );
    }

    fn contacts(&self) -> &[ContactReport] {
        &self.contacts
    }

    fn proximities(&self) -> &[ProximityReport] {
        &self.proximities
    }

    fn n_models(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sphere_at(key: u64, radius: f64, z: f64) -> (ColliderKey, CollisionModel, Pose) {
        (
            ColliderKey::Body(BodyId::new(key)),
            CollisionModel::new(CollisionShape::sphere(radius)),
            Pose::from_position(Point3::new(0.0, 0.0, z)),
        )
    }

    #[test]
    fn test_sphere_sphere_contact() {
        let mut engine = BruteForceEngine::new();
        let (k1, m1, p1) = sphere_at(0, 1.0, 0.0);
        let (k2, m2, p2) = sphere_at(1, 1.0, 1.9);
        engine.add_model(k1, m1, p1);
        engine.add_model(k2, m2, p2);
        engine.run();

        assert_eq!(engine.contacts().len(), 1);
        let c = &engine.contacts()[0];
        assert_relative_eq!(c.distance, -0.1, epsilon = 1e-12);
        // Normal points from B (upper) toward A (lower).
        assert_relative_eq!(c.normal, -Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn test_sphere_plane_contact_and_envelope() {
        let mut engine = BruteForceEngine::new();
        let (k1, m1, _) = sphere_at(0, 0.5, 0.0);
        engine.add_model(k1, m1, Pose::from_position(Point3::new(0.0, 0.0, 0.52)));
        engine.add_model(
            ColliderKey::Body(BodyId::new(1)),
            CollisionModel::new(CollisionShape::ground_plane(0.0)).with_envelope(0.0),
            Pose::identity(),
        );
        engine.run();

        // Gap of 0.02 is inside the default 0.03 envelope.
        assert_eq!(engine.contacts().len(), 1);
        let c = &engine.contacts()[0];
        assert_relative_eq!(c.distance, 0.02, epsilon = 1e-12);
        assert_relative_eq!(c.normal, Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn test_far_spheres_ignored() {
        let mut engine = BruteForceEngine::new();
        let (k1, m1, p1) = sphere_at(0, 1.0, 0.0);
        let (k2, m2, p2) = sphere_at(1, 1.0, 10.0);
        engine.add_model(k1, m1, p1);
        engine.add_model(k2, m2, p2);
        engine.run();
        assert!(engine.contacts().is_empty());
    }

    #[test]
    fn test_remove_model() {
        let mut engine = BruteForceEngine::new();
        let (k1, m1, p1) = sphere_at(0, 1.0, 0.0);
        engine.add_model(k1, m1, p1);
        assert_eq!(engine.n_models(), 1);
        engine.remove_model(k1);
        assert_eq!(engine.n_models(), 0);
    }
}
