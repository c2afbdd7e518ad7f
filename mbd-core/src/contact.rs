//! The contact container: the per-step set of contact constraints.
//!
//! Conceptually rebuilt once per step: reset, populated from the collision
//! engine's reports, consulted for reactions and constraint counts. Each
//! contact contributes three rows — one unilateral along the normal and two
//! friction rows clamped to the cone of the normal multiplier.

use mbd_solver::{ConstraintBlock, ConstraintMode, SystemDescriptor, VariableKey};
use mbd_types::{BodyId, ItemId, Point3, SystemTag, Twist, Vector3};
use nalgebra::DVector;

use crate::collision::{ContactReport, SurfaceMaterial};
use crate::item::CachePhase;

/// Kinematic state of one contact endpoint at creation time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContactBody {
    pub id: BodyId,
    pub position: Point3<f64>,
    pub twist: Twist,
}

/// One frictional contact constraint.
#[derive(Debug, Clone)]
pub struct Contact {
    body_a: BodyId,
    body_b: BodyId,
    point_a: Point3<f64>,
    point_b: Point3<f64>,
    normal: Vector3<f64>,
    distance: f64,
    material: SurfaceMaterial,
    /// Normal relative velocity at creation (negative = approaching).
    approach_speed: f64,
    /// Rows: normal, tangent 1, tangent 2.
    rows: Vec<ConstraintBlock>,
    cache_speed: [f64; 3],
    cache_position: [f64; 3],
    row_indices: [usize; 3],
    /// Reaction in the contact frame (normal, t1, t2) after scatter.
    reaction: Vector3<f64>,
}

impl Contact {
    /// Bodies in contact.
    #[must_use]
    pub fn bodies(&self) -> (BodyId, BodyId) {
        (self.body_a, self.body_b)
    }

    /// Contact normal, pointing from B toward A.
    #[must_use]
    pub fn normal(&self) -> &Vector3<f64> {
        &self.normal
    }

    /// Signed surface distance at detection time.
    #[must_use]
    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Contact point on body A, world frame.
    #[must_use]
    pub fn point_a(&self) -> &Point3<f64> {
        &self.point_a
    }

    /// Reaction force in the contact frame (normal, tangent 1, tangent 2).
    #[must_use]
    pub fn reaction(&self) -> &Vector3<f64> {
        &self.reaction
    }
}

/// Any unit vector orthogonal to `n`.
fn perpendicular(n: &Vector3<f64>) -> Vector3<f64> {
    let candidate = if n.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    n.cross(&candidate).normalize()
}

/// The specialized physics item owning the current contact set.
#[derive(Debug, Default)]
pub struct ContactContainer {
    item_id: ItemId,
    system: Option<SystemTag>,
    contacts: Vec<Contact>,
    adding: bool,
}

impl ContactContainer {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contacts currently held.
    #[must_use]
    pub fn n_contacts(&self) -> usize {
        self.contacts.len()
    }

    /// Unilateral-family constraint row count (3 per contact).
    #[must_use]
    pub fn doc_d(&self) -> usize {
        3 * self.contacts.len()
    }

    /// The contacts currently held.
    #[must_use]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// The owning system's tag, if attached.
    #[must_use]
    pub fn system(&self) -> Option<SystemTag> {
        self.system
    }

    pub(crate) fn attach(&mut self, tag: SystemTag, item_id: ItemId) {
        self.item_id = item_id;
        self.system = Some(tag);
    }

    /// System-assigned item id.
    #[must_use]
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Drop last step's contacts and open the container for reports.
    pub(crate) fn begin_add_contacts(&mut self) {
        self.contacts.clear();
        self.adding = true;
    }

    /// Record one body-body contact from an engine report.
    pub(crate) fn add_contact(
        &mut self,
        report: &ContactReport,
        a: ContactBody,
        b: ContactBody,
        material: SurfaceMaterial,
    ) {
        debug_assert!(self.adding, "add_contact outside begin/end");
        let n = report.normal;
        let t1 = perpendicular(&n);
        let t2 = n.cross(&t1);
        let s_a = report.point_a - a.position;
        let s_b = report.point_b - b.position;

        let make_row = |dir: &Vector3<f64>, mode: ConstraintMode| {
            let jac_a = DVector::from_vec(vec![
                dir.x,
                dir.y,
                dir.z,
                s_a.cross(dir).x,
                s_a.cross(dir).y,
                s_a.cross(dir).z,
            ]);
            let jac_b = DVector::from_vec(vec![
                -dir.x,
                -dir.y,
                -dir.z,
                -s_b.cross(dir).x,
                -s_b.cross(dir).y,
                -s_b.cross(dir).z,
            ]);
            ConstraintBlock::two_blocks(
                VariableKey::Body(a.id),
                jac_a,
                VariableKey::Body(b.id),
                jac_b,
                mode,
            )
        };

        let mu = material.friction;
        let rows = vec![
            make_row(&n, ConstraintMode::Unilateral),
            make_row(&t1, ConstraintMode::Friction { cone: 0, mu }),
            make_row(&t2, ConstraintMode::Friction { cone: 0, mu }),
        ];

        let approach_speed = n.dot(&(a.twist.velocity_at_point(&s_a)))
            - n.dot(&(b.twist.velocity_at_point(&s_b)));

        self.contacts.push(Contact {
            body_a: a.id,
            body_b: b.id,
            point_a: report.point_a,
            point_b: report.point_b,
            normal: n,
            distance: report.distance,
            material,
            approach_speed,
            rows,
            cache_speed: [0.0; 3],
            cache_position: [0.0; 3],
            row_indices: [0; 3],
            reaction: Vector3::zeros(),
        });
    }

    /// Close the container for this step.
    pub(crate) fn end_add_contacts(&mut self) {
        self.adding = false;
    }

    /// Visit all contact body pairs (for wake-up propagation).
    pub(crate) fn for_each_pair(&self, mut f: impl FnMut(BodyId, BodyId)) {
        for c in &self.contacts {
            f(c.body_a, c.body_b);
        }
    }

    // --- constraint block protocol ----------------------------------------

    pub(crate) fn constraints_bi_reset(&mut self) {
        for c in &mut self.contacts {
            for row in &mut c.rows {
                row.bi_reset();
            }
        }
    }

    /// Load the normal rows' violation term, clamped below at the maximum
    /// recovery speed, plus the restitution bias above the bounce
    /// threshold.
    pub(crate) fn constraints_bi_load_c(
        &mut self,
        factor: f64,
        recovery_clamp: f64,
        do_clamp: bool,
        min_bounce_speed: f64,
    ) {
        for c in &mut self.contacts {
            let normal_row = &mut c.rows[0];
            normal_row.violation = c.distance;
            let term = c.distance * factor;
            normal_row.rhs += if do_clamp {
                term.max(-recovery_clamp)
            } else {
                term
            };
            if c.approach_speed < -min_bounce_speed && c.material.restitution > 0.0 {
                normal_row.rhs += c.material.restitution * c.approach_speed;
            }
        }
    }

    pub(crate) fn inject_constraints(&mut self, descriptor: &mut SystemDescriptor) {
        for c in &mut self.contacts {
            let idx_n = descriptor.insert_constraint(c.rows[0].clone());
            c.row_indices[0] = idx_n;
            for k in 1..3 {
                let mut row = c.rows[k].clone();
                if let ConstraintMode::Friction { mu, .. } = row.mode {
                    row.mode = ConstraintMode::Friction { cone: idx_n, mu };
                }
                c.row_indices[k] = descriptor.insert_constraint(row);
            }
        }
    }

    pub(crate) fn fetch_multipliers(&mut self, descriptor: &SystemDescriptor) {
        for c in &mut self.contacts {
            for k in 0..3 {
                c.rows[k].multiplier = descriptor.constraints()[c.row_indices[k]].multiplier;
            }
        }
    }

    /// reaction = multiplier * factor, per contact, contact frame.
    pub(crate) fn fetch_reactions(&mut self, factor: f64) {
        for c in &mut self.contacts {
            c.reaction = Vector3::new(
                c.rows[0].multiplier,
                c.rows[1].multiplier,
                c.rows[2].multiplier,
            ) * factor;
        }
    }

    pub(crate) fn load_multiplier_cache(&mut self, phase: CachePhase) {
        for c in &mut self.contacts {
            let cache = match phase {
                CachePhase::Speed => &c.cache_speed,
                CachePhase::Position => &c.cache_position,
            };
            for k in 0..3 {
                c.rows[k].multiplier = cache[k];
            }
        }
    }

    pub(crate) fn store_multiplier_cache(&mut self, phase: CachePhase) {
        for c in &mut self.contacts {
            let values = [
                c.rows[0].multiplier,
                c.rows[1].multiplier,
                c.rows[2].multiplier,
            ];
            match phase {
                CachePhase::Speed => c.cache_speed = values,
                CachePhase::Position => c.cache_position = values,
            }
        }
    }
}
