//! Links: marker-resolved constraints between two bodies.

use mbd_solver::{ConstraintBlock, ConstraintMode, SystemDescriptor, VariableKey};
use mbd_types::{BodyId, ItemId, LinkId, MarkerId, Pose, SystemTag, Vector3};
use nalgebra::DVector;

use crate::item::CachePhase;

/// The constraint a link enforces between its two marker frames.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkKind {
    /// Ball joint: the two marker origins coincide (3 rows).
    Spherical,
    /// Hinge: marker origins coincide and marker A's z-axis stays
    /// orthogonal to marker B's x and y axes (5 rows).
    Revolute,
    /// The marker origins keep a fixed distance (1 row).
    Distance {
        /// Imposed distance (m).
        length: f64,
    },
    /// Rheonomic drive: the relative velocity of the marker origins along
    /// marker A's x-axis tracks a target speed (1 row).
    LinearMotor {
        /// Target relative speed (m/s).
        speed: f64,
    },
}

impl LinkKind {
    /// Number of bilateral constraint rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        match self {
            Self::Spherical => 3,
            Self::Revolute => 5,
            Self::Distance { .. } | Self::LinearMotor { .. } => 1,
        }
    }
}

/// Kinematic context of one link endpoint, gathered by the system during
/// update from the body that owns the marker.
#[derive(Debug, Clone)]
pub(crate) struct LinkEndpoint {
    pub body: BodyId,
    pub body_pose: Pose,
    pub marker_world: Pose,
}

/// Per-row kinematic data recomputed every update.
#[derive(Debug, Clone)]
struct RowData {
    jac_a: DVector<f64>,
    jac_b: DVector<f64>,
    c: f64,
    ct: f64,
}

impl RowData {
    fn new(
        lin_a: Vector3<f64>,
        ang_a: Vector3<f64>,
        lin_b: Vector3<f64>,
        ang_b: Vector3<f64>,
        c: f64,
    ) -> Self {
        let pack = |lin: Vector3<f64>, ang: Vector3<f64>| {
            DVector::from_vec(vec![lin.x, lin.y, lin.z, ang.x, ang.y, ang.z])
        };
        Self {
            jac_a: pack(lin_a, ang_a),
            jac_b: pack(lin_b, ang_b),
            c,
            ct: 0.0,
        }
    }
}

/// A constraint between two bodies, expressed between two marker frames.
///
/// Links hold marker ids, not body references; the system resolves the ids
/// during update. A link whose markers cannot be resolved becomes invalid
/// and is pruned by [`crate::System::reference_markers_by_id`].
#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    item_id: ItemId,
    system: Option<SystemTag>,
    name: Option<String>,

    marker_a: MarkerId,
    marker_b: MarkerId,
    kind: LinkKind,
    valid: bool,
    requires_waking: bool,

    resolved_a: Option<BodyId>,
    resolved_b: Option<BodyId>,

    rows: Vec<ConstraintBlock>,
    computed: Vec<RowData>,
    cache_speed: Vec<f64>,
    cache_position: Vec<f64>,
    row_indices: Vec<usize>,

    react_force: Vector3<f64>,
    react_torque: Vector3<f64>,
}

impl Link {
    /// Create a detached link between two markers.
    #[must_use]
    pub fn new(marker_a: MarkerId, marker_b: MarkerId, kind: LinkKind) -> Self {
        let n = kind.rows();
        let placeholder = VariableKey::Body(BodyId::new(0));
        let rows = (0..n)
            .map(|_| {
                ConstraintBlock::two_blocks(
                    placeholder,
                    DVector::zeros(6),
                    placeholder,
                    DVector::zeros(6),
                    ConstraintMode::Bilateral,
                )
            })
            .collect();
        Self {
            id: LinkId::new(0),
            item_id: ItemId::new(0),
            system: None,
            name: None,
            marker_a,
            marker_b,
            kind,
            valid: false,
            requires_waking: matches!(kind, LinkKind::LinearMotor { .. }),
            resolved_a: None,
            resolved_b: None,
            rows,
            computed: Vec::new(),
            cache_speed: vec![0.0; n],
            cache_position: vec![0.0; n],
            row_indices: Vec::new(),
            react_force: Vector3::zeros(),
            react_torque: Vector3::zeros(),
        }
    }

    /// Set the link name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// System-assigned link id (zero while detached).
    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The owning system's tag, if attached.
    #[must_use]
    pub fn system(&self) -> Option<SystemTag> {
        self.system
    }

    /// Link name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The constraint kind.
    #[must_use]
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// First marker id.
    #[must_use]
    pub fn marker_a(&self) -> MarkerId {
        self.marker_a
    }

    /// Second marker id.
    #[must_use]
    pub fn marker_b(&self) -> MarkerId {
        self.marker_b
    }

    /// Whether the marker ids resolved to bodies at the last update.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Endpoint bodies, if resolved.
    #[must_use]
    pub fn bodies(&self) -> Option<(BodyId, BodyId)> {
        Some((self.resolved_a?, self.resolved_b?))
    }

    /// Whether the sleeping coordinator must keep both endpoints awake.
    #[must_use]
    pub fn requires_waking(&self) -> bool {
        self.requires_waking
    }

    /// Mark this link as disturbing its endpoints (forces them awake).
    pub fn set_requires_waking(&mut self, value: bool) {
        self.requires_waking = value;
    }

    /// Constraint reaction force on body B, world frame, from the last
    /// reaction scatter.
    #[must_use]
    pub fn reaction_force(&self) -> &Vector3<f64> {
        &self.react_force
    }

    /// Constraint reaction torque on body B about its center of mass.
    #[must_use]
    pub fn reaction_torque(&self) -> &Vector3<f64> {
        &self.react_torque
    }

    /// Bilateral constraint row count (0 while unresolved).
    #[must_use]
    pub fn doc_c(&self) -> usize {
        if self.valid {
            self.kind.rows()
        } else {
            0
        }
    }

    pub(crate) fn attach(&mut self, tag: SystemTag, id: LinkId, item_id: ItemId) {
        self.id = id;
        self.item_id = item_id;
        self.system = Some(tag);
    }

    pub(crate) fn detach(&mut self) {
        self.system = None;
        self.row_indices.clear();
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
        self.resolved_a = None;
        self.resolved_b = None;
    }

    // --- per-step update --------------------------------------------------

    /// Recompute the jacobians, violations, and rheonomic rates from the
    /// endpoint kinematics. An unresolvable endpoint invalidates the link.
    pub(crate) fn update(
        &mut self,
        _time: f64,
        a: Option<&LinkEndpoint>,
        b: Option<&LinkEndpoint>,
    ) {
        let (Some(a), Some(b)) = (a, b) else {
            self.invalidate();
            return;
        };
        self.valid = true;
        self.resolved_a = Some(a.body);
        self.resolved_b = Some(b.body);

        let anchor_a = a.marker_world.position;
        let anchor_b = b.marker_world.position;
        let s_a = anchor_a - a.body_pose.position;
        let s_b = anchor_b - b.body_pose.position;

        self.computed.clear();
        match self.kind {
            LinkKind::Spherical | LinkKind::Revolute => {
                let gap = anchor_b - anchor_a;
                for k in 0..3 {
                    let e = Vector3::ith(k, 1.0);
                    self.computed.push(RowData::new(
                        -e,
                        -s_a.cross(&e),
                        e,
                        s_b.cross(&e),
                        gap[k],
                    ));
                }
                if matches!(self.kind, LinkKind::Revolute) {
                    let axis = a.marker_world.transform_vector(&Vector3::z());
                    for local in [Vector3::x(), Vector3::y()] {
                        let other = b.marker_world.transform_vector(&local);
                        let w = axis.cross(&other);
                        self.computed.push(RowData::new(
                            Vector3::zeros(),
                            w,
                            Vector3::zeros(),
                            -w,
                            axis.dot(&other),
                        ));
                    }
                }
            }
            LinkKind::Distance { length } => {
                let d = anchor_b - anchor_a;
                let dist = d.norm();
                let n = if dist > 1e-12 { d / dist } else { Vector3::x() };
                self.computed.push(RowData::new(
                    -n,
                    -s_a.cross(&n),
                    n,
                    s_b.cross(&n),
                    dist - length,
                ));
            }
            LinkKind::LinearMotor { speed } => {
                let n = a.marker_world.transform_vector(&Vector3::x());
                let mut row = RowData::new(-n, -s_a.cross(&n), n, s_b.cross(&n), 0.0);
                row.ct = -speed;
                self.computed.push(row);
            }
        }
    }

    // --- constraint block protocol ----------------------------------------

    pub(crate) fn constraints_bi_reset(&mut self) {
        for row in &mut self.rows {
            row.bi_reset();
        }
    }

    /// rhs += C * factor, clamped symmetrically when requested.
    pub(crate) fn constraints_bi_load_c(&mut self, factor: f64, recovery_clamp: f64, do_clamp: bool) {
        if !self.valid {
            return;
        }
        for (row, data) in self.rows.iter_mut().zip(&self.computed) {
            row.violation = data.c;
            let term = data.c * factor;
            row.rhs += if do_clamp {
                term.clamp(-recovery_clamp, recovery_clamp)
            } else {
                term
            };
        }
    }

    /// rhs += Ct * factor (rheonomic rate term).
    pub(crate) fn constraints_bi_load_ct(&mut self, factor: f64) {
        if !self.valid {
            return;
        }
        for (row, data) in self.rows.iter_mut().zip(&self.computed) {
            row.rhs += data.ct * factor;
        }
    }

    /// Copy the freshly computed jacobians into the constraint rows.
    pub(crate) fn constraints_load_jacobians(&mut self) {
        if !self.valid {
            return;
        }
        let (Some(a), Some(b)) = (self.resolved_a, self.resolved_b) else {
            return;
        };
        for (row, data) in self.rows.iter_mut().zip(&self.computed) {
            row.var_a = VariableKey::Body(a);
            row.var_b = Some(VariableKey::Body(b));
            row.jac_a.copy_from(&data.jac_a);
            if let Some(jac_b) = row.jac_b.as_mut() {
                jac_b.copy_from(&data.jac_b);
            }
        }
    }

    pub(crate) fn inject_constraints(&mut self, descriptor: &mut SystemDescriptor) {
        self.row_indices.clear();
        if !self.valid {
            return;
        }
        for row in &self.rows {
            self.row_indices.push(descriptor.insert_constraint(row.clone()));
        }
    }

    pub(crate) fn fetch_multipliers(&mut self, descriptor: &SystemDescriptor) {
        for (row, &idx) in self.rows.iter_mut().zip(&self.row_indices) {
            row.multiplier = descriptor.constraints()[idx].multiplier;
        }
    }

    /// Convert the cached multipliers into a reaction wrench on body B
    /// (`reaction = multiplier * factor`, with factor `1/step` after a
    /// speed solve).
    pub(crate) fn fetch_reactions(&mut self, factor: f64) {
        self.react_force = Vector3::zeros();
        self.react_torque = Vector3::zeros();
        if !self.valid {
            return;
        }
        for (row, data) in self.rows.iter().zip(&self.computed) {
            let l = row.multiplier * factor;
            self.react_force += Vector3::new(data.jac_b[0], data.jac_b[1], data.jac_b[2]) * l;
            self.react_torque += Vector3::new(data.jac_b[3], data.jac_b[4], data.jac_b[5]) * l;
        }
    }

    pub(crate) fn load_multiplier_cache(&mut self, phase: CachePhase) {
        let cache = match phase {
            CachePhase::Speed => &self.cache_speed,
            CachePhase::Position => &self.cache_position,
        };
        for (row, &l) in self.rows.iter_mut().zip(cache) {
            row.multiplier = l;
        }
    }

    pub(crate) fn store_multiplier_cache(&mut self, phase: CachePhase) {
        let cache = match phase {
            CachePhase::Speed => &mut self.cache_speed,
            CachePhase::Position => &mut self.cache_position,
        };
        for (row, l) in self.rows.iter().zip(cache.iter_mut()) {
            *l = row.multiplier;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use mbd_types::Point3;

    fn endpoint(body: u64, body_pos: [f64; 3], marker_pos: [f64; 3]) -> LinkEndpoint {
        LinkEndpoint {
            body: BodyId::new(body),
            body_pose: Pose::from_position(Point3::new(body_pos[0], body_pos[1], body_pos[2])),
            marker_world: Pose::from_position(Point3::new(
                marker_pos[0],
                marker_pos[1],
                marker_pos[2],
            )),
        }
    }

    #[test]
    fn test_spherical_violation_is_anchor_gap() {
        let mut link = Link::new(MarkerId::new(1), MarkerId::new(2), LinkKind::Spherical);
        let a = endpoint(0, [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        let b = endpoint(1, [2.0, 0.0, 0.0], [1.0, 0.1, 0.0]);
        link.update(0.0, Some(&a), Some(&b));
        assert!(link.is_valid());
        link.constraints_bi_load_c(1.0, 0.0, false);
        assert_relative_eq!(link.rows[0].rhs, 0.0, epsilon = 1e-12);
        assert_relative_eq!(link.rows[1].rhs, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_spherical_jacobian_translation_invariant() {
        // A common translation velocity of both bodies must not violate the
        // joint: J_a v + J_b v = 0 for pure translation.
        let mut link = Link::new(MarkerId::new(1), MarkerId::new(2), LinkKind::Spherical);
        let a = endpoint(0, [0.0, 0.0, 0.0], [1.0, 0.5, 0.0]);
        let b = endpoint(1, [2.0, 0.0, 0.0], [1.0, 0.5, 0.0]);
        link.update(0.0, Some(&a), Some(&b));
        for data in &link.computed {
            for k in 0..3 {
                assert_relative_eq!(data.jac_a[k] + data.jac_b[k], 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_unresolved_endpoint_invalidates() {
        let mut link = Link::new(MarkerId::new(1), MarkerId::new(2), LinkKind::Spherical);
        let a = endpoint(0, [0.0; 3], [0.0; 3]);
        link.update(0.0, Some(&a), None);
        assert!(!link.is_valid());
        assert_eq!(link.doc_c(), 0);
    }

    #[test]
    fn test_motor_loads_ct() {
        let mut link = Link::new(
            MarkerId::new(1),
            MarkerId::new(2),
            LinkKind::LinearMotor { speed: 2.0 },
        );
        assert!(link.requires_waking());
        let a = endpoint(0, [0.0; 3], [0.0; 3]);
        let b = endpoint(1, [1.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        link.update(0.0, Some(&a), Some(&b));
        link.constraints_bi_load_ct(1.0);
        assert_relative_eq!(link.rows[0].rhs, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_caches_are_independent() {
        let mut link = Link::new(MarkerId::new(1), MarkerId::new(2), LinkKind::Distance {
            length: 1.0,
        });
        link.rows[0].multiplier = 5.0;
        link.store_multiplier_cache(CachePhase::Speed);
        link.rows[0].multiplier = -3.0;
        link.store_multiplier_cache(CachePhase::Position);
        link.load_multiplier_cache(CachePhase::Speed);
        assert_eq!(link.rows[0].multiplier, 5.0);
        link.load_multiplier_cache(CachePhase::Position);
        assert_eq!(link.rows[0].multiplier, -3.0);
    }
}
