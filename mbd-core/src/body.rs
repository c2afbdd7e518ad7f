//! Rigid bodies.

use mbd_solver::{MassOperator, SystemDescriptor, VariableBlock, VariableKey};
use mbd_types::{
    BodyId, ItemId, MarkerId, MassProperties, Point3, Pose, SystemTag, Twist, Vector3,
};
use nalgebra::{DVector, UnitQuaternion};

use crate::collision::CollisionModel;
use crate::marker::Marker;

/// A 6-DOF rigid body.
///
/// The body frame origin is the center of mass. Created externally and
/// attached with [`crate::System::add_body`]; while attached, the system
/// owns it exclusively and the body carries the owning system's tag.
#[derive(Debug, Clone)]
pub struct Body {
    id: BodyId,
    item_id: ItemId,
    system: Option<SystemTag>,
    name: Option<String>,

    pose: Pose,
    twist: Twist,
    lin_accel: Vector3<f64>,
    ang_accel: Vector3<f64>,
    mass_props: MassProperties,

    fixed: bool,
    sleeping: bool,
    /// Time the body first met the rest criteria, if it still does.
    rest_since: Option<f64>,
    /// Linear speed below which the body is a sleep candidate (m/s).
    pub sleep_min_speed: f64,
    /// Angular speed below which the body is a sleep candidate (rad/s).
    pub sleep_min_ang_speed: f64,
    /// How long the rest criteria must hold before sleeping (s).
    pub sleep_min_time: f64,

    collision_model: Option<CollisionModel>,
    markers: Vec<Marker>,

    accumulated_force: Vector3<f64>,
    accumulated_torque: Vector3<f64>,
    /// Total force for this step (accumulated + gravity), world frame.
    total_force: Vector3<f64>,
    /// Total torque for this step (accumulated - gyroscopic), world frame.
    total_torque: Vector3<f64>,

    variables: VariableBlock,
    var_index: Option<usize>,
}

impl Body {
    /// Create a detached body at the origin.
    #[must_use]
    pub fn new(mass_props: MassProperties) -> Self {
        let id = BodyId::new(0);
        Self {
            id,
            item_id: ItemId::new(0),
            system: None,
            name: None,
            pose: Pose::identity(),
            twist: Twist::zero(),
            lin_accel: Vector3::zeros(),
            ang_accel: Vector3::zeros(),
            mass_props,
            fixed: false,
            sleeping: false,
            rest_since: None,
            sleep_min_speed: 0.03,
            sleep_min_ang_speed: 0.05,
            sleep_min_time: 0.5,
            collision_model: None,
            markers: Vec::new(),
            accumulated_force: Vector3::zeros(),
            accumulated_torque: Vector3::zeros(),
            total_force: Vector3::zeros(),
            total_torque: Vector3::zeros(),
            variables: VariableBlock::new(
                VariableKey::Body(id),
                MassOperator::rigid_body(mass_props.mass(), *mass_props.inertia()),
            ),
            var_index: None,
        }
    }

    /// Set the body name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the initial pose.
    #[must_use]
    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    /// Set the initial twist.
    #[must_use]
    pub fn with_twist(mut self, twist: Twist) -> Self {
        self.twist = twist;
        self
    }

    /// Fix the body to ground.
    #[must_use]
    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Attach a collision model.
    #[must_use]
    pub fn with_collision_model(mut self, model: CollisionModel) -> Self {
        self.collision_model = Some(model);
        self
    }

    /// Attach a marker.
    #[must_use]
    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.markers.push(marker);
        self
    }

    // --- identity and ownership -------------------------------------------

    /// System-assigned body id (zero while detached).
    #[must_use]
    pub fn id(&self) -> BodyId {
        self.id
    }

    /// System-assigned item id.
    #[must_use]
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// The owning system's tag, if attached.
    #[must_use]
    pub fn system(&self) -> Option<SystemTag> {
        self.system
    }

    /// Body name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn attach(&mut self, tag: SystemTag, id: BodyId, item_id: ItemId) {
        self.id = id;
        self.item_id = item_id;
        self.system = Some(tag);
        self.variables.key = VariableKey::Body(id);
    }

    pub(crate) fn detach(&mut self) {
        self.system = None;
        self.var_index = None;
    }

    // --- state ------------------------------------------------------------

    /// Current pose.
    #[must_use]
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    /// Current twist.
    #[must_use]
    pub fn twist(&self) -> &Twist {
        &self.twist
    }

    /// Linear acceleration estimated by backward difference.
    #[must_use]
    pub fn linear_acceleration(&self) -> &Vector3<f64> {
        &self.lin_accel
    }

    /// Mass properties.
    #[must_use]
    pub fn mass_properties(&self) -> &MassProperties {
        &self.mass_props
    }

    /// Overwrite the pose (teleport).
    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    /// Overwrite the twist.
    pub fn set_twist(&mut self, twist: Twist) {
        self.twist = twist;
    }

    /// Whether the body is fixed to ground.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Fix or release the body. Releasing also wakes it.
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
        if !fixed {
            self.wake();
        }
    }

    /// Whether the body is currently sleeping.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Force the body asleep (rest criteria are not checked).
    pub fn put_to_sleep(&mut self) {
        if !self.fixed {
            self.sleeping = true;
            self.twist = Twist::zero();
        }
    }

    /// Wake the body and restart its rest clock.
    pub fn wake(&mut self) {
        self.sleeping = false;
        self.rest_since = None;
    }

    /// Active bodies carry unknowns; fixed and sleeping ones do not.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.fixed && !self.sleeping
    }

    /// Collision model, if any.
    #[must_use]
    pub fn collision_model(&self) -> Option<&CollisionModel> {
        self.collision_model.as_ref()
    }

    /// Markers attached to this body.
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Add a marker.
    pub fn add_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    /// Find a marker by id.
    #[must_use]
    pub fn marker(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.iter().find(|m| m.id() == id)
    }

    /// Find a marker by name.
    #[must_use]
    pub fn marker_by_name(&self, name: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.name() == Some(name))
    }

    /// World-frame pose of a marker on this body.
    #[must_use]
    pub fn marker_world_pose(&self, id: MarkerId) -> Option<Pose> {
        self.marker(id).map(|m| m.world_pose(&self.pose))
    }

    // --- forces -----------------------------------------------------------

    /// Apply a force at the center of mass, accumulated until end of step.
    /// Wakes a sleeping body.
    pub fn apply_force(&mut self, force: Vector3<f64>) {
        if !self.fixed {
            self.accumulated_force += force;
            if self.sleeping && force.norm() > 1e-10 {
                self.wake();
            }
        }
    }

    /// Apply a torque, accumulated until end of step.
    pub fn apply_torque(&mut self, torque: Vector3<f64>) {
        if !self.fixed {
            self.accumulated_torque += torque;
            if self.sleeping && torque.norm() > 1e-10 {
                self.wake();
            }
        }
    }

    /// Apply a force at a world-space point.
    pub fn apply_force_at_point(&mut self, force: Vector3<f64>, point: Point3<f64>) {
        let torque = (point - self.pose.position).cross(&force);
        self.apply_force(force);
        self.apply_torque(torque);
    }

    pub(crate) fn clear_accumulators(&mut self) {
        self.accumulated_force = Vector3::zeros();
        self.accumulated_torque = Vector3::zeros();
    }

    // --- per-step update --------------------------------------------------

    /// Refresh derived per-step state: total force/torque (gravity and
    /// gyroscopic terms folded in) and the world-frame mass operator.
    pub(crate) fn update(&mut self, _time: f64, gravity: &Vector3<f64>) {
        let inertia_world = self.mass_props.inertia_world(&self.pose.rotation);
        self.total_force = self.accumulated_force + gravity * self.mass_props.mass();
        let gyro = self
            .twist
            .angular
            .cross(&(inertia_world * self.twist.angular));
        self.total_torque = self.accumulated_torque - gyro;
        self.variables.mass = MassOperator::rigid_body(self.mass_props.mass(), inertia_world);
    }

    /// Rest test: transition to sleeping once both speed thresholds have
    /// held for the minimum rest time. Never sleeps a fixed body.
    pub(crate) fn try_sleeping(&mut self, time: f64) {
        if self.fixed || self.sleeping {
            return;
        }
        let resting = self.twist.speed() < self.sleep_min_speed
            && self.twist.angular_speed() < self.sleep_min_ang_speed;
        if !resting {
            self.rest_since = None;
            return;
        }
        let since = *self.rest_since.get_or_insert(time);
        if time - since >= self.sleep_min_time {
            self.put_to_sleep();
        }
    }

    // --- variable block protocol ------------------------------------------

    pub(crate) fn variables_fb_reset(&mut self) {
        self.variables.fb_reset();
    }

    /// fb += `[F; T] * factor`
    pub(crate) fn variables_fb_load_forces(&mut self, factor: f64) {
        for k in 0..3 {
            self.variables.fb[k] += self.total_force[k] * factor;
            self.variables.fb[3 + k] += self.total_torque[k] * factor;
        }
    }

    /// qb = current twist
    pub(crate) fn variables_qb_load_speed(&mut self) {
        for k in 0..3 {
            self.variables.qb[k] = self.twist.linear[k];
            self.variables.qb[3 + k] = self.twist.angular[k];
        }
    }

    /// fb += M * qb
    pub(crate) fn variables_fb_increment_mq(&mut self) {
        self.variables.fb_increment_mq();
    }

    /// pos += qb * step (first-order; also valid for `Dpos` with step 1).
    pub(crate) fn variables_qb_increment_position(&mut self, step: f64) {
        let dq = &self.variables.qb;
        let dpos = Vector3::new(dq[0], dq[1], dq[2]) * step;
        let drot = Vector3::new(dq[3], dq[4], dq[5]) * step;
        self.pose.position += dpos;
        self.pose.rotation = UnitQuaternion::from_scaled_axis(drot) * self.pose.rotation;
    }

    /// Adopt qb as the new twist, estimating acceleration by backward
    /// difference over `step`.
    pub(crate) fn variables_qb_set_speed(&mut self, step: f64) {
        let old = self.twist;
        let dq = &self.variables.qb;
        self.twist = Twist::new(
            Vector3::new(dq[0], dq[1], dq[2]),
            Vector3::new(dq[3], dq[4], dq[5]),
        );
        if step > 0.0 {
            self.lin_accel = (self.twist.linear - old.linear) / step;
            self.ang_accel = (self.twist.angular - old.angular) / step;
        }
    }

    /// Zero all velocities and accelerations.
    pub(crate) fn set_no_speed_no_accel(&mut self) {
        self.twist = Twist::zero();
        self.lin_accel = Vector3::zeros();
        self.ang_accel = Vector3::zeros();
        self.variables.qb = DVector::zeros(6);
    }

    pub(crate) fn inject_variables(&mut self, descriptor: &mut SystemDescriptor) {
        self.var_index = if self.is_active() {
            Some(descriptor.insert_variable(self.variables.clone()))
        } else {
            None
        };
    }

    pub(crate) fn fetch_variables(&mut self, descriptor: &SystemDescriptor) {
        if let Some(idx) = self.var_index {
            self.variables.qb.copy_from(&descriptor.variables()[idx].qb);
        }
    }
}
