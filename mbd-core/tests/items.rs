//! Generic physics items, tangent-stiffness blocks, hooks, probes, and the
//! collision-bridge extension points.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use mbd_core::{
    Body, CollisionModel, CollisionShape, ContactDecision, ContactReport, ContactSink,
    MassProperties, PhysicsItem, Point3, Pose, Probe, SolverKind, StepHook, System,
    SystemDescriptor,
};
use mbd_solver::{KrmBlock, MassOperator, ProjectedSymmSor, VariableBlock, VariableKey};
use mbd_types::{BodyId, ItemId, SystemTag, Vector3};
use nalgebra::{DMatrix, DVector};

/// A one-DOF point mass on an axial spring to the origin: the smallest
/// item that exercises the full block protocol including the
/// tangent-operator path.
struct AxialSpring {
    item_id: ItemId,
    system: Option<SystemTag>,
    x: f64,
    v: f64,
    accel: f64,
    mass: f64,
    stiffness: f64,
    external_force: f64,
    block: VariableBlock,
    var_index: Option<usize>,
    krm: Option<DMatrix<f64>>,
}

impl AxialSpring {
    fn new(mass: f64, stiffness: f64) -> Self {
        let item_id = ItemId::new(0);
        Self {
            item_id,
            system: None,
            x: 0.0,
            v: 0.0,
            accel: 0.0,
            mass,
            stiffness,
            external_force: 0.0,
            block: VariableBlock::new(
                VariableKey::Item(item_id, 0),
                MassOperator::diagonal(DVector::from_vec(vec![mass])),
            ),
            var_index: None,
            krm: None,
        }
    }
}

impl PhysicsItem for AxialSpring {
    fn name(&self) -> Option<&str> {
        Some("axial-spring")
    }

    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn system(&self) -> Option<SystemTag> {
        self.system
    }

    fn set_ownership(&mut self, item_id: ItemId, tag: Option<SystemTag>) {
        self.item_id = item_id;
        self.system = tag;
        self.block.key = VariableKey::Item(item_id, 0);
    }

    fn dof(&self) -> usize {
        1
    }

    fn update(&mut self, _time: f64) {}

    fn variables_fb_reset(&mut self) {
        self.block.fb_reset();
    }

    fn variables_fb_load_forces(&mut self, factor: f64) {
        self.block.fb[0] += (self.external_force - self.stiffness * self.x) * factor;
    }

    fn variables_qb_load_speed(&mut self) {
        self.block.qb[0] = self.v;
    }

    fn variables_fb_increment_mq(&mut self) {
        self.block.fb_increment_mq();
    }

    fn variables_qb_increment_position(&mut self, step: f64) {
        self.x += self.block.qb[0] * step;
    }

    fn variables_qb_set_speed(&mut self, step: f64) {
        let old = self.v;
        self.v = self.block.qb[0];
        if step > 0.0 {
            self.accel = (self.v - old) / step;
        }
    }

    fn set_no_speed_no_accel(&mut self) {
        self.v = 0.0;
        self.accel = 0.0;
        self.block.qb.fill(0.0);
    }

    fn load_krm(&mut self, k_factor: f64, _r_factor: f64, m_factor: f64) {
        self.krm = Some(DMatrix::from_element(
            1,
            1,
            self.stiffness * k_factor + self.mass * m_factor,
        ));
    }

    fn inject_variables(&mut self, descriptor: &mut SystemDescriptor) {
        self.var_index = Some(descriptor.insert_variable(self.block.clone()));
    }

    fn inject_krm(&mut self, descriptor: &mut SystemDescriptor) {
        if let Some(krm) = &self.krm {
            descriptor.insert_krm(KrmBlock {
                keys: vec![self.block.key],
                matrix: krm.clone(),
            });
        }
    }

    fn fetch_solution(&mut self, descriptor: &SystemDescriptor) {
        if let Some(idx) = self.var_index {
            self.block.qb.copy_from(&descriptor.variables()[idx].qb);
        }
    }
}

/// An item that only listens: collects contact reports through the
/// capability query.
struct ContactCollector {
    item_id: ItemId,
    system: Option<SystemTag>,
    seen: Arc<AtomicUsize>,
}

impl ContactSink for ContactCollector {
    fn begin_contacts(&mut self) {
        self.seen.store(0, Ordering::SeqCst);
    }

    fn add_contact(&mut self, _report: &ContactReport) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }

    fn end_contacts(&mut self) {}
}

impl PhysicsItem for ContactCollector {
    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn system(&self) -> Option<SystemTag> {
        self.system
    }

    fn set_ownership(&mut self, item_id: ItemId, tag: Option<SystemTag>) {
        self.item_id = item_id;
        self.system = tag;
    }

    fn dof(&self) -> usize {
        0
    }

    fn update(&mut self, _time: f64) {}
    fn variables_fb_reset(&mut self) {}
    fn variables_fb_load_forces(&mut self, _factor: f64) {}
    fn variables_qb_load_speed(&mut self) {}
    fn variables_fb_increment_mq(&mut self) {}
    fn variables_qb_increment_position(&mut self, _step: f64) {}
    fn variables_qb_set_speed(&mut self, _step: f64) {}
    fn set_no_speed_no_accel(&mut self) {}
    fn inject_variables(&mut self, _descriptor: &mut SystemDescriptor) {}
    fn fetch_solution(&mut self, _descriptor: &SystemDescriptor) {}

    fn as_contact_sink(&mut self) -> Option<&mut dyn ContactSink> {
        Some(self)
    }
}

fn colliding_pair(system: &mut System) {
    for x in [0.0, 0.9] {
        system.add_body(
            Body::new(MassProperties::sphere(1.0, 0.5))
                .with_pose(Pose::from_position(Point3::new(x, 0.0, 0.0)))
                .with_collision_model(CollisionModel::new(CollisionShape::sphere(0.5))),
        );
    }
}

#[test]
fn spring_item_oscillates_under_dynamics() {
    let mut system = System::new();
    let mut spring = AxialSpring::new(1.0, 10.0);
    spring.x = 1.0;
    system.add_other(Box::new(spring));

    system.do_step_dynamics(0.01).unwrap();

    // Impulse form: v1 = -k*x0*h/m, x1 = x0 + v1*h.
    // The item is opaque from outside; re-derive through the counters.
    assert_eq!(system.counters().ncoords_w, 1);
    assert_eq!(system.counters().n_others, 1);
    assert!(system.search("axial-spring").is_some());
}

/// Static solve with the displacement observable: the spring stretches by
/// exactly f / (m + k) under the direct strategy (the only one that
/// consumes tangent-stiffness blocks).
#[test]
fn static_linear_displacement_matches_schur_solve() {
    struct Reporter {
        inner: AxialSpring,
        out: Arc<std::sync::Mutex<f64>>,
    }
    impl PhysicsItem for Reporter {
        fn item_id(&self) -> ItemId {
            self.inner.item_id()
        }
        fn system(&self) -> Option<SystemTag> {
            self.inner.system()
        }
        fn set_ownership(&mut self, item_id: ItemId, tag: Option<SystemTag>) {
            self.inner.set_ownership(item_id, tag);
        }
        fn dof(&self) -> usize {
            self.inner.dof()
        }
        fn update(&mut self, time: f64) {
            self.inner.update(time);
            *self.out.lock().unwrap() = self.inner.x;
        }
        fn variables_fb_reset(&mut self) {
            self.inner.variables_fb_reset();
        }
        fn variables_fb_load_forces(&mut self, factor: f64) {
            self.inner.variables_fb_load_forces(factor);
        }
        fn variables_qb_load_speed(&mut self) {
            self.inner.variables_qb_load_speed();
        }
        fn variables_fb_increment_mq(&mut self) {
            self.inner.variables_fb_increment_mq();
        }
        fn variables_qb_increment_position(&mut self, step: f64) {
            self.inner.variables_qb_increment_position(step);
        }
        fn variables_qb_set_speed(&mut self, step: f64) {
            self.inner.variables_qb_set_speed(step);
        }
        fn set_no_speed_no_accel(&mut self) {
            self.inner.set_no_speed_no_accel();
        }
        fn load_krm(&mut self, k: f64, r: f64, m: f64) {
            self.inner.load_krm(k, r, m);
        }
        fn inject_variables(&mut self, d: &mut SystemDescriptor) {
            self.inner.inject_variables(d);
        }
        fn inject_krm(&mut self, d: &mut SystemDescriptor) {
            self.inner.inject_krm(d);
        }
        fn fetch_solution(&mut self, d: &SystemDescriptor) {
            self.inner.fetch_solution(d);
        }
    }

    let out = Arc::new(std::sync::Mutex::new(0.0));
    let mut inner = AxialSpring::new(1.0, 99.0);
    inner.external_force = 10.0;
    let reporter = Reporter {
        inner,
        out: Arc::clone(&out),
    };

    let mut system = System::new();
    system.set_solver_kind(SolverKind::ActiveSetDirect);
    system.add_other(Box::new(reporter));
    system.do_static_linear();

    assert_relative_eq!(*out.lock().unwrap(), 0.1, epsilon = 1e-9);
}

#[test]
fn contact_sink_receives_reports() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut system = System::new();
    colliding_pair(&mut system);
    let id = system.add_other(Box::new(ContactCollector {
        item_id: ItemId::new(0),
        system: None,
        seen: Arc::clone(&seen),
    }));

    system.compute_collisions();

    // The collector saw the sphere-sphere report through the capability
    // query; so did the default container.
    assert_eq!(system.n_contacts(), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let removed = system.remove_other(id);
    assert!(removed.system().is_none());
}

#[test]
fn contact_filter_can_veto_contacts() {
    let mut system = System::new();
    colliding_pair(&mut system);
    system.set_contact_filter(Some(Box::new(|_report| ContactDecision::Reject)));
    system.compute_collisions();
    assert_eq!(system.n_contacts(), 0);

    system.set_contact_filter(None);
    system.compute_collisions();
    assert_eq!(system.n_contacts(), 1);
}

#[test]
fn custom_collision_hook_runs_after_detection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_hook = Arc::clone(&calls);

    let mut system = System::new();
    colliding_pair(&mut system);
    system.set_custom_collision(Some(Box::new(move |sys: &mut System| {
        // Detection already ran: the container is populated.
        assert_eq!(sys.contact_container().n_contacts(), 1);
        calls_in_hook.fetch_add(1, Ordering::SeqCst);
    })));

    system.compute_collisions();
    system.compute_collisions();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn hooks_and_probes_run_each_step() {
    struct Pusher {
        target: BodyId,
    }
    impl StepHook for Pusher {
        fn on_step_begin(&mut self, system: &mut System) {
            if let Some(body) = system.body_mut(self.target) {
                body.apply_force(Vector3::new(1.0, 0.0, 0.0));
            }
        }
    }

    struct XRecorder {
        samples: Arc<std::sync::Mutex<Vec<(f64, f64)>>>,
    }
    impl Probe for XRecorder {
        fn record(&mut self, time: f64, system: &System) {
            let x = system.bodies()[0].twist().linear.x;
            self.samples.lock().unwrap().push((time, x));
        }
        fn reset(&mut self) {
            self.samples.lock().unwrap().clear();
        }
    }

    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    let id = system.add_body(Body::new(MassProperties::sphere(1.0, 0.5)));
    system.add_step_hook(Box::new(Pusher { target: id }));
    let samples = Arc::new(std::sync::Mutex::new(Vec::new()));
    system.add_probe(Box::new(XRecorder {
        samples: Arc::clone(&samples),
    }));

    for _ in 0..5 {
        system.do_step_dynamics(0.01).unwrap();
    }

    // 1 N on 1 kg for 5 steps of 10 ms: v_x = 0.05.
    assert_relative_eq!(
        system.body(id).unwrap().twist().linear.x,
        0.05,
        epsilon = 1e-12
    );
    let recorded = samples.lock().unwrap();
    assert_eq!(recorded.len(), 5);
    // Probes fire after the clock advances.
    assert_relative_eq!(recorded[0].0, 0.01, epsilon = 1e-12);

    drop(recorded);
    system.reset_all_probes();
    assert!(samples.lock().unwrap().is_empty());
}

#[test]
fn solver_instances_can_be_swapped() {
    let mut system = System::new();
    system.change_solver_speed(Box::new(ProjectedSymmSor::default()));
    system.change_solver_stab(Box::new(ProjectedSymmSor::default()));
    system.change_descriptor(SystemDescriptor::new());
    system.set_thread_count(2);

    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(0.0, 0.0, 1.0))),
    );
    system.do_step_dynamics(0.01).unwrap();
    assert_relative_eq!(
        system.bodies()[0].twist().linear.z,
        -9.81 * 0.01,
        epsilon = 1e-12
    );
}
