//! End-to-end stepping behavior: integration schemes, contacts, links,
//! sleeping, and the multi-step drivers.

use approx::assert_relative_eq;
use mbd_core::{
    Body, CollisionModel, CollisionShape, IntegrationScheme, Link, LinkKind, Marker, MarkerId,
    MassProperties, Point3, Pose, SolverKind, SurfaceMaterial, System, Twist,
};
use mbd_types::Vector3;

const H: f64 = 0.01;

fn ball_at(z: f64) -> Body {
    Body::new(MassProperties::sphere(1.0, 0.5))
        .with_pose(Pose::from_position(Point3::new(0.0, 0.0, z)))
}

fn collidable_ball(x: f64, z: f64) -> Body {
    Body::new(MassProperties::sphere(1.0, 0.5))
        .with_pose(Pose::from_position(Point3::new(x, 0.0, z)))
        .with_collision_model(CollisionModel::new(CollisionShape::sphere(0.5)))
}

fn ground() -> Body {
    Body::new(MassProperties::sphere(1.0, 1.0))
        .with_fixed(true)
        .with_collision_model(CollisionModel::new(CollisionShape::ground_plane(0.0)))
}

/// A free-falling unconstrained body gains exactly -g*h of vertical
/// velocity in one step: the `[M]*v_old + f*h` loading path.
#[test]
fn free_fall_velocity_after_one_step() {
    let mut system = System::new();
    let id = system.add_body(ball_at(10.0));
    system.do_step_dynamics(H).unwrap();

    let body = system.body(id).unwrap();
    assert_relative_eq!(body.twist().linear.z, -9.81 * H, epsilon = 1e-12);
    assert_relative_eq!(
        body.pose().position.z,
        10.0 - 9.81 * H * H,
        epsilon = 1e-12
    );
    assert_relative_eq!(body.linear_acceleration().z, -9.81, epsilon = 1e-9);
}

/// With no forces and no constraints, rest stays at rest.
#[test]
fn rest_stays_at_rest() {
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    let id = system.add_body(ball_at(2.0));
    for _ in 0..5 {
        system.do_step_dynamics(H).unwrap();
    }
    let body = system.body(id).unwrap();
    assert_eq!(body.pose().position.z, 2.0);
    assert_eq!(body.twist().speed(), 0.0);
}

#[test]
fn invalid_timestep_is_rejected() {
    let mut system = System::new();
    system.add_body(ball_at(0.0));
    assert!(system.do_step_dynamics(0.0).is_err());
    assert!(system.do_step_dynamics(f64::NAN).is_err());
    assert!(system.do_step_dynamics(-0.1).is_err());
}

/// A ball touching the ground plane stops sinking: the unilateral contact
/// row absorbs exactly the approach velocity.
#[test]
fn ball_rests_on_ground_plane() {
    let mut system = System::new();
    let id = system.add_body(collidable_ball(0.0, 0.5));
    system.add_body(ground());

    for _ in 0..50 {
        system.do_step_dynamics(H).unwrap();
    }
    let body = system.body(id).unwrap();
    assert_relative_eq!(body.pose().position.z, 0.5, epsilon = 1e-6);
    assert!(body.twist().speed() < 1e-9);
    assert_eq!(system.n_contacts(), 1);

    // The contact reaction carries the weight: l/h = m*g along the normal.
    let contact = &system.contact_container().contacts()[0];
    assert_relative_eq!(contact.reaction()[0], 9.81, epsilon = 1e-6);
}

/// A distance link to a fixed anchor holds a hanging body, and the
/// scattered reaction equals the supported weight.
#[test]
fn distance_link_supports_weight() {
    let mut system = System::new();
    let ball = system
        .add_body(ball_at(0.0).with_marker(Marker::new(MarkerId::new(1), Pose::identity())));
    system.add_body(
        ball_at(3.0)
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    let link = system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Distance { length: 3.0 },
    ));

    system.do_step_dynamics(H).unwrap();

    let body = system.body(ball).unwrap();
    assert_relative_eq!(body.twist().linear.z, 0.0, epsilon = 1e-12);
    assert_relative_eq!(body.pose().position.z, 0.0, epsilon = 1e-12);
    // Reaction on the anchor: the hanging weight, pointing down.
    let link = system.link(link).unwrap();
    assert_relative_eq!(link.reaction_force().z, -9.81, epsilon = 1e-9);
}

/// Every strategy in the closed solver set agrees on the hanging-body
/// problem.
#[test]
fn all_solver_kinds_agree_on_bilateral_problem() {
    for kind in [
        SolverKind::ProjectedSor,
        SolverKind::ProjectedSymmSor,
        SolverKind::ProjectedJacobi,
        SolverKind::ProjectedApgd,
        SolverKind::ActiveSetDirect,
        SolverKind::ProjectedSorMultithread,
    ] {
        let mut system = System::new();
        system.set_solver_kind(kind);
        let mut settings = *system.solver_settings();
        settings.max_iterations_speed = 500;
        system.set_solver_settings(settings).unwrap();

        let ball = system
            .add_body(ball_at(0.0).with_marker(Marker::new(MarkerId::new(1), Pose::identity())));
        system.add_body(
            ball_at(3.0)
                .with_fixed(true)
                .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
        );
        system.add_link(Link::new(
            MarkerId::new(1),
            MarkerId::new(2),
            LinkKind::Distance { length: 3.0 },
        ));

        system.do_step_dynamics(H).unwrap();
        let vz = system.body(ball).unwrap().twist().linear.z;
        assert!(vz.abs() < 1e-4, "{kind:?} left residual velocity {vz}");
    }
}

/// Tasora: the second (position) solve removes constraint drift directly,
/// without inducing velocity.
#[test]
fn tasora_position_projection_closes_drift() {
    let mut system = System::new();
    system.set_integration_scheme(IntegrationScheme::Tasora);
    system.set_gravity(Vector3::zeros());
    let ball = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(1.1, 0.0, 0.0)))
            .with_marker(Marker::new(MarkerId::new(1), Pose::identity())),
    );
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Distance { length: 1.0 },
    ));

    system.do_step_dynamics(H).unwrap();

    let body = system.body(ball).unwrap();
    // The 0.1 violation is gone after one step, and no spurious velocity
    // was created (the speed solve ran with zero recovery).
    assert_relative_eq!(body.pose().position.x, 1.0, epsilon = 1e-9);
    assert!(body.twist().speed() < 1e-9);
}

/// Anitescu: the violation recovery speed is clamped, so a large drift
/// recovers at exactly `max_penetration_recovery_speed`.
#[test]
fn anitescu_recovery_speed_is_clamped() {
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    let ball = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(1.1, 0.0, 0.0)))
            .with_marker(Marker::new(MarkerId::new(1), Pose::identity())),
    );
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Distance { length: 1.0 },
    ));

    system.do_step_dynamics(H).unwrap();

    // C/dt would demand 10 m/s of recovery; the clamp caps it at 0.6.
    let body = system.body(ball).unwrap();
    assert_relative_eq!(body.twist().linear.x, -0.6, epsilon = 1e-9);
    assert_relative_eq!(body.pose().position.x, 1.1 - 0.6 * H, epsilon = 1e-9);
}

/// A revolute joint holds its anchor point under gravity.
#[test]
fn revolute_joint_holds_anchor() {
    let mut system = System::new();
    let ball = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.2))
            .with_pose(Pose::from_position(Point3::new(1.0, 0.0, 0.0)))
            .with_twist(Twist::new(
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ))
            .with_marker(Marker::new(
                MarkerId::new(1),
                Pose::from_position(Point3::new(-1.0, 0.0, 0.0)),
            )),
    );
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.2))
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Revolute,
    ));

    for _ in 0..20 {
        system.do_step_dynamics(H).unwrap();
    }

    // The body orbits the hinge; its distance from the anchor stays 1.
    let body = system.body(ball).unwrap();
    let radius = body.pose().position.coords.norm();
    assert!((radius - 1.0).abs() < 5e-3, "radius drifted to {radius}");
    // It is actually moving (the hinge leaves the z rotation free).
    assert!(body.twist().angular_speed() > 0.5);
}

/// The rheonomic motor row drives the relative velocity through the `Ct`
/// term.
#[test]
fn linear_motor_drives_target_speed() {
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    system.add_body(
        ball_at(0.0)
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(1), Pose::identity())),
    );
    let slider = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(1.0, 0.0, 0.0)))
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::LinearMotor { speed: 2.0 },
    ));

    system.do_step_dynamics(H).unwrap();
    assert_relative_eq!(
        system.body(slider).unwrap().twist().linear.x,
        2.0,
        epsilon = 1e-9
    );
}

/// Frame snapping: a remainder below 1.3x the step becomes the exact final
/// step, and the configured step is restored afterwards.
#[test]
fn frame_dynamics_snaps_to_boundary() {
    let mut system = System::new();
    system.add_body(ball_at(0.0));
    let mut steps = *system.step_settings();
    steps.step = 0.04;
    system.set_step_settings(steps).unwrap();

    let reached = system.do_frame_dynamics(0.1).unwrap();
    assert!(reached);
    assert_relative_eq!(system.time(), 0.1, epsilon = 1e-12);
    // Three steps: 0.04, 0.04, then the 0.02 remainder.
    assert_eq!(system.step_count(), 3);
    assert_eq!(system.step_settings().step, 0.04);
}

#[test]
fn entire_dynamics_runs_to_end_time() {
    let mut system = System::new();
    system.add_body(ball_at(100.0));
    let mut steps = *system.step_settings();
    steps.step = 0.02;
    steps.end_time = 0.1;
    system.set_step_settings(steps).unwrap();

    assert!(system.do_entire_dynamics().unwrap());
    assert!(system.time() >= 0.1);

    let mut uniform = System::new();
    uniform.add_body(ball_at(100.0));
    let mut steps = *uniform.step_settings();
    steps.step = 0.02;
    steps.end_time = 0.1;
    uniform.set_step_settings(steps).unwrap();
    assert!(uniform.do_entire_uniform_dynamics(0.05).unwrap());
}

/// Sleeping: a body at rest long enough falls asleep and stops consuming
/// DOF; a disturbance wakes it.
#[test]
fn resting_body_falls_asleep_and_wakes_on_force() {
    let mut system = System::new();
    system.set_use_sleeping(true);
    let id = system.add_body(collidable_ball(0.0, 0.5));
    system.add_body(ground());

    for _ in 0..80 {
        system.do_step_dynamics(H).unwrap();
    }
    assert!(system.body(id).unwrap().is_sleeping());
    assert_eq!(system.counters().n_bodies_sleeping, 1);

    system.body_mut(id).unwrap().apply_force(Vector3::new(5.0, 0.0, 0.0));
    assert!(!system.body(id).unwrap().is_sleeping());
}

/// Sleeping propagation: a sleeping body in contact with an awake,
/// non-fixed body is woken.
#[test]
fn contact_with_awake_body_wakes_sleeper() {
    let mut system = System::new();
    system.set_use_sleeping(true);
    let sleeper = system.add_body(collidable_ball(0.0, 0.5));
    let awake = system.add_body(collidable_ball(0.9, 0.5));
    system.body_mut(sleeper).unwrap().put_to_sleep();
    system
        .body_mut(awake)
        .unwrap()
        .set_twist(Twist::from_linear(Vector3::new(-1.0, 0.0, 0.0)));

    system.compute_collisions();
    assert_eq!(system.n_contacts(), 1);
    system.wake_up_sleeping_bodies();
    assert!(!system.body(sleeper).unwrap().is_sleeping());
}

/// A link that requires waking keeps both endpoints awake.
#[test]
fn waking_link_wakes_endpoints() {
    let mut system = System::new();
    system.set_use_sleeping(true);
    let a = system
        .add_body(ball_at(0.0).with_marker(Marker::new(MarkerId::new(1), Pose::identity())));
    let b = system.add_body(
        ball_at(1.0).with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::LinearMotor { speed: 1.0 },
    ));
    system.body_mut(a).unwrap().put_to_sleep();
    system.body_mut(b).unwrap().put_to_sleep();

    system.update();
    system.wake_up_sleeping_bodies();
    assert!(!system.body(a).unwrap().is_sleeping());
    assert!(!system.body(b).unwrap().is_sleeping());
}

/// Two identical runs produce bitwise-identical trajectories.
#[test]
fn identical_runs_are_bitwise_deterministic() {
    let run = || {
        let mut system = System::new();
        system.add_body(collidable_ball(0.0, 2.0));
        system.add_body(collidable_ball(0.3, 3.0));
        system.add_body(collidable_ball(-0.4, 4.2).with_collision_model(
            CollisionModel::new(CollisionShape::sphere(0.5)).with_material(SurfaceMaterial {
                friction: 0.4,
                restitution: 0.3,
            }),
        ));
        system.add_body(ground());
        for _ in 0..40 {
            system.do_step_dynamics(H).unwrap();
        }
        system
            .bodies()
            .iter()
            .flat_map(|b| {
                [
                    b.pose().position.x.to_bits(),
                    b.pose().position.y.to_bits(),
                    b.pose().position.z.to_bits(),
                    b.twist().linear.z.to_bits(),
                ]
            })
            .collect::<Vec<u64>>()
    };
    assert_eq!(run(), run());
}

/// A restituting contact bounces back with the expected fraction of the
/// approach speed; a slow approach does not bounce.
#[test]
fn restitution_bounces_above_threshold() {
    let bouncy = CollisionModel::new(CollisionShape::sphere(0.5)).with_material(SurfaceMaterial {
        friction: 0.0,
        restitution: 0.5,
    });
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    let id = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(0.0, 0.0, 0.5)))
            .with_twist(Twist::from_linear(Vector3::new(0.0, 0.0, -2.0)))
            .with_collision_model(bouncy),
    );
    system.add_body(ground());

    system.do_step_dynamics(H).unwrap();
    let vz = system.body(id).unwrap().twist().linear.z;
    // Outgoing speed is restitution * approach speed.
    assert_relative_eq!(vz, 1.0, epsilon = 1e-6);
}

/// Assembly closes an initially violated constraint configuration.
#[test]
fn do_assembly_closes_initial_clearance() {
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    let ball = system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(1.3, 0.0, 0.0)))
            .with_marker(Marker::new(MarkerId::new(1), Pose::identity())),
    );
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Distance { length: 1.0 },
    ));

    system.do_assembly(mbd_core::AssemblyAction::full());
    assert!(system.last_error().is_none());
    let x = system.body(ball).unwrap().pose().position.x;
    assert_relative_eq!(x, 1.0, epsilon = 1e-3);
}

/// Static relaxation damps a dropped body to rest on the ground.
#[test]
fn static_relaxing_comes_to_rest() {
    let mut system = System::new();
    let id = system.add_body(collidable_ball(0.0, 0.52));
    system.add_body(ground());
    let mut steps = *system.step_settings();
    steps.step = 0.04;
    system.set_step_settings(steps).unwrap();

    assert!(system.do_static_relaxing().unwrap());
    let body = system.body(id).unwrap();
    assert_eq!(body.twist().speed(), 0.0);
    assert!((body.pose().position.z - 0.5).abs() < 0.03);
}

/// Kinematics drivers run the Newton assembly per step.
#[test]
fn step_kinematics_reassembles() {
    let mut system = System::new();
    system.set_gravity(Vector3::zeros());
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_pose(Pose::from_position(Point3::new(1.2, 0.0, 0.0)))
            .with_marker(Marker::new(MarkerId::new(1), Pose::identity())),
    );
    system.add_body(
        Body::new(MassProperties::sphere(1.0, 0.5))
            .with_fixed(true)
            .with_marker(Marker::new(MarkerId::new(2), Pose::identity())),
    );
    system.add_link(Link::new(
        MarkerId::new(1),
        MarkerId::new(2),
        LinkKind::Distance { length: 1.0 },
    ));

    assert!(system.do_step_kinematics(0.02).unwrap());
    assert_relative_eq!(system.time(), 0.02, epsilon = 1e-12);
    // The clearance closed during assembly.
    let x = system.bodies()[0].pose().position.x;
    assert_relative_eq!(x, 1.0, epsilon = 1e-3);
}

/// Warm starting reuses cached multipliers and stays stable.
#[test]
fn warm_start_remains_stable() {
    let mut system = System::new();
    system.set_warm_start(true);
    let id = system.add_body(collidable_ball(0.0, 0.5));
    system.add_body(ground());

    for _ in 0..30 {
        system.do_step_dynamics(H).unwrap();
    }
    let body = system.body(id).unwrap();
    assert_relative_eq!(body.pose().position.z, 0.5, epsilon = 1e-6);
    assert!(body.twist().speed() < 1e-9);
}

/// Event counters and phase timers advance with the pipeline.
#[test]
fn events_and_timers_accumulate() {
    let mut system = System::new();
    system.add_body(ball_at(1.0));
    for _ in 0..3 {
        system.do_step_dynamics(H).unwrap();
    }
    assert_eq!(system.events().timesteps, 3);
    assert!(system.events().setups >= 3);
    assert!(system.events().updates >= 3);
    assert_eq!(system.step_count(), 3);

    system.reset_timers();
    system.do_step_dynamics(H).unwrap();
    assert!(system.timers().step > std::time::Duration::ZERO);
}
