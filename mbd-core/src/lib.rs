//! Time-stepping multibody system coordinator.
//!
//! This crate owns the simulation objects and the per-step pipeline:
//!
//! - [`Body`], [`Link`], [`Marker`] - rigid bodies and the constraints
//!   between them, resolved through marker frames
//! - [`ContactContainer`] - the per-step set of contact constraints
//! - [`PhysicsItem`] - the capability surface for other simulatable items
//!   (finite-element style meshes, particle clusters)
//! - [`CollisionEngine`] - the pluggable collision boundary, with a
//!   built-in brute-force engine
//! - [`System`] - the coordinator: attach/detach, per-step assembly into a
//!   [`mbd_solver::SystemDescriptor`], solver dispatch, Anitescu/Tasora
//!   integration, sleeping, assembly/statics, and the multi-step drivers
//!
//! # One Step
//!
//! ```text
//! hooks -> collisions -> setup -> update -> wake -> reset/load/inject
//!       -> speed solve -> scatter -> position update -> [Tasora: second
//!       solve -> position correction] -> end-of-step hooks -> probes
//! ```
//!
//! # Example
//!
//! ```
//! use mbd_core::{Body, System};
//! use mbd_types::{MassProperties, Point3, Pose};
//!
//! let mut system = System::new();
//! system.add_body(
//!     Body::new(MassProperties::sphere(1.0, 0.5))
//!         .with_pose(Pose::from_position(Point3::new(0.0, 0.0, 10.0))),
//! );
//! for _ in 0..10 {
//!     system.do_step_dynamics(0.01).unwrap();
//! }
//! assert!(system.bodies()[0].pose().position.z < 10.0);
//! ```

#![doc(html_root_url = "https://docs.rs/mbd-core/0.3.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
)]

mod body;
mod collision;
mod contact;
mod hooks;
mod item;
mod link;
mod marker;
#[cfg(feature = "serde")]
mod snapshot;
mod system;

pub use body::Body;
pub use collision::{
    BruteForceEngine, ColliderKey, CollisionEngine, CollisionModel, CollisionShape,
    ContactDecision, ContactReport, ProximityReport, SurfaceMaterial,
};
pub use contact::{Contact, ContactContainer};
pub use hooks::{EventCounters, Probe, StepHook, StepTimers};
pub use item::{CachePhase, ContactSink, ItemRef, PhysicsItem, ProximitySink};
pub use link::{Link, LinkKind};
pub use marker::Marker;
#[cfg(feature = "serde")]
pub use snapshot::{BodySnapshot, LinkSnapshot, MarkerSnapshot, SystemSnapshot};
pub use system::{AnyItem, AssemblyAction, ItemHandle, System, SystemCounters};

pub use mbd_solver::{CcpSolver, SolveStats, SystemDescriptor};
pub use mbd_types::{
    BodyId, IntegrationScheme, ItemId, LinkId, MarkerId, MassProperties, Matrix3, MbdError,
    Point3, Pose, Result, SolverKind, SolverSettings, StepAdaption, StepSettings, SystemTag,
    Twist, UnitQuaternion, Vector3,
};
