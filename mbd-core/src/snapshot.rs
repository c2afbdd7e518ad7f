//! Snapshot round-trip of system configuration and membership.
//!
//! A [`SystemSnapshot`] captures everything needed to rebuild a system:
//! settings, solver selection, gravity, clock, and the full body/link
//! membership (links by marker id). Restoring replays the normal attach
//! protocol, re-resolves marker references (pruning links that no longer
//! resolve), and runs setup. The serialized form is whatever serde format
//! the caller picks; no wire format is promised.

use mbd_types::{
    IntegrationScheme, MarkerId, Matrix3, MassProperties, MbdError, Pose, Result, SolverKind,
    SolverSettings, StepSettings, Twist, Vector3,
};
use serde::{Deserialize, Serialize};

use crate::body::Body;
use crate::collision::CollisionModel;
use crate::link::{Link, LinkKind};
use crate::marker::Marker;
use crate::system::System;

/// Serialized marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerSnapshot {
    /// Marker id (the weak-reference currency for links).
    pub id: u64,
    /// Marker name.
    pub name: Option<String>,
    /// Frame relative to the owning body.
    pub rel_pose: Pose,
}

/// Serialized body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodySnapshot {
    /// Body name.
    pub name: Option<String>,
    /// Pose at capture time.
    pub pose: Pose,
    /// Twist at capture time.
    pub twist: Twist,
    /// Mass (kg).
    pub mass: f64,
    /// Inertia tensor, local frame.
    pub inertia: Matrix3<f64>,
    /// Fixed-to-ground flag.
    pub fixed: bool,
    /// Collision model, if any.
    pub collision: Option<CollisionModel>,
    /// Markers on this body.
    pub markers: Vec<MarkerSnapshot>,
}

/// Serialized link (membership by marker id, resolved on restore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSnapshot {
    /// Link name.
    pub name: Option<String>,
    /// First marker id.
    pub marker_a: u64,
    /// Second marker id.
    pub marker_b: u64,
    /// Constraint kind.
    pub kind: LinkKind,
}

/// Full system configuration and membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Selected solver strategy.
    pub solver_kind: SolverKind,
    /// Selected integration scheme.
    pub scheme: IntegrationScheme,
    /// Solver configuration.
    pub solver_settings: SolverSettings,
    /// Stepping configuration.
    pub step_settings: StepSettings,
    /// Gravitational acceleration.
    pub gravity: Vector3<f64>,
    /// Simulation clock at capture time.
    pub time: f64,
    /// Bodies, in attach order.
    pub bodies: Vec<BodySnapshot>,
    /// Links, in attach order.
    pub links: Vec<LinkSnapshot>,
}

impl SystemSnapshot {
    /// Capture a system's configuration and membership.
    #[must_use]
    pub fn capture(system: &System) -> Self {
        let bodies = system
            .bodies()
            .iter()
            .map(|b| BodySnapshot {
                name: b.name().map(str::to_owned),
                pose: *b.pose(),
                twist: *b.twist(),
                mass: b.mass_properties().mass(),
                inertia: *b.mass_properties().inertia(),
                fixed: b.is_fixed(),
                collision: b.collision_model().cloned(),
                markers: b
                    .markers()
                    .iter()
                    .map(|m| MarkerSnapshot {
                        id: m.id().raw(),
                        name: m.name().map(str::to_owned),
                        rel_pose: *m.rel_pose(),
                    })
                    .collect(),
            })
            .collect();
        let links = system
            .links()
            .iter()
            .map(|l| LinkSnapshot {
                name: l.name().map(str::to_owned),
                marker_a: l.marker_a().raw(),
                marker_b: l.marker_b().raw(),
                kind: l.kind(),
            })
            .collect();
        Self {
            solver_kind: system.solver_kind(),
            scheme: system.integration_scheme(),
            solver_settings: *system.solver_settings(),
            step_settings: *system.step_settings(),
            gravity: *system.gravity(),
            time: system.time(),
            bodies,
            links,
        }
    }

    /// Rebuild a system from this snapshot.
    ///
    /// Replays the attach protocol for every body and link, then
    /// re-resolves marker references (links whose markers no longer
    /// resolve are pruned, not fatal) and runs setup.
    pub fn restore(&self) -> Result<System> {
        let mut system = System::new();
        system.set_solver_kind(self.solver_kind);
        system.set_integration_scheme(self.scheme);
        system
            .set_solver_settings(self.solver_settings)
            .map_err(|e| MbdError::snapshot(format!("bad solver settings: {e}")))?;
        system
            .set_step_settings(self.step_settings)
            .map_err(|e| MbdError::snapshot(format!("bad step settings: {e}")))?;
        system.set_gravity(self.gravity);
        system.set_time(self.time);

        for snap in &self.bodies {
            let props = MassProperties::new(snap.mass, snap.inertia);
            props
                .validate()
                .map_err(|e| MbdError::snapshot(format!("bad body record: {e}")))?;
            let mut body = Body::new(props)
                .with_pose(snap.pose)
                .with_twist(snap.twist)
                .with_fixed(snap.fixed);
            if let Some(name) = &snap.name {
                body = body.with_name(name.clone());
            }
            if let Some(collision) = &snap.collision {
                body = body.with_collision_model(collision.clone());
            }
            for marker in &snap.markers {
                let mut m = Marker::new(MarkerId::new(marker.id), marker.rel_pose);
                if let Some(name) = &marker.name {
                    m = m.with_name(name.clone());
                }
                body.add_marker(m);
            }
            system.add_body(body);
        }

        for snap in &self.links {
            let mut link = Link::new(
                MarkerId::new(snap.marker_a),
                MarkerId::new(snap.marker_b),
                snap.kind,
            );
            if let Some(name) = &snap.name {
                link = link.with_name(name.clone());
            }
            system.add_link(link);
        }

        system.reference_markers_by_id();
        system.setup();
        Ok(system)
    }
}

impl System {
    /// Capture configuration and membership for serialization.
    #[must_use]
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::capture(self)
    }
}
