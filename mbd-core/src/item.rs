//! The capability surface for generic physics items, and the uniform
//! iteration over everything a system owns.
//!
//! Bodies and links are concrete types; everything else that can simulate
//! (finite-element style meshes, particle clusters) attaches through the
//! [`PhysicsItem`] trait. The trait is the full block protocol the
//! assembly pipeline speaks, with no-op defaults for capabilities an item
//! does not have — the system checks capabilities by asking the item, never
//! by inspecting its concrete type.

use mbd_solver::SystemDescriptor;
use mbd_types::{ItemId, SystemTag};

use crate::body::Body;
use crate::collision::{CollisionEngine, ContactReport, ProximityReport};
use crate::contact::ContactContainer;
use crate::link::Link;

/// Which warm-start cache a multiplier transfer targets.
///
/// Caches are only valid between solves of the same phase; the speed and
/// position caches never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    /// Velocity-level solve multipliers.
    Speed,
    /// Position-stabilization solve multipliers.
    Position,
}

/// An item that accepts contact reports from the collision bridge.
pub trait ContactSink {
    /// Called before the first report of a collision pass.
    fn begin_contacts(&mut self);
    /// Offer one contact report; the sink decides whether it cares.
    fn add_contact(&mut self, report: &ContactReport);
    /// Called after the last report of a collision pass.
    fn end_contacts(&mut self);
}

/// An item that accepts proximity reports from the collision bridge.
pub trait ProximitySink {
    /// Offer one proximity report.
    fn add_proximity(&mut self, report: &ProximityReport);
}

/// A generic simulatable item: the capability surface the coordinator
/// consumes.
///
/// Implementations own their variable and constraint blocks and mirror the
/// body/link protocol: reset and load accumulate into the blocks, inject
/// copies them into the descriptor, fetch scatters the solution back.
#[allow(unused_variables)]
pub trait PhysicsItem: Send {
    /// Item name, for search and diagnostics.
    fn name(&self) -> Option<&str> {
        None
    }

    /// System-assigned item id.
    fn item_id(&self) -> ItemId;

    /// The owning system's tag, if attached.
    fn system(&self) -> Option<SystemTag>;

    /// Called by the system on attach (tag set) and detach (tag cleared).
    fn set_ownership(&mut self, item_id: ItemId, tag: Option<SystemTag>);

    /// Velocity-level degrees of freedom.
    fn dof(&self) -> usize;

    /// Bilateral constraint rows contributed.
    fn doc_c(&self) -> usize {
        0
    }

    /// Unilateral constraint rows contributed.
    fn doc_d(&self) -> usize {
        0
    }

    /// Propagate kinematic state to time `time`.
    fn update(&mut self, time: f64);

    /// Whether this item carries collision geometry.
    fn collide(&self) -> bool {
        false
    }

    /// Register collision geometry with the engine (on attach).
    fn register_collision(&self, engine: &mut dyn CollisionEngine) {}

    /// Unregister collision geometry (on detach; called while the item
    /// still belongs to the system).
    fn unregister_collision(&self, engine: &mut dyn CollisionEngine) {}

    /// Push current poses into the engine before a collision pass.
    fn sync_collision(&self, engine: &mut dyn CollisionEngine) {}

    // --- block protocol ---------------------------------------------------

    /// Zero the variable blocks' force accumulators.
    fn variables_fb_reset(&mut self);

    /// fb += applied forces * factor.
    fn variables_fb_load_forces(&mut self, factor: f64);

    /// qb = current velocities.
    fn variables_qb_load_speed(&mut self);

    /// fb += M * qb.
    fn variables_fb_increment_mq(&mut self);

    /// positions += qb * step.
    fn variables_qb_increment_position(&mut self, step: f64);

    /// Adopt qb as the new velocities (acceleration by difference).
    fn variables_qb_set_speed(&mut self, step: f64);

    /// Zero velocities and accelerations.
    fn set_no_speed_no_accel(&mut self);

    /// Zero the constraint rows' bookkeeping accumulators.
    fn constraints_bi_reset(&mut self) {}

    /// rhs += C * factor (clamped when requested).
    fn constraints_bi_load_c(&mut self, factor: f64, recovery_clamp: f64, do_clamp: bool) {}

    /// rhs += Ct * factor.
    fn constraints_bi_load_ct(&mut self, factor: f64) {}

    /// Recompute jacobians into the constraint rows.
    fn constraints_load_jacobians(&mut self) {}

    /// Refresh the tangent-operator block as `K*kf + R*rf + M*mf`.
    fn load_krm(&mut self, k_factor: f64, r_factor: f64, m_factor: f64) {}

    /// Register variable blocks with the descriptor.
    fn inject_variables(&mut self, descriptor: &mut SystemDescriptor);

    /// Register constraint rows with the descriptor.
    fn inject_constraints(&mut self, descriptor: &mut SystemDescriptor) {}

    /// Register tangent-operator blocks with the descriptor.
    fn inject_krm(&mut self, descriptor: &mut SystemDescriptor) {}

    /// Scatter the solved velocities and multipliers back into the item.
    fn fetch_solution(&mut self, descriptor: &SystemDescriptor);

    /// Convert multipliers into reactions (`reaction = multiplier * factor`).
    fn fetch_reactions(&mut self, factor: f64) {}

    /// Seed the constraint rows from a warm-start cache.
    fn load_multiplier_cache(&mut self, phase: CachePhase) {}

    /// Save the solved multipliers into a warm-start cache.
    fn store_multiplier_cache(&mut self, phase: CachePhase) {}

    /// Contact-report capability, if this item accepts contacts.
    fn as_contact_sink(&mut self) -> Option<&mut dyn ContactSink> {
        None
    }

    /// Proximity-report capability, if this item accepts proximities.
    fn as_proximity_sink(&mut self) -> Option<&mut dyn ProximitySink> {
        None
    }
}

/// A uniform view of one item a system owns, in traversal order: bodies,
/// then links, then other items, then the contact container.
///
/// This is the single tagged iterator replacing per-collection loops where
/// uniform treatment is wanted; it is finite and restartable per step.
#[derive(Debug)]
pub enum ItemRef<'a> {
    /// A rigid body.
    Body(&'a Body),
    /// A link.
    Link(&'a Link),
    /// A generic physics item.
    Other(&'a dyn PhysicsItem),
    /// The contact container.
    Contacts(&'a ContactContainer),
}

impl ItemRef<'_> {
    /// Item name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Body(b) => b.name(),
            Self::Link(l) => l.name(),
            Self::Other(o) => o.name(),
            Self::Contacts(_) => None,
        }
    }
}

impl<'a> std::fmt::Debug for (dyn PhysicsItem + 'a) {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicsItem({})", self.item_id())
    }
}
