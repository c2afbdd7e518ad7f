//! The physical system coordinator.
//!
//! Owns all simulation objects, assembles the global block system every
//! step, dispatches to the selected complementarity solver, and advances
//! state with either the Anitescu or the Tasora scheme.

use std::time::Instant;

use mbd_solver::{make_solver, CcpSolver, SystemDescriptor};
use mbd_types::{
    BodyId, IntegrationScheme, ItemId, LinkId, MarkerId, MbdError, Result, SolverKind,
    SolverSettings, StepAdaption, StepSettings, SystemTag, Vector3,
};
use tracing::{debug, warn};

use crate::body::Body;
use crate::collision::{
    BruteForceEngine, ColliderKey, CollisionEngine, ContactDecision, ContactReport,
};
use crate::contact::{ContactBody, ContactContainer};
use crate::hooks::{EventCounters, Probe, StepHook, StepTimers};
use crate::item::{CachePhase, ItemRef, PhysicsItem};
use crate::link::{Link, LinkEndpoint};
use crate::marker::Marker;

/// Iteration budget of the static relaxation heuristic.
const STATIC_RELAX_STEPS: usize = 20;

/// Aggregate counts recomputed by [`System::setup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemCounters {
    /// Active (not fixed, not sleeping) bodies.
    pub n_bodies: usize,
    /// Sleeping bodies.
    pub n_bodies_sleeping: usize,
    /// Fixed bodies.
    pub n_bodies_fixed: usize,
    /// Attached links.
    pub n_links: usize,
    /// Attached other physics items.
    pub n_others: usize,
    /// Position coordinates (7 per active body: quaternion pose).
    pub ncoords: usize,
    /// Velocity coordinates (6 per active body plus item DOF).
    pub ncoords_w: usize,
    /// Constraints including one quaternion-norm constraint per active body.
    pub ndoc: usize,
    /// Velocity-level constraints.
    pub ndoc_w: usize,
    /// Bilateral velocity-level constraints.
    pub ndoc_w_c: usize,
    /// Unilateral velocity-level constraints.
    pub ndoc_w_d: usize,
    /// Position-level system size (coordinates + multipliers).
    pub nsysvars: usize,
    /// Velocity-level system size (coordinates + multipliers).
    pub nsysvars_w: usize,
    /// Approximate free degrees of freedom (ignores constraint redundancy).
    pub ndof: i64,
    /// Contacts currently held by the contact container.
    pub ncontacts: usize,
}

/// Which operations [`System::do_assembly`] performs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyAction {
    /// Newton-iterate positions until constraints close.
    pub position: bool,
    /// Solve for consistent velocities afterwards.
    pub speed: bool,
    /// Estimate consistent accelerations afterwards.
    pub accel: bool,
    /// Re-run collision detection inside the Newton loop.
    pub with_collisions: bool,
}

impl AssemblyAction {
    /// Position, speed, and acceleration assembly, no collisions.
    #[must_use]
    pub fn full() -> Self {
        Self {
            position: true,
            speed: true,
            accel: true,
            with_collisions: false,
        }
    }

    /// Position assembly only.
    #[must_use]
    pub fn position_only() -> Self {
        Self {
            position: true,
            ..Default::default()
        }
    }
}

/// Any attachable item, classified by construction.
///
/// The generic [`System::add`]/[`System::remove`] dispatch on this tag;
/// there is no runtime type inspection anywhere in the container.
pub enum AnyItem {
    /// A rigid body.
    Body(Body),
    /// A link.
    Link(Link),
    /// A generic physics item.
    Other(Box<dyn PhysicsItem>),
}

/// Handle returned by the generic attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemHandle {
    /// Handle to a body.
    Body(BodyId),
    /// Handle to a link.
    Link(LinkId),
    /// Handle to a generic physics item.
    Other(ItemId),
}

/// Factor set for the generic right-hand-side assembler.
///
/// Every solve phase (velocity, stabilization, statics, kinematics) is this
/// one routine with a different factor combination.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LoadTerms {
    pub load_jacobians: bool,
    pub load_mv: bool,
    pub f_factor: f64,
    pub k_factor: f64,
    pub r_factor: f64,
    pub m_factor: f64,
    pub ct_factor: f64,
    pub c_factor: f64,
    pub recovery_clamp: f64,
    pub do_clamp: bool,
}

#[derive(Clone, Copy)]
enum HookPhase {
    Begin,
    Update,
    End,
}

/// The time-stepping physical system coordinator.
pub struct System {
    tag: SystemTag,

    bodies: Vec<Body>,
    links: Vec<Link>,
    others: Vec<Box<dyn PhysicsItem>>,
    contact_container: ContactContainer,

    collision_engine: Box<dyn CollisionEngine>,
    descriptor: SystemDescriptor,
    solver_speed: Box<dyn CcpSolver>,
    solver_stab: Box<dyn CcpSolver>,
    solver_kind: SolverKind,
    scheme: IntegrationScheme,

    solver_settings: SolverSettings,
    step_settings: StepSettings,
    gravity: Vector3<f64>,

    time: f64,
    step_count: u64,
    counters: SystemCounters,
    timers: StepTimers,
    events: EventCounters,
    last_error: Option<String>,

    hooks: Vec<Box<dyn StepHook>>,
    probes: Vec<Box<dyn Probe>>,
    contact_filter: Option<Box<dyn Fn(&ContactReport) -> ContactDecision + Send>>,
    custom_collision: Option<Box<dyn FnMut(&mut System) + Send>>,

    next_body_id: u64,
    next_link_id: u64,
    next_item_id: u64,
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    /// Create an empty system with the default solver, the built-in
    /// collision engine, and gravity along -Z.
    #[must_use]
    pub fn new() -> Self {
        let tag = SystemTag::next();
        let solver_settings = SolverSettings::default();
        let mut descriptor = SystemDescriptor::new();
        descriptor.set_threads(solver_settings.threads);
        let solver_kind = SolverKind::default();
        let mut contact_container = ContactContainer::new();
        contact_container.attach(tag, ItemId::new(0));
        Self {
            tag,
            bodies: Vec::new(),
            links: Vec::new(),
            others: Vec::new(),
            contact_container,
            collision_engine: Box::new(BruteForceEngine::new()),
            descriptor,
            solver_speed: make_solver(solver_kind),
            solver_stab: make_solver(solver_kind),
            solver_kind,
            scheme: IntegrationScheme::default(),
            solver_settings,
            step_settings: StepSettings::default(),
            gravity: Vector3::new(0.0, 0.0, -9.81),
            time: 0.0,
            step_count: 0,
            counters: SystemCounters::default(),
            timers: StepTimers::default(),
            events: EventCounters::default(),
            last_error: None,
            hooks: Vec::new(),
            probes: Vec::new(),
            contact_filter: None,
            custom_collision: None,
            next_body_id: 1,
            next_link_id: 1,
            next_item_id: 1,
        }
    }

    // =====================================================================
    // Container: attach / detach
    // =====================================================================

    /// Attach a body, assigning its ids and registering its collision
    /// geometry. Returns the assigned id.
    ///
    /// # Panics
    ///
    /// Panics if the body is already owned by a system.
    pub fn add_body(&mut self, mut body: Body) -> BodyId {
        assert!(
            body.system().is_none(),
            "body is already owned by a system; remove it there first"
        );
        let id = BodyId::new(self.next_body_id);
        self.next_body_id += 1;
        let item_id = ItemId::new(self.next_item_id);
        self.next_item_id += 1;
        body.attach(self.tag, id, item_id);
        if let Some(model) = body.collision_model() {
            self.collision_engine
                .add_model(ColliderKey::Body(id), model.clone(), *body.pose());
        }
        self.bodies.push(body);
        id
    }

    /// Detach a body and return it. Collision geometry is unregistered
    /// first, while the body still belongs to the system.
    ///
    /// # Panics
    ///
    /// Panics if no body with this id is attached.
    pub fn remove_body(&mut self, id: BodyId) -> Body {
        let Some(idx) = self.body_index(id) else {
            panic!("remove_body: {id} is not attached to this system");
        };
        if self.bodies[idx].collision_model().is_some() {
            self.collision_engine.remove_model(ColliderKey::Body(id));
        }
        let mut body = self.bodies.remove(idx);
        body.detach();
        body
    }

    /// Attach a link. Marker resolution happens at the next update.
    ///
    /// # Panics
    ///
    /// Panics if the link is already owned by a system.
    pub fn add_link(&mut self, mut link: Link) -> LinkId {
        assert!(
            link.system().is_none(),
            "link is already owned by a system; remove it there first"
        );
        let id = LinkId::new(self.next_link_id);
        self.next_link_id += 1;
        let item_id = ItemId::new(self.next_item_id);
        self.next_item_id += 1;
        link.attach(self.tag, id, item_id);
        self.links.push(link);
        id
    }

    /// Detach a link and return it.
    ///
    /// # Panics
    ///
    /// Panics if no link with this id is attached.
    pub fn remove_link(&mut self, id: LinkId) -> Link {
        let Some(idx) = self.links.iter().position(|l| l.id() == id) else {
            panic!("remove_link: {id} is not attached to this system");
        };
        let mut link = self.links.remove(idx);
        link.detach();
        link
    }

    /// Attach a generic physics item.
    ///
    /// # Panics
    ///
    /// Panics if the item is already owned by a system.
    pub fn add_other(&mut self, mut item: Box<dyn PhysicsItem>) -> ItemId {
        assert!(
            item.system().is_none(),
            "item is already owned by a system; remove it there first"
        );
        let item_id = ItemId::new(self.next_item_id);
        self.next_item_id += 1;
        item.set_ownership(item_id, Some(self.tag));
        if item.collide() {
            item.register_collision(self.collision_engine.as_mut());
        }
        self.others.push(item);
        item_id
    }

    /// Detach a generic physics item and return it.
    ///
    /// # Panics
    ///
    /// Panics if no item with this id is attached.
    pub fn remove_other(&mut self, id: ItemId) -> Box<dyn PhysicsItem> {
        let Some(idx) = self.others.iter().position(|o| o.item_id() == id) else {
            panic!("remove_other: {id} is not attached to this system");
        };
        if self.others[idx].collide() {
            self.others[idx].unregister_collision(self.collision_engine.as_mut());
        }
        let mut item = self.others.remove(idx);
        item.set_ownership(id, None);
        item
    }

    /// Attach any item, dispatching on its classification.
    pub fn add(&mut self, item: AnyItem) -> ItemHandle {
        match item {
            AnyItem::Body(body) => ItemHandle::Body(self.add_body(body)),
            AnyItem::Link(link) => ItemHandle::Link(self.add_link(link)),
            AnyItem::Other(other) => ItemHandle::Other(self.add_other(other)),
        }
    }

    /// Detach any item by handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not resolve in this system.
    pub fn remove(&mut self, handle: ItemHandle) -> AnyItem {
        match handle {
            ItemHandle::Body(id) => AnyItem::Body(self.remove_body(id)),
            ItemHandle::Link(id) => AnyItem::Link(self.remove_link(id)),
            ItemHandle::Other(id) => AnyItem::Other(self.remove_other(id)),
        }
    }

    /// Detach all bodies, running the full per-body protocol.
    pub fn remove_all_bodies(&mut self) {
        while let Some(id) = self.bodies.last().map(Body::id) {
            self.remove_body(id);
        }
    }

    /// Detach all links, running the full per-link protocol.
    pub fn remove_all_links(&mut self) {
        while let Some(id) = self.links.last().map(Link::id) {
            self.remove_link(id);
        }
    }

    /// Detach all other physics items, running the full per-item protocol.
    pub fn remove_all_others(&mut self) {
        while let Some(id) = self.others.last().map(|o| o.item_id()) {
            self.remove_other(id);
        }
    }

    /// Detach everything and reset time and counters.
    pub fn clear(&mut self) {
        self.remove_all_links();
        self.remove_all_bodies();
        self.remove_all_others();
        self.counters = SystemCounters::default();
        self.time = 0.0;
        self.step_count = 0;
    }

    // =====================================================================
    // Access and search
    // =====================================================================

    /// Attached bodies, in attach order (the offset order).
    #[must_use]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    /// Attached links, in attach order.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Attached other physics items.
    #[must_use]
    pub fn others(&self) -> &[Box<dyn PhysicsItem>] {
        &self.others
    }

    /// The contact container.
    #[must_use]
    pub fn contact_container(&self) -> &ContactContainer {
        &self.contact_container
    }

    /// Look up a body by id.
    #[must_use]
    pub fn body(&self, id: BodyId) -> Option<&Body> {
        self.body_index(id).map(|i| &self.bodies[i])
    }

    /// Mutable body lookup.
    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        let idx = self.body_index(id)?;
        Some(&mut self.bodies[idx])
    }

    /// Look up a link by id.
    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.iter().find(|l| l.id() == id)
    }

    /// Mutable link lookup.
    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.id() == id)
    }

    fn body_index(&self, id: BodyId) -> Option<usize> {
        self.bodies.iter().position(|b| b.id() == id)
    }

    /// Uniform iteration: bodies, links, other items, contact container.
    pub fn items(&self) -> impl Iterator<Item = ItemRef<'_>> {
        self.bodies
            .iter()
            .map(ItemRef::Body)
            .chain(self.links.iter().map(ItemRef::Link))
            .chain(self.others.iter().map(|o| ItemRef::Other(o.as_ref())))
            .chain(std::iter::once(ItemRef::Contacts(&self.contact_container)))
    }

    /// Find a body by name.
    #[must_use]
    pub fn search_body(&self, name: &str) -> Option<&Body> {
        self.bodies.iter().find(|b| b.name() == Some(name))
    }

    /// Find a link by name.
    #[must_use]
    pub fn search_link(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name() == Some(name))
    }

    /// Find any item by name: bodies first, then links, then other items.
    #[must_use]
    pub fn search(&self, name: &str) -> Option<ItemRef<'_>> {
        self.items().find(|i| i.name() == Some(name))
    }

    /// Find a marker by name over all bodies.
    #[must_use]
    pub fn search_marker(&self, name: &str) -> Option<(BodyId, MarkerId)> {
        self.bodies.iter().find_map(|b| {
            b.marker_by_name(name).map(|m| (b.id(), m.id()))
        })
    }

    /// Find a marker by id over all bodies.
    #[must_use]
    pub fn find_marker(&self, id: MarkerId) -> Option<(BodyId, &Marker)> {
        self.bodies
            .iter()
            .find_map(|b| b.marker(id).map(|m| (b.id(), m)))
    }

    /// Re-resolve every link's marker references after a state load.
    ///
    /// Each endpoint resolves from its own lookup. Links whose markers
    /// cannot both be found are marked invalid and pruned with the full
    /// detach protocol; the load as a whole proceeds.
    pub fn reference_markers_by_id(&mut self) {
        let resolvable: Vec<bool> = self
            .links
            .iter()
            .map(|l| {
                let first = self.find_marker(l.marker_a()).is_some();
                let second = self.find_marker(l.marker_b()).is_some();
                first && second
            })
            .collect();
        for idx in (0..self.links.len()).rev() {
            if !resolvable[idx] {
                let mut link = self.links.remove(idx);
                warn!(link = ?link.id(), "pruning link with unresolvable markers");
                link.invalidate();
                link.detach();
            }
        }
    }

    // =====================================================================
    // Settings and plug-in components
    // =====================================================================

    /// Current simulation time (s).
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Overwrite the simulation clock.
    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Steps taken since construction.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Gravitational acceleration applied to every body.
    #[must_use]
    pub fn gravity(&self) -> &Vector3<f64> {
        &self.gravity
    }

    /// Set the gravitational acceleration.
    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    /// Counters from the last [`System::setup`].
    #[must_use]
    pub fn counters(&self) -> &SystemCounters {
        &self.counters
    }

    /// Accumulated phase timers.
    #[must_use]
    pub fn timers(&self) -> &StepTimers {
        &self.timers
    }

    /// Zero the phase timers.
    pub fn reset_timers(&mut self) {
        self.timers = StepTimers::default();
    }

    /// Pipeline event tallies.
    #[must_use]
    pub fn events(&self) -> &EventCounters {
        &self.events
    }

    /// The last absorbed failure, if any (convergence shortfall or
    /// divergence). Multi-step drivers stop advancing while this is set.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Clear the absorbed-failure flag.
    pub fn clear_errors(&mut self) {
        self.last_error = None;
    }

    /// Contacts found by the last collision pass.
    #[must_use]
    pub fn n_contacts(&self) -> usize {
        self.contact_container.n_contacts()
    }

    /// The active integration scheme.
    #[must_use]
    pub fn integration_scheme(&self) -> IntegrationScheme {
        self.scheme
    }

    /// Select the per-step integration scheme.
    pub fn set_integration_scheme(&mut self, scheme: IntegrationScheme) {
        self.scheme = scheme;
    }

    /// Solver configuration.
    #[must_use]
    pub fn solver_settings(&self) -> &SolverSettings {
        &self.solver_settings
    }

    /// Replace the solver configuration (validated).
    pub fn set_solver_settings(&mut self, settings: SolverSettings) -> Result<()> {
        settings.validate()?;
        self.solver_settings = settings;
        Ok(())
    }

    /// Stepping configuration.
    #[must_use]
    pub fn step_settings(&self) -> &StepSettings {
        &self.step_settings
    }

    /// Replace the stepping configuration (validated).
    pub fn set_step_settings(&mut self, settings: StepSettings) -> Result<()> {
        settings.validate()?;
        self.step_settings = settings;
        Ok(())
    }

    /// Enable or disable sleeping.
    pub fn set_use_sleeping(&mut self, enabled: bool) {
        self.step_settings.use_sleeping = enabled;
    }

    /// Enable or disable warm starting of the iterative solvers.
    pub fn set_warm_start(&mut self, enabled: bool) {
        self.solver_settings.warm_start = enabled;
    }

    /// The active solver kind.
    #[must_use]
    pub fn solver_kind(&self) -> SolverKind {
        self.solver_kind
    }

    /// Select the solver strategy.
    ///
    /// This is a full reconfiguration: the descriptor, the contact
    /// container, and both solver instances are rebuilt from scratch with
    /// the current thread and iteration settings.
    pub fn set_solver_kind(&mut self, kind: SolverKind) {
        self.solver_kind = kind;
        self.descriptor = SystemDescriptor::new();
        self.descriptor.set_threads(self.solver_settings.threads);
        let item_id = ItemId::new(self.next_item_id);
        self.next_item_id += 1;
        let mut container = ContactContainer::new();
        container.attach(self.tag, item_id);
        self.contact_container = container;
        self.solver_speed = make_solver(kind);
        self.solver_stab = make_solver(kind);
        debug!(?kind, "solver strategy rebuilt");
    }

    /// The velocity-level solver, pre-configured with the current speed
    /// settings.
    pub fn solver_speed(&mut self) -> &mut dyn CcpSolver {
        let s = self.solver_settings;
        let solver = self.solver_speed.as_mut();
        solver.set_max_iterations(s.max_iterations_speed);
        solver.set_tolerance(s.tolerance_speeds);
        solver.set_warm_start(s.warm_start);
        solver.set_omega(s.omega);
        solver.set_sharpness_lambda(s.sharpness_lambda);
        solver.set_threads(s.threads);
        solver
    }

    /// The stabilization solver, pre-configured with the current
    /// stabilization settings.
    pub fn solver_stab(&mut self) -> &mut dyn CcpSolver {
        let s = self.solver_settings;
        let solver = self.solver_stab.as_mut();
        solver.set_max_iterations(s.max_iterations_stab);
        solver.set_tolerance(s.tolerance);
        solver.set_warm_start(s.warm_start);
        solver.set_omega(s.omega);
        solver.set_sharpness_lambda(s.sharpness_lambda);
        solver.set_threads(s.threads);
        solver
    }

    /// Replace the descriptor (ownership transfers; old one destroyed).
    pub fn change_descriptor(&mut self, mut descriptor: SystemDescriptor) {
        descriptor.set_threads(self.solver_settings.threads);
        self.descriptor = descriptor;
    }

    /// Replace the velocity-level solver.
    pub fn change_solver_speed(&mut self, solver: Box<dyn CcpSolver>) {
        self.solver_speed = solver;
    }

    /// Replace the stabilization solver.
    pub fn change_solver_stab(&mut self, solver: Box<dyn CcpSolver>) {
        self.solver_stab = solver;
    }

    /// Replace the contact container.
    pub fn change_contact_container(&mut self, mut container: ContactContainer) {
        let item_id = ItemId::new(self.next_item_id);
        self.next_item_id += 1;
        container.attach(self.tag, item_id);
        self.contact_container = container;
    }

    /// Replace the collision engine.
    ///
    /// # Panics
    ///
    /// Panics if any body is attached: registered geometry would be lost.
    pub fn change_collision_engine(&mut self, engine: Box<dyn CollisionEngine>) {
        assert!(
            self.bodies.is_empty(),
            "cannot change the collision engine while bodies are attached"
        );
        self.collision_engine = engine;
    }

    /// The collision engine.
    #[must_use]
    pub fn collision_engine(&self) -> &dyn CollisionEngine {
        self.collision_engine.as_ref()
    }

    /// Set the worker-thread count for parallel solver variants.
    pub fn set_thread_count(&mut self, threads: usize) {
        self.solver_settings.threads = threads.max(1);
        self.descriptor.set_threads(self.solver_settings.threads);
        self.solver_speed.set_threads(self.solver_settings.threads);
        self.solver_stab.set_threads(self.solver_settings.threads);
    }

    /// Register a step hook.
    pub fn add_step_hook(&mut self, hook: Box<dyn StepHook>) {
        self.hooks.push(hook);
    }

    /// Register an output probe.
    pub fn add_probe(&mut self, probe: Box<dyn Probe>) {
        self.probes.push(probe);
    }

    /// Reset all registered probes.
    pub fn reset_all_probes(&mut self) {
        for probe in &mut self.probes {
            probe.reset();
        }
    }

    /// Install a per-contact filter (veto or material override).
    pub fn set_contact_filter(
        &mut self,
        filter: Option<Box<dyn Fn(&ContactReport) -> ContactDecision + Send>>,
    ) {
        self.contact_filter = filter;
    }

    /// Install a hook run after collision detection, free to append
    /// constraints or contacts.
    pub fn set_custom_collision(&mut self, hook: Option<Box<dyn FnMut(&mut System) + Send>>) {
        self.custom_collision = hook;
    }

    /// Mutable access to the contact container, for custom-collision hooks.
    pub fn contact_container_mut(&mut self) -> &mut ContactContainer {
        &mut self.contact_container
    }

    // =====================================================================
    // Setup and update
    // =====================================================================

    /// Recompute all aggregate counts in one pass.
    ///
    /// Call whenever membership or activity state (sleeping, fixed) could
    /// have changed, before any solve. No item data is mutated.
    pub fn setup(&mut self) {
        self.events.setups += 1;
        let mut c = SystemCounters::default();

        for body in &self.bodies {
            if body.is_fixed() {
                c.n_bodies_fixed += 1;
            } else if body.is_sleeping() {
                c.n_bodies_sleeping += 1;
            } else {
                c.n_bodies += 1;
            }
        }
        c.ncoords_w = c.n_bodies * 6;
        c.ncoords = c.n_bodies * 7;
        // One quaternion-norm constraint per active body.
        c.ndoc = c.n_bodies;

        for item in &self.others {
            c.n_others += 1;
            c.ncoords_w += item.dof();
            c.ndoc_w_c += item.doc_c();
            c.ndoc_w_d += item.doc_d();
        }
        for link in &self.links {
            c.n_links += 1;
            c.ndoc_w_c += link.doc_c();
        }
        c.ndoc_w_d += self.contact_container.doc_d();

        c.ndoc_w = c.ndoc_w_c + c.ndoc_w_d;
        c.ndoc += c.ndoc_w;
        c.nsysvars = c.ncoords + c.ndoc;
        c.nsysvars_w = c.ncoords_w + c.ndoc_w;
        c.ndof = c.ncoords as i64 - c.ndoc as i64;
        c.ncontacts = self.contact_container.n_contacts();
        self.counters = c;
    }

    /// Propagate kinematic state through every item: bodies (with the rest
    /// test when sleeping is enabled), other items, then links.
    pub fn update(&mut self) {
        let started = Instant::now();
        self.events.updates += 1;
        self.run_hooks(HookPhase::Update);

        let time = self.time;
        let gravity = self.gravity;
        let use_sleeping = self.step_settings.use_sleeping;
        for body in &mut self.bodies {
            body.update(time, &gravity);
            if use_sleeping {
                body.try_sleeping(time);
            }
        }
        for item in &mut self.others {
            item.update(time);
        }
        self.update_links(time);

        self.timers.update += started.elapsed();
    }

    fn update_links(&mut self, time: f64) {
        let endpoints: Vec<(Option<LinkEndpoint>, Option<LinkEndpoint>)> = self
            .links
            .iter()
            .map(|l| {
                (
                    Self::marker_endpoint(&self.bodies, l.marker_a()),
                    Self::marker_endpoint(&self.bodies, l.marker_b()),
                )
            })
            .collect();
        for (link, (a, b)) in self.links.iter_mut().zip(endpoints) {
            link.update(time, a.as_ref(), b.as_ref());
        }
    }

    fn marker_endpoint(bodies: &[Body], marker: MarkerId) -> Option<LinkEndpoint> {
        bodies.iter().find_map(|b| {
            b.marker(marker).map(|m| LinkEndpoint {
                body: b.id(),
                body_pose: *b.pose(),
                marker_world: m.world_pose(b.pose()),
            })
        })
    }

    // =====================================================================
    // Sleeping
    // =====================================================================

    /// Wake bodies that cannot stay asleep: link endpoints that must wake,
    /// and sleeping bodies contacting awake non-fixed bodies. Runs up to
    /// the configured pass budget, stopping early when a pass wakes nobody.
    pub fn wake_up_sleeping_bodies(&mut self) {
        if !self.step_settings.use_sleeping {
            return;
        }
        for _ in 0..self.step_settings.wake_up_passes {
            let mut woke_someone = false;

            let waking_links: Vec<(BodyId, BodyId)> = self
                .links
                .iter()
                .filter(|l| l.requires_waking() && l.is_valid())
                .filter_map(Link::bodies)
                .collect();
            for (a, b) in waking_links {
                for id in [a, b] {
                    if let Some(body) = self.body_mut(id) {
                        if body.is_sleeping() {
                            body.wake();
                            woke_someone = true;
                        }
                    }
                }
            }

            let mut pairs = Vec::new();
            self.contact_container.for_each_pair(|a, b| pairs.push((a, b)));
            for (a, b) in pairs {
                let (Some(ia), Some(ib)) = (self.body_index(a), self.body_index(b)) else {
                    continue;
                };
                let asleep_a = self.bodies[ia].is_sleeping();
                let asleep_b = self.bodies[ib].is_sleeping();
                if asleep_a && !asleep_b && !self.bodies[ib].is_fixed() {
                    self.bodies[ia].wake();
                    woke_someone = true;
                }
                if asleep_b && !asleep_a && !self.bodies[ia].is_fixed() {
                    self.bodies[ib].wake();
                    woke_someone = true;
                }
            }

            if !woke_someone {
                break;
            }
        }
    }

    // =====================================================================
    // Collision bridge
    // =====================================================================

    /// Synchronize geometry, run the collision engine, and route the
    /// reports into the contact container and every item that accepts
    /// contact or proximity reports. Returns the contact count.
    pub fn compute_collisions(&mut self) -> usize {
        let started = Instant::now();

        for body in &self.bodies {
            if body.collision_model().is_some() {
                self.collision_engine
                    .synchronize(ColliderKey::Body(body.id()), *body.pose());
            }
        }
        for item in &self.others {
            if item.collide() {
                item.sync_collision(self.collision_engine.as_mut());
            }
        }

        self.collision_engine.run();
        let reports: Vec<ContactReport> = self.collision_engine.contacts().to_vec();
        let proximities = self.collision_engine.proximities().to_vec();

        self.contact_container.begin_add_contacts();
        for report in &reports {
            let decision = self
                .contact_filter
                .as_ref()
                .map_or(ContactDecision::Accept, |f| f(report));
            if decision == ContactDecision::Reject {
                continue;
            }
            let material = match decision {
                ContactDecision::Override(m) => m,
                _ => report.material,
            };
            let (ColliderKey::Body(a), ColliderKey::Body(b)) = (report.key_a, report.key_b) else {
                continue;
            };
            let (Some(ia), Some(ib)) = (self.body_index(a), self.body_index(b)) else {
                continue;
            };
            let contact_a = ContactBody {
                id: a,
                position: self.bodies[ia].pose().position,
                twist: *self.bodies[ia].twist(),
            };
            let contact_b = ContactBody {
                id: b,
                position: self.bodies[ib].pose().position,
                twist: *self.bodies[ib].twist(),
            };
            self.contact_container
                .add_contact(report, contact_a, contact_b, material);
        }
        self.contact_container.end_add_contacts();

        // Capability-checked routing: any item that accepts reports gets
        // the full set and filters for itself.
        for item in &mut self.others {
            if let Some(sink) = item.as_contact_sink() {
                sink.begin_contacts();
                for report in &reports {
                    sink.add_contact(report);
                }
                sink.end_contacts();
            }
        }
        for item in &mut self.others {
            if let Some(sink) = item.as_proximity_sink() {
                for report in &proximities {
                    sink.add_proximity(report);
                }
            }
        }

        if let Some(mut hook) = self.custom_collision.take() {
            hook(self);
            self.custom_collision = Some(hook);
        }

        self.counters.ncontacts = self.contact_container.n_contacts();
        self.timers.collision += started.elapsed();
        self.counters.ncontacts
    }

    // =====================================================================
    // Assembly pipeline
    // =====================================================================

    /// Zero every variable block's force accumulator and every constraint
    /// row's bookkeeping accumulators. Idempotent.
    pub(crate) fn prepare_reset(&mut self) {
        for link in &mut self.links {
            link.constraints_bi_reset();
        }
        for body in &mut self.bodies {
            body.variables_fb_reset();
        }
        for item in &mut self.others {
            item.variables_fb_reset();
            item.constraints_bi_reset();
        }
        self.contact_container.constraints_bi_reset();
    }

    /// The generic right-hand-side assembler.
    pub(crate) fn prepare_load(&mut self, terms: LoadTerms) {
        let min_bounce = self.step_settings.min_bounce_speed;

        for link in &mut self.links {
            if terms.c_factor != 0.0 {
                link.constraints_bi_load_c(terms.c_factor, terms.recovery_clamp, terms.do_clamp);
            }
            if terms.ct_factor != 0.0 {
                link.constraints_bi_load_ct(terms.ct_factor);
            }
            if terms.load_jacobians {
                link.constraints_load_jacobians();
            }
        }

        for body in &mut self.bodies {
            if terms.f_factor != 0.0 {
                body.variables_fb_load_forces(terms.f_factor);
            }
            if terms.load_mv {
                body.variables_qb_load_speed();
                body.variables_fb_increment_mq();
            }
        }

        for item in &mut self.others {
            if terms.f_factor != 0.0 {
                item.variables_fb_load_forces(terms.f_factor);
            }
            if terms.load_mv {
                item.variables_qb_load_speed();
                item.variables_fb_increment_mq();
            }
            if terms.c_factor != 0.0 {
                item.constraints_bi_load_c(terms.c_factor, terms.recovery_clamp, terms.do_clamp);
            }
            if terms.ct_factor != 0.0 {
                item.constraints_bi_load_ct(terms.ct_factor);
            }
            if terms.load_jacobians {
                item.constraints_load_jacobians();
            }
            if terms.k_factor != 0.0 || terms.r_factor != 0.0 || terms.m_factor != 0.0 {
                item.load_krm(terms.k_factor, terms.r_factor, terms.m_factor);
            }
        }

        if terms.c_factor != 0.0 {
            self.contact_container.constraints_bi_load_c(
                terms.c_factor,
                terms.recovery_clamp,
                terms.do_clamp,
                min_bounce,
            );
        }
    }

    /// Re-register every active item's blocks with the descriptor, in the
    /// fixed traversal order (links, bodies, other items, contacts), and
    /// assign offsets.
    pub(crate) fn prepare_inject(&mut self) {
        self.descriptor.begin_insertion();
        for link in &mut self.links {
            link.inject_constraints(&mut self.descriptor);
        }
        for body in &mut self.bodies {
            body.inject_variables(&mut self.descriptor);
        }
        for item in &mut self.others {
            item.inject_variables(&mut self.descriptor);
            item.inject_constraints(&mut self.descriptor);
            item.inject_krm(&mut self.descriptor);
        }
        self.contact_container.inject_constraints(&mut self.descriptor);
        self.descriptor.end_insertion();
    }

    /// The assembled descriptor (meaningful between inject and the next
    /// membership change).
    #[must_use]
    pub fn descriptor(&self) -> &SystemDescriptor {
        &self.descriptor
    }

    fn load_multiplier_caches(&mut self, phase: CachePhase) {
        if !self.solver_settings.warm_start {
            return;
        }
        for link in &mut self.links {
            link.load_multiplier_cache(phase);
        }
        for item in &mut self.others {
            item.load_multiplier_cache(phase);
        }
        self.contact_container.load_multiplier_cache(phase);
    }

    fn store_multiplier_caches(&mut self, phase: CachePhase) {
        for link in &mut self.links {
            link.store_multiplier_cache(phase);
        }
        for item in &mut self.others {
            item.store_multiplier_cache(phase);
        }
        self.contact_container.store_multiplier_cache(phase);
    }

    /// Scatter the solved velocities and multipliers back into the items.
    fn fetch_solution(&mut self) {
        for body in &mut self.bodies {
            body.fetch_variables(&self.descriptor);
        }
        for link in &mut self.links {
            link.fetch_multipliers(&self.descriptor);
        }
        for item in &mut self.others {
            item.fetch_solution(&self.descriptor);
        }
        self.contact_container.fetch_multipliers(&self.descriptor);
    }

    /// Convert cached multipliers into reactions
    /// (`reaction = multiplier * factor`).
    fn scatter_reactions(&mut self, factor: f64) {
        for link in &mut self.links {
            link.fetch_reactions(factor);
        }
        for item in &mut self.others {
            item.fetch_reactions(factor);
        }
        self.contact_container.fetch_reactions(factor);
    }

    // =====================================================================
    // Time stepping
    // =====================================================================

    /// Advance exactly one integration step of size `step`.
    ///
    /// Convergence shortfalls are absorbed (the best available solution is
    /// used and [`System::last_error`] may be set); only a non-finite state
    /// or an invalid step size is an error.
    pub fn do_step_dynamics(&mut self, step: f64) -> Result<()> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(MbdError::InvalidTimestep(step));
        }
        self.step_settings.step = step;
        self.integrate_step()
    }

    fn integrate_step(&mut self) -> Result<()> {
        match self.scheme {
            IntegrationScheme::Anitescu => self.step_anitescu(),
            IntegrationScheme::Tasora => self.step_tasora(),
        }
    }

    /// Anitescu scheme: one combined velocity-level solve with the
    /// clamped `C/dt` stabilization term baked in, then first-order
    /// position integration.
    fn step_anitescu(&mut self) -> Result<()> {
        let step_started = Instant::now();
        self.events.timesteps += 1;
        self.step_count += 1;
        self.run_hooks(HookPhase::Begin);

        self.compute_collisions();
        self.setup();
        self.update();
        self.wake_up_sleeping_bodies();

        let h = self.step_settings.step;
        let solve_started = Instant::now();

        // | M+dt^2*K+dt*R  -Cq' | |v_new|   | [M]*v_old + f*dt       |   |0|
        // | Cq               E  | |l    | + | C/dt (clamped) + Ct    | = |c|
        self.prepare_reset();
        self.prepare_load(LoadTerms {
            load_jacobians: true,
            load_mv: true,
            f_factor: h,
            k_factor: h * h,
            r_factor: h,
            m_factor: 1.0,
            ct_factor: 1.0,
            c_factor: 1.0 / h,
            recovery_clamp: self.step_settings.max_penetration_recovery_speed,
            do_clamp: true,
        });
        self.load_multiplier_caches(CachePhase::Speed);
        self.prepare_inject();

        let stats = {
            let descriptor = &mut self.descriptor;
            let s = self.solver_settings;
            let solver = self.solver_speed.as_mut();
            solver.set_max_iterations(s.max_iterations_speed);
            solver.set_tolerance(s.tolerance_speeds);
            solver.set_warm_start(s.warm_start);
            solver.set_omega(s.omega);
            solver.set_sharpness_lambda(s.sharpness_lambda);
            solver.set_threads(s.threads);
            solver.solve(descriptor)
        };
        self.timers.solve += solve_started.elapsed();
        if !stats.converged {
            debug!(
                iterations = stats.iterations,
                residual = stats.residual,
                "speed solve stopped at iteration budget"
            );
        }

        self.fetch_solution();
        self.store_multiplier_caches(CachePhase::Speed);
        self.scatter_reactions(1.0 / h);

        // First-order position update: pos += v_new * dt.
        let time = self.time;
        let gravity = self.gravity;
        for body in &mut self.bodies {
            if body.is_active() {
                body.variables_qb_increment_position(h);
                body.variables_qb_set_speed(h);
            }
            body.update(time, &gravity);
        }
        for item in &mut self.others {
            item.variables_qb_increment_position(h);
            item.variables_qb_set_speed(h);
            item.update(time);
        }

        self.time += h;
        for body in &mut self.bodies {
            body.clear_accumulators();
        }

        self.run_hooks(HookPhase::End);
        self.record_all_probes();
        self.timers.step += step_started.elapsed();
        self.check_divergence()
    }

    /// Tasora scheme: a pure velocity-level solve (zero recovery speed)
    /// and tentative integration, then a separate position-correction
    /// solve whose `Dpos` unknowns are applied directly.
    fn step_tasora(&mut self) -> Result<()> {
        let step_started = Instant::now();
        self.events.timesteps += 1;
        self.step_count += 1;
        self.run_hooks(HookPhase::Begin);

        self.compute_collisions();
        self.setup();
        self.update();
        self.wake_up_sleeping_bodies();

        let h = self.step_settings.step;
        let solve_started = Instant::now();

        // 1) Velocity level, no positional stabilization baked in.
        self.prepare_reset();
        self.prepare_load(LoadTerms {
            load_jacobians: true,
            load_mv: true,
            f_factor: h,
            k_factor: h * h,
            r_factor: h,
            m_factor: 1.0,
            ct_factor: 1.0,
            c_factor: 1.0 / h,
            recovery_clamp: 0.0,
            do_clamp: true,
        });
        self.load_multiplier_caches(CachePhase::Speed);
        self.prepare_inject();
        {
            let descriptor = &mut self.descriptor;
            let s = self.solver_settings;
            let solver = self.solver_speed.as_mut();
            solver.set_max_iterations(s.max_iterations_speed);
            solver.set_tolerance(s.tolerance_speeds);
            solver.set_warm_start(s.warm_start);
            solver.set_omega(s.omega);
            solver.set_sharpness_lambda(s.sharpness_lambda);
            solver.set_threads(s.threads);
            solver.solve(descriptor);
        }
        self.fetch_solution();
        self.store_multiplier_caches(CachePhase::Speed);
        self.scatter_reactions(1.0 / h);

        for body in &mut self.bodies {
            if body.is_active() {
                body.variables_qb_increment_position(h);
                body.variables_qb_set_speed(h);
            }
        }
        for item in &mut self.others {
            item.variables_qb_increment_position(h);
            item.variables_qb_set_speed(h);
        }
        self.time += h;

        // 2) Position stabilization: Dpos unknowns against the raw C term.
        self.prepare_reset();
        self.prepare_load(LoadTerms {
            load_jacobians: false,
            load_mv: false,
            m_factor: 1.0,
            c_factor: 1.0,
            ..Default::default()
        });
        self.load_multiplier_caches(CachePhase::Position);
        self.prepare_inject();
        {
            let descriptor = &mut self.descriptor;
            let s = self.solver_settings;
            let solver = self.solver_stab.as_mut();
            solver.set_max_iterations(s.max_iterations_stab);
            solver.set_tolerance(s.tolerance);
            solver.set_warm_start(s.warm_start);
            solver.set_omega(s.omega);
            solver.set_sharpness_lambda(s.sharpness_lambda);
            solver.set_threads(s.threads);
            solver.solve(descriptor);
        }
        self.fetch_solution();
        self.store_multiplier_caches(CachePhase::Position);

        let time = self.time;
        let gravity = self.gravity;
        for body in &mut self.bodies {
            if body.is_active() {
                body.variables_qb_increment_position(1.0); // pos += Dpos
            }
            body.update(time, &gravity);
        }
        for item in &mut self.others {
            item.variables_qb_increment_position(1.0);
            item.update(time);
        }
        self.timers.solve += solve_started.elapsed();

        for body in &mut self.bodies {
            body.clear_accumulators();
        }

        self.run_hooks(HookPhase::End);
        self.record_all_probes();
        self.timers.step += step_started.elapsed();
        self.check_divergence()
    }

    fn check_divergence(&mut self) -> Result<()> {
        for body in &self.bodies {
            if !body.pose().is_finite() || !body.twist().is_finite() {
                let reason = format!("non-finite state on {}", body.id());
                self.last_error = Some(reason.clone());
                warn!(%reason, "integration diverged");
                return Err(MbdError::diverged(reason));
            }
        }
        Ok(())
    }

    fn run_hooks(&mut self, phase: HookPhase) {
        if self.hooks.is_empty() {
            return;
        }
        let mut hooks = std::mem::take(&mut self.hooks);
        for hook in &mut hooks {
            match phase {
                HookPhase::Begin => hook.on_step_begin(self),
                HookPhase::Update => hook.on_update(self),
                HookPhase::End => hook.on_step_end(self),
            }
        }
        self.hooks = hooks;
    }

    fn record_all_probes(&mut self) {
        if self.probes.is_empty() {
            return;
        }
        let mut probes = std::mem::take(&mut self.probes);
        for probe in &mut probes {
            probe.record(self.time, self);
        }
        self.probes = probes;
    }

    // =====================================================================
    // Multi-step drivers
    // =====================================================================

    /// Step repeatedly until `end_time`, snapping the final step exactly
    /// onto the boundary when the remainder is smaller than 1.3x the step.
    /// The configured step is restored afterwards under the fixed-step
    /// adaption policy.
    ///
    /// Returns `Ok(true)` if the end time was reached, `Ok(false)` if the
    /// loop stopped early on an absorbed failure.
    pub fn do_frame_dynamics(&mut self, end_time: f64) -> Result<bool> {
        self.clear_errors();
        let fixed_step_undo = self.step_settings.step;
        let mut old_step = self.step_settings.step;
        let mut restore_old = false;

        while self.time < end_time {
            restore_old = false;
            let left_time = end_time - self.time;
            if left_time < 1e-13 {
                break;
            }
            if left_time < 1.3 * self.step_settings.step {
                old_step = self.step_settings.step;
                self.step_settings.step = left_time;
                restore_old = true;
            }

            self.integrate_step()?;

            if matches!(self.step_settings.adaption, StepAdaption::Fixed) && !restore_old {
                self.step_settings.step = fixed_step_undo;
            }
            if self.last_error.is_some() {
                break;
            }
        }

        if restore_old {
            self.step_settings.step = old_step;
        }
        match self.step_settings.adaption {
            StepAdaption::Fixed => self.step_settings.step = fixed_step_undo,
            StepAdaption::Bounded { min, max } => {
                self.step_settings.step = self.step_settings.step.clamp(min, max);
            }
        }
        Ok(self.last_error.is_none())
    }

    /// Assemble, then step until the configured end time.
    pub fn do_entire_dynamics(&mut self) -> Result<bool> {
        self.setup();
        self.clear_errors();
        // The initial layout may have large constraint clearances; close
        // them before the first step.
        self.do_assembly(AssemblyAction::full());

        while self.time < self.step_settings.end_time {
            self.integrate_step()?;
            if self.last_error.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whole-simulation driver producing results at evenly spaced frames.
    pub fn do_entire_uniform_dynamics(&mut self, frame_step: f64) -> Result<bool> {
        self.setup();
        self.do_assembly(AssemblyAction::full());

        while self.time < self.step_settings.end_time {
            let goto_time = self.time + frame_step;
            if !self.do_frame_dynamics(goto_time)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One inverse-kinematics step: advance the clock and re-assemble.
    pub fn do_step_kinematics(&mut self, step: f64) -> Result<bool> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(MbdError::InvalidTimestep(step));
        }
        self.clear_errors();
        self.time += step;
        self.update();
        self.do_assembly(AssemblyAction::full());
        Ok(self.last_error.is_none())
    }

    /// Kinematics to `end_time` with the same frame snapping as
    /// [`System::do_frame_dynamics`].
    pub fn do_frame_kinematics(&mut self, end_time: f64) -> Result<bool> {
        self.clear_errors();
        let fixed_step_undo = self.step_settings.step;
        let mut old_step = self.step_settings.step;
        let mut restore_old = false;

        while self.time < end_time {
            restore_old = false;
            let left_time = end_time - self.time;
            if left_time < 1e-9 {
                break;
            }
            if left_time < 1.3 * self.step_settings.step {
                old_step = self.step_settings.step;
                self.step_settings.step = left_time;
                restore_old = true;
            }

            self.do_assembly(AssemblyAction::full());
            if self.last_error.is_some() {
                return Ok(false);
            }
            self.time += self.step_settings.step;

            if restore_old {
                self.step_settings.step = old_step;
            }
        }

        match self.step_settings.adaption {
            StepAdaption::Fixed => self.step_settings.step = fixed_step_undo,
            StepAdaption::Bounded { min, max } => {
                self.step_settings.step = self.step_settings.step.clamp(min, max);
            }
        }
        Ok(true)
    }

    /// Kinematic simulation to the configured end time.
    pub fn do_entire_kinematics(&mut self) -> Result<bool> {
        self.setup();
        self.clear_errors();
        self.do_assembly(AssemblyAction::full());

        while self.time < self.step_settings.end_time {
            self.do_assembly(AssemblyAction::full());
            if self.last_error.is_some() {
                return Ok(false);
            }
            self.time += self.step_settings.step;
        }
        Ok(true)
    }

    // =====================================================================
    // Assembly and statics
    // =====================================================================

    /// Newton-type iteration satisfying the constraint equations, bounded
    /// by the assembly iteration budget. Optional speed/acceleration
    /// refinement uses a tiny synthetic time constant.
    ///
    /// A tolerance shortfall sets the absorbed-failure flag; the best
    /// available configuration is kept.
    pub fn do_assembly(&mut self, action: AssemblyAction) {
        self.setup();
        self.update();

        if action.position {
            let max_iters = self.step_settings.max_iters_assembly;
            let mut satisfied = false;
            for _ in 0..max_iters {
                if action.with_collisions {
                    self.compute_collisions();
                    self.setup();
                    self.update();
                }

                // | M  -Cq' | |Dpos|   |0 |   |0|
                // | Cq   E  | |l   | + |-C| = |c|
                self.prepare_reset();
                self.prepare_load(LoadTerms {
                    load_jacobians: true,
                    m_factor: 1.0,
                    c_factor: 1.0,
                    ..Default::default()
                });
                self.prepare_inject();

                let report = self.descriptor.violation_report();
                if report.residual <= self.solver_settings.tolerance {
                    satisfied = true;
                    break;
                }

                // The position correction reuses the speed solver's budget.
                {
                    let descriptor = &mut self.descriptor;
                    let s = self.solver_settings;
                    let solver = self.solver_speed.as_mut();
                    solver.set_max_iterations(s.max_iterations_speed);
                    solver.set_tolerance(s.tolerance_speeds);
                    solver.set_warm_start(false);
                    solver.set_omega(s.omega);
                    solver.set_sharpness_lambda(s.sharpness_lambda);
                    solver.solve(descriptor);
                }
                self.fetch_solution();

                for body in &mut self.bodies {
                    if body.is_active() {
                        body.variables_qb_increment_position(1.0);
                    }
                }
                for item in &mut self.others {
                    item.variables_qb_increment_position(1.0);
                }
                self.update();
            }
            if !satisfied {
                // Check the final configuration before flagging.
                self.prepare_reset();
                self.prepare_load(LoadTerms {
                    load_jacobians: true,
                    m_factor: 1.0,
                    c_factor: 1.0,
                    ..Default::default()
                });
                self.prepare_inject();
                if self.descriptor.violation_report().residual > self.solver_settings.tolerance {
                    self.last_error = Some("assembly did not reach tolerance".into());
                }
            }
        }

        if action.speed || action.accel {
            let foo_dt = 1e-7;

            self.prepare_reset();
            self.prepare_load(LoadTerms {
                load_jacobians: true,
                load_mv: true,
                f_factor: foo_dt,
                k_factor: foo_dt * foo_dt,
                r_factor: foo_dt,
                m_factor: 1.0,
                ct_factor: 1.0,
                ..Default::default()
            });
            self.prepare_inject();
            {
                let descriptor = &mut self.descriptor;
                let s = self.solver_settings;
                let solver = self.solver_speed.as_mut();
                solver.set_max_iterations(s.max_iterations_speed);
                solver.set_tolerance(s.tolerance_speeds);
                solver.set_warm_start(false);
                solver.set_omega(s.omega);
                solver.set_sharpness_lambda(s.sharpness_lambda);
                solver.solve(descriptor);
            }
            self.fetch_solution();

            let time = self.time;
            let gravity = self.gravity;
            for body in &mut self.bodies {
                if body.is_active() {
                    body.variables_qb_set_speed(foo_dt);
                }
                body.update(time, &gravity);
            }
            for item in &mut self.others {
                item.variables_qb_set_speed(foo_dt);
                item.update(time);
            }
        }
    }

    /// Single-shot linear static solve: stiffness and constraint terms
    /// only, no inertial right-hand side.
    pub fn do_static_linear(&mut self) {
        self.setup();
        self.update();

        // | M+K  -Cq' | |Dpos|   |f|   |0|
        // | Cq     E  | |l   | + |C| = |c|
        self.prepare_reset();
        self.prepare_load(LoadTerms {
            load_jacobians: true,
            f_factor: 1.0,
            k_factor: 1.0,
            c_factor: 1.0,
            ..Default::default()
        });
        self.prepare_inject();
        {
            let descriptor = &mut self.descriptor;
            let s = self.solver_settings;
            let solver = self.solver_speed.as_mut();
            solver.set_max_iterations(s.max_iterations_speed);
            solver.set_tolerance(s.tolerance_speeds);
            solver.set_warm_start(false);
            solver.set_omega(s.omega);
            solver.set_sharpness_lambda(s.sharpness_lambda);
            solver.solve(descriptor);
        }
        self.fetch_solution();
        self.scatter_reactions(1.0);

        let time = self.time;
        let gravity = self.gravity;
        for body in &mut self.bodies {
            if body.is_active() {
                body.variables_qb_increment_position(1.0);
            }
            body.update(time, &gravity);
        }
        for item in &mut self.others {
            item.variables_qb_increment_position(1.0);
            item.update(time);
        }
        self.update();
    }

    /// Relaxation toward static equilibrium: repeatedly zero all
    /// velocities and advance short dynamic bursts over a shrinking time
    /// horizon. A pragmatic heuristic, not a guaranteed-convergent method.
    pub fn do_static_relaxing(&mut self) -> Result<bool> {
        self.clear_errors();

        if self.counters.ncoords > 0 || !self.bodies.is_empty() {
            for m_iter in 0..STATIC_RELAX_STEPS {
                for body in &mut self.bodies {
                    body.set_no_speed_no_accel();
                }
                for item in &mut self.others {
                    item.set_no_speed_no_accel();
                }

                let undo_time = self.time;
                let horizon = (self.step_settings.step * 1.8)
                    * ((STATIC_RELAX_STEPS - m_iter) as f64 / STATIC_RELAX_STEPS as f64);
                self.do_frame_dynamics(undo_time + horizon)?;
                self.time = undo_time;
            }

            for body in &mut self.bodies {
                body.set_no_speed_no_accel();
            }
            for item in &mut self.others {
                item.set_no_speed_no_accel();
            }
        }

        Ok(self.last_error.is_none())
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("time", &self.time)
            .field("bodies", &self.bodies.len())
            .field("links", &self.links.len())
            .field("others", &self.others.len())
            .field("contacts", &self.contact_container.n_contacts())
            .field("solver_kind", &self.solver_kind)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}
