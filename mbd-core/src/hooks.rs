//! Step hooks, probes, timers, and event counters.

use std::time::Duration;

/// User code invoked at fixed points of the stepping state machine.
///
/// Hooks receive the system mutably; they may apply forces, toggle flags,
/// or record state. Registering or removing hooks from inside a hook is
/// not supported.
#[allow(unused_variables)]
pub trait StepHook: Send {
    /// Invoked at the start of every integration step.
    fn on_step_begin(&mut self, system: &mut crate::System) {}

    /// Invoked during every system update pass.
    fn on_update(&mut self, system: &mut crate::System) {}

    /// Invoked after the step's state is final (end-of-step processing).
    fn on_step_end(&mut self, system: &mut crate::System) {}
}

/// An output recorder sampled after every step.
pub trait Probe: Send {
    /// Record whatever the probe tracks at the given simulation time.
    fn record(&mut self, time: f64, system: &crate::System);

    /// Discard recorded data.
    fn reset(&mut self);
}

/// Wall-clock cost of the pipeline phases, accumulated until
/// [`crate::System::reset_timers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepTimers {
    /// Whole integration steps.
    pub step: Duration,
    /// Solver invocations (speed and stabilization).
    pub solve: Duration,
    /// Collision synchronization, detection, and routing.
    pub collision: Duration,
    /// Kinematic update passes.
    pub update: Duration,
}

/// Tallies of pipeline events since construction or the last reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventCounters {
    /// `setup` passes (counting and indexing).
    pub setups: u64,
    /// `update` passes.
    pub updates: u64,
    /// Integration steps.
    pub timesteps: u64,
}
