//! Block-structured complementarity system and solver strategies.
//!
//! This crate owns the numerical half of the kernel:
//!
//! - [`VariableBlock`] - one item's slice of unknowns with its mass operator
//! - [`ConstraintBlock`] - one scalar constraint row (bilateral, unilateral,
//!   or friction) coupling up to two variable blocks
//! - [`SystemDescriptor`] - the per-step global index of all blocks, with
//!   contiguous offset assignment and bulk operations
//! - [`CcpSolver`] - the strategy trait, implemented by a closed family of
//!   interchangeable solvers
//!
//! # Problem Shape
//!
//! Every solve is the mixed cone complementarity problem
//!
//! ```text
//! | H  -Jᵀ | | q |   | fb |   | 0 |
//! | J   E  | | l | + | b  | = | c | ,   l in K,  c in K*,  l·c = 0
//! ```
//!
//! where `H` is block-diagonal mass (plus optional dense tangent-stiffness
//! blocks), `J` stacks the constraint jacobian rows, `E` is the per-row
//! constraint-force-mixing diagonal, and `K` is a product of free lines
//! (bilateral rows), half-lines (unilateral rows), and friction boxes.
//!
//! The solution is written in place: each variable block's `qb` slot receives
//! the new velocities (or position corrections), each row's `multiplier` slot
//! receives its impulse. What the unknowns *mean* is decided by whoever
//! loaded the right-hand side; this crate never interprets them.

#![doc(html_root_url = "https://docs.rs/mbd-solver/0.3.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
)]

mod constraints;
mod descriptor;
mod direct;
mod gradient;
mod jacobi;
#[cfg(feature = "parallel")]
mod parallel;
mod solver;
mod sor;
mod variables;

pub use constraints::{ConstraintBlock, ConstraintMode};
pub use descriptor::{KrmBlock, SystemDescriptor, ViolationReport};
pub use direct::ActiveSetDirect;
pub use gradient::ProjectedApgd;
pub use jacobi::ProjectedJacobi;
#[cfg(feature = "parallel")]
pub use parallel::ProjectedSorMultithread;
pub use solver::{CcpSolver, SolveStats};
pub use sor::{ProjectedSor, ProjectedSymmSor};
pub use variables::{MassOperator, VariableBlock, VariableKey};

use mbd_types::SolverKind;

/// Construct a fresh, unconfigured solver instance of the given kind.
///
/// This is the factory behind the system coordinator's solver dispatch: a
/// kind change constructs new instances through here and destroys the old
/// ones, never reconfigures in place.
#[must_use]
pub fn make_solver(kind: SolverKind) -> Box<dyn CcpSolver> {
    match kind {
        SolverKind::ProjectedSor => Box::new(ProjectedSor::default()),
        SolverKind::ProjectedSymmSor => Box::new(ProjectedSymmSor::default()),
        SolverKind::ProjectedJacobi => Box::new(ProjectedJacobi::default()),
        SolverKind::ProjectedApgd => Box::new(ProjectedApgd::default()),
        SolverKind::ActiveSetDirect => Box::new(ActiveSetDirect::default()),
        #[cfg(feature = "parallel")]
        SolverKind::ProjectedSorMultithread => Box::new(ProjectedSorMultithread::default()),
        #[cfg(not(feature = "parallel"))]
        SolverKind::ProjectedSorMultithread => Box::new(ProjectedSor::default()),
    }
}
