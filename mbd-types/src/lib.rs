//! Core types for the `mbd` multibody dynamics kernel.
//!
//! This crate provides the foundational types shared by the solver and the
//! system coordinator:
//!
//! - [`Pose`], [`Twist`], [`MassProperties`] - rigid body kinematic state
//! - [`BodyId`], [`LinkId`], [`ItemId`], [`MarkerId`] - handles into a system
//! - [`SolverSettings`], [`StepSettings`] - solver and stepping configuration
//! - [`SolverKind`], [`IntegrationScheme`] - strategy selection enums
//! - [`MbdError`] - the error taxonomy
//!
//! # Design Philosophy
//!
//! These types are **pure data**. They carry no physics, no solving, no
//! integration. They are the common language between the constraint solver
//! crate (`mbd-solver`), the system coordinator (`mbd-core`), and anything
//! downstream that records or replays simulation state.
//!
//! # Coordinate System
//!
//! - X: right
//! - Y: forward
//! - Z: up
//! - Right-handed; gravity defaults to -Z.

#![doc(html_root_url = "https://docs.rs/mbd-types/0.3.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,  // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,      // mul_add style changes aren't always clearer
    clippy::cast_precision_loss,   // usize to f64 is fine for counts
    clippy::missing_errors_doc,    // Error docs added where non-obvious
)]

mod config;
mod error;
mod ids;
mod state;

pub use config::{IntegrationScheme, SolverKind, SolverSettings, StepAdaption, StepSettings};
pub use error::MbdError;
pub use ids::{BodyId, ItemId, LinkId, MarkerId, SystemTag};
pub use state::{MassProperties, Pose, Twist};

// Re-export math types for convenience
pub use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, MbdError>;
