//! Markers: named auxiliary frames on bodies.
//!
//! Links never hold references to bodies directly; they name the marker
//! frames they act between, and the system resolves marker ids to bodies by
//! lookup. That makes marker ids the unit of weak reference: they survive
//! snapshot round-trips and body removal without dangling.

use mbd_types::{MarkerId, Pose};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A named coordinate frame fixed to a body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Marker {
    id: MarkerId,
    name: Option<String>,
    /// Frame relative to the owning body.
    rel_pose: Pose,
}

impl Marker {
    /// Create a marker with the given id at the given body-relative frame.
    ///
    /// Marker ids are caller-assigned and must be unique within a system
    /// for link resolution to be well-defined.
    #[must_use]
    pub fn new(id: MarkerId, rel_pose: Pose) -> Self {
        Self {
            id,
            name: None,
            rel_pose,
        }
    }

    /// Set the marker name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The marker id.
    #[must_use]
    pub fn id(&self) -> MarkerId {
        self.id
    }

    /// The marker name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Frame relative to the owning body.
    #[must_use]
    pub fn rel_pose(&self) -> &Pose {
        &self.rel_pose
    }

    /// World-frame pose of this marker given the owning body's pose.
    #[must_use]
    pub fn world_pose(&self, body_pose: &Pose) -> Pose {
        body_pose.compose(&self.rel_pose)
    }
}
