//! Handle types for items attached to a system.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $display:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new id from a raw value.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the raw id value.
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($display, "({})"), self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a rigid body within a system.
    BodyId,
    "Body"
);

id_type!(
    /// Unique identifier for a link (two-body constraint) within a system.
    LinkId,
    "Link"
);

id_type!(
    /// Unique identifier for any physics item within a system.
    ///
    /// Every attached item (body, link, or other) receives an `ItemId` from
    /// the owning system. Variable and constraint blocks are keyed by it.
    #[derive(Default)]
    ItemId,
    "Item"
);

id_type!(
    /// Unique identifier for a marker (auxiliary frame on a body).
    ///
    /// Marker ids are the weak-reference currency: links store marker ids and
    /// resolve them by lookup, never by aliasing pointers.
    MarkerId,
    "Marker"
);

/// Opaque token identifying one live system instance.
///
/// An attached item stores the tag of its owning system; a detached item
/// stores none. The tag is what makes "already owned by another system" a
/// checkable precondition instead of an aliasing accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemTag(u64);

static NEXT_SYSTEM_TAG: AtomicU64 = AtomicU64::new(1);

impl SystemTag {
    /// Allocate a fresh, process-unique tag.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SYSTEM_TAG.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = BodyId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "Body(42)");

        let id2: BodyId = 42.into();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_marker_id_display() {
        assert_eq!(MarkerId::new(7).to_string(), "Marker(7)");
    }

    #[test]
    fn test_system_tags_unique() {
        let a = SystemTag::next();
        let b = SystemTag::next();
        assert_ne!(a, b);
    }
}
