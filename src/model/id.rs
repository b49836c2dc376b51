//! Generational handles for every entity kind.
//!
//! A handle names a slot in a [`Registry`](crate::registry::Registry) plus the
//! generation that slot had when the entity was inserted. Once the entity is
//! removed the slot's generation moves on, so a stale handle simply stops
//! resolving instead of aliasing whatever reuses the slot.

use serde::{Deserialize, Serialize};

/// Common surface of the typed handles produced by [`define_handle!`].
pub trait Handle: Copy + Eq + std::hash::Hash + std::fmt::Debug + std::fmt::Display {
    fn from_parts(slot: u32, generation: u32) -> Self;
    fn slot(self) -> u32;
    fn generation(self) -> u32;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            slot: u32,
            generation: u32,
        }

        impl Handle for $name {
            #[inline]
            fn from_parts(slot: u32, generation: u32) -> Self {
                Self { slot, generation }
            }

            #[inline]
            fn slot(self) -> u32 {
                self.slot
            }

            #[inline]
            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($tag, "{}v{}"), self.slot, self.generation)
            }
        }
    };
}

define_handle!(
    /// A block owned by a [`SurfelDatabase`](crate::storage::SurfelDatabase).
    BlockId, "block#"
);
define_handle!(
    /// A node of a [`SurfelTree`](crate::tree::SurfelTree).
    NodeId, "node#"
);
define_handle!(ObjectId, "object#");
define_handle!(LabelId, "label#");
define_handle!(AssignmentId, "assignment#");
define_handle!(ObjectRelationshipId, "object-rel#");
define_handle!(LabelRelationshipId, "label-rel#");
define_handle!(ObjectPropertyId, "object-prop#");
define_handle!(LabelPropertyId, "label-prop#");
define_handle!(ScanId, "scan#");
define_handle!(ImageId, "image#");
define_handle!(FeatureId, "feature#");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        let id = BlockId::from_parts(3, 1);
        assert_eq!(id.to_string(), "block#3v1");
        assert_eq!(id.slot(), 3);
        assert_eq!(id.generation(), 1);
    }

    #[test]
    fn test_handles_compare_by_generation() {
        assert_ne!(ObjectId::from_parts(0, 0), ObjectId::from_parts(0, 1));
    }
}
