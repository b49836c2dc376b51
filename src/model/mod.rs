//! # Surfel Model
//!
//! Plain value types shared by every layer: handles, geometry and the surfel
//! record itself. Pure data: no I/O, no paging state.

pub mod id;
pub mod geometry;
pub mod surfel;

pub use id::{
    Handle, BlockId, NodeId, ObjectId, LabelId, AssignmentId,
    ObjectRelationshipId, LabelRelationshipId, ObjectPropertyId, LabelPropertyId,
    ScanId, ImageId, FeatureId,
};
pub use geometry::{BBox, Interval, Rgb};
pub use surfel::{Surfel, SurfelFlags};
