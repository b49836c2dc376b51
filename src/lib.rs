//! # surfels-rs: Out-of-core Surfel Store
//!
//! A paged block database for surfel point clouds, a node hierarchy that
//! indexes it, and a semantic scene graph (objects, labels, scans, images)
//! layered on top.
//!
//! ## Design Principles
//!
//! 1. **Pins own residency**: a [`BlockPin`] keeps a block's records in
//!    memory; dropping the last one flushes and frees them
//! 2. **Handles, not pointers**: every entity lives in a dense [`Registry`]
//!    and is referenced by a generational handle
//! 3. **Codecs are data**: each on-disk layout is one [`SurfelCodec`]
//! 4. **Scene owns the graph**: a [`SurfelScene`] owns one tree and one
//!    database and keeps every back-reference consistent
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use surfels_rs::{SurfelScene, SurfelBlock, SurfelNode, Surfel, AccessMode};
//! use glam::{DVec3, Vec3};
//!
//! # fn example() -> surfels_rs::Result<()> {
//! let mut scene = SurfelScene::new();
//! scene.open_file("site.ssx", Some("site.ssb"), AccessMode::Create)?;
//!
//! let block = SurfelBlock::new(DVec3::ZERO, vec![Surfel::new(Vec3::new(1.0, 2.0, 3.0))]);
//! let pin = scene.database().insert_block(block)?;
//! let root = scene.tree().root();
//! let node = scene.tree_mut().insert_node(SurfelNode::named("scan0"), root)?;
//! scene.tree_mut().insert_block(node, pin.id())?;
//! pin.release()?;
//!
//! scene.close_file()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## File Formats
//!
//! | Extension | Content | Direction |
//! |-----------|---------|-----------|
//! | `.ssb` | Block database (header, directory, records) | read/write |
//! | `.ssx` | Binary scene graph | read/write |
//! | `.ssa` | ASCII scene graph | read/write |
//! | `.arff` | Object feature table | export |
//! | `.tqn` | Object hierarchy | export |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod registry;
pub mod config;
pub mod storage;
pub mod constraint;
pub mod pointset;
pub mod tree;
pub mod scene;
pub mod serialize;
pub mod export;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    BBox, Interval, Rgb, Surfel, SurfelFlags,
    Handle, BlockId, NodeId, ObjectId, LabelId, AssignmentId,
    ObjectRelationshipId, LabelRelationshipId, ObjectPropertyId, LabelPropertyId,
    ScanId, ImageId, FeatureId,
};
pub use registry::Registry;
pub use config::StoreConfig;

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{
    AccessMode, BlockFlags, BlockInfo, BlockPin, BlockSplit, DatabaseStats,
    FormatVersion, SurfelBlock, SurfelCodec, SurfelDatabase,
};

// ============================================================================
// Re-exports: Tree + Scene
// ============================================================================

pub use constraint::SurfelConstraint;
pub use pointset::{SurfelPoint, SurfelPointSet};
pub use tree::{NodeSplit, NodeSummary, PointQuery, SurfelNode, SurfelTree};
pub use scene::{
    SurfelScene, SurfelObject, SurfelLabel, Assignment, Originator,
    ObjectRelationship, LabelRelationship, ObjectProperty, LabelProperty,
    SurfelScan, SurfelImage, SurfelFeature, FeatureKind, Camera, Intrinsics,
    Distortion, RollingShutter, ImageChannel, ChannelGrid,
};
pub use serialize::SceneFormat;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Format error: {0}")]
    Format(String),

    #[error("Unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
