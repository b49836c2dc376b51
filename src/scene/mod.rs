//! # Scene Graph
//!
//! A [`SurfelScene`] owns one [`SurfelTree`] (and through it one
//! [`SurfelDatabase`]) plus the semantic layer on top:
//!
//! | Kind | Structure | Notes |
//! |------|-----------|-------|
//! | Object | part-of tree, root always present | owns tree nodes and a feature vector |
//! | Label | taxonomy tree, root always present | identifier, keystroke, color |
//! | Assignment | object ↔ label edge | confidence + originator |
//! | Relationship | N-ary edge over objects or labels | typed operand vector |
//! | Property | unary annotation on an object or label | typed operand vector |
//! | Scan / Image | camera pose + intrinsics | scans link nodes, images link scans |
//! | Feature | global column of every object's feature vector | |
//!
//! Every kind lives in a dense [`Registry`]; dense positions are the indices
//! written to scene files. Inserts and removals keep all back-references in
//! step within the call.

pub mod annotation;
pub mod camera;
pub mod feature;
pub mod label;
pub mod merge;
pub mod object;

use std::path::{Path, PathBuf};

use glam::DMat4;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::model::{
    AssignmentId, FeatureId, ImageId, LabelId, LabelPropertyId, LabelRelationshipId, NodeId, ObjectId,
    ObjectPropertyId, ObjectRelationshipId, ScanId,
};
use crate::registry::Registry;
use crate::serialize::{self, SceneFormat};
use crate::storage::{AccessMode, BlockPin, SurfelDatabase};
use crate::tree::SurfelTree;
use crate::{Error, Result};

pub use annotation::{Assignment, LabelProperty, LabelRelationship, ObjectProperty, ObjectRelationship, Originator};
pub use camera::{Camera, ChannelGrid, Distortion, ImageChannel, Intrinsics, RollingShutter, SurfelImage, SurfelScan};
pub use feature::{FeatureKind, SurfelFeature};
pub use label::SurfelLabel;
pub use object::SurfelObject;

pub const ROOT_NAME: &str = "Root";

#[derive(Debug, Clone)]
struct SceneFile {
    path: PathBuf,
    access: AccessMode,
}

#[derive(Debug)]
pub struct SurfelScene {
    pub(crate) name: Option<String>,
    pub(crate) tree: SurfelTree,
    pub(crate) objects: Registry<ObjectId, SurfelObject>,
    pub(crate) root_object: ObjectId,
    pub(crate) labels: Registry<LabelId, SurfelLabel>,
    pub(crate) root_label: LabelId,
    pub(crate) assignments: Registry<AssignmentId, Assignment>,
    pub(crate) object_relationships: Registry<ObjectRelationshipId, ObjectRelationship>,
    pub(crate) label_relationships: Registry<LabelRelationshipId, LabelRelationship>,
    pub(crate) object_properties: Registry<ObjectPropertyId, ObjectProperty>,
    pub(crate) label_properties: Registry<LabelPropertyId, LabelProperty>,
    pub(crate) scans: Registry<ScanId, SurfelScan>,
    pub(crate) images: Registry<ImageId, SurfelImage>,
    pub(crate) features: Registry<FeatureId, SurfelFeature>,
    pub(crate) comments: Vec<String>,
    pub(crate) transformation: DMat4,
    pub(crate) dirty: bool,
    file: Option<SceneFile>,
}

impl Default for SurfelScene {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfelScene {
    pub fn new() -> Self {
        Self::with_database(SurfelDatabase::new())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_database(SurfelDatabase::with_config(config))
    }

    /// Build a scene over an existing database.
    pub fn with_database(database: SurfelDatabase) -> Self {
        let mut objects = Registry::new();
        let root_object = objects.insert(SurfelObject::named(ROOT_NAME));
        let mut labels = Registry::new();
        let root_label = labels.insert(SurfelLabel::named(ROOT_NAME));
        Self {
            name: None,
            tree: SurfelTree::new(database),
            objects,
            root_object,
            labels,
            root_label,
            assignments: Registry::new(),
            object_relationships: Registry::new(),
            label_relationships: Registry::new(),
            object_properties: Registry::new(),
            label_properties: Registry::new(),
            scans: Registry::new(),
            images: Registry::new(),
            features: Registry::new(),
            comments: Vec::new(),
            transformation: DMat4::IDENTITY,
            dirty: false,
            file: None,
        }
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
        self.dirty = true;
    }

    pub fn tree(&self) -> &SurfelTree {
        &self.tree
    }

    /// Mutable tree access. Marks the scene dirty.
    pub fn tree_mut(&mut self) -> &mut SurfelTree {
        self.dirty = true;
        &mut self.tree
    }

    pub fn database(&self) -> &SurfelDatabase {
        self.tree.database()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Scene-to-world transformation.
    pub fn transformation(&self) -> DMat4 {
        self.transformation
    }

    /// Replace the transformation without touching any surfel.
    pub fn set_transformation(&mut self, m: DMat4) {
        self.transformation = m;
        self.dirty = true;
    }

    /// Compose `m` onto the scene transformation.
    ///
    /// With `update_surfels` the combined transformation is baked into every
    /// node, scan and image and the stored transformation is reset to
    /// identity.
    pub fn transform(&mut self, m: &DMat4, update_surfels: bool) -> Result<()> {
        let total = *m * self.transformation;
        if update_surfels {
            for node in self.tree.node_ids() {
                self.tree.transform_node(node, &total)?;
            }
            for (_, scan) in self.scans.iter_mut() {
                scan.camera = scan.camera.transformed(&total);
            }
            for (_, image) in self.images.iter_mut() {
                image.transform(&total);
            }
            self.transformation = DMat4::IDENTITY;
        } else {
            self.transformation = total;
        }
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------------

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Add a comment unless an identical one is already present.
    pub fn insert_comment(&mut self, comment: impl Into<String>) {
        let comment = comment.into();
        if self.comments.contains(&comment) {
            return;
        }
        self.comments.push(comment);
        self.dirty = true;
    }

    pub fn remove_comment(&mut self, comment: &str) -> bool {
        let Some(pos) = self.comments.iter().position(|c| c == comment) else {
            return false;
        };
        self.comments.remove(pos);
        self.dirty = true;
        true
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    /// Remove a tree node after detaching it from its object and scan.
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        let info = self.tree.node(node)?;
        if let Some(object) = info.object() {
            self.remove_object_node(object, node)?;
        }
        if let Some(scan) = self.tree.node(node)?.scan() {
            self.set_scan_node(scan, None)?;
        }
        self.tree.remove_node(node)?;
        self.dirty = true;
        Ok(())
    }

    /// Pin every block in the tree.
    pub fn pin_blocks(&self) -> Result<Vec<BlockPin>> {
        self.tree.pin_blocks(self.tree.root(), true)
    }

    /// Delete every surfel failing `constraint`. Nodes left empty are
    /// detached from their objects and removed. Returns the number of
    /// surfels deleted.
    pub fn cull_surfels(&mut self, constraint: &dyn crate::constraint::SurfelConstraint) -> Result<i64> {
        let discarded = self.tree.cull(constraint)?;
        let owned: Vec<(ObjectId, NodeId)> = self
            .objects
            .iter()
            .flat_map(|(id, o)| o.nodes.iter().map(move |&n| (id, n)))
            .collect();
        for (object, node) in owned {
            let n = self.tree.node(node)?;
            if n.blocks().is_empty() && n.parts().is_empty() {
                self.remove_object_node(object, node)?;
            }
        }
        self.tree.remove_empty_nodes()?;
        self.dirty = true;
        Ok(discarded)
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// Open a scene file and, optionally, its block database.
    ///
    /// [`AccessMode::Create`] starts a new scene file (written on sync); the
    /// other modes read it immediately. The database, when given, is opened
    /// first with the same access mode.
    pub fn open_file(
        &mut self,
        scene_path: impl AsRef<Path>,
        database_path: Option<impl AsRef<Path>>,
        access: AccessMode,
    ) -> Result<()> {
        let scene_path = scene_path.as_ref();
        if let Some(open) = &self.file {
            return Err(Error::ConstraintViolation(format!(
                "scene already open on {}",
                open.path.display()
            )));
        }
        SceneFormat::from_path(scene_path)?;
        if let Some(db_path) = database_path {
            self.database().open_file(db_path, access)?;
        }
        if access != AccessMode::Create {
            self.read_file(scene_path)?;
            self.dirty = false;
        } else {
            self.dirty = true;
        }
        self.file = Some(SceneFile { path: scene_path.to_path_buf(), access });
        info!(path = %scene_path.display(), ?access, "opened surfel scene");
        Ok(())
    }

    /// Flush the database and, if the scene changed, rewrite the scene file.
    pub fn sync_file(&mut self) -> Result<()> {
        self.database().sync_file()?;
        let Some(file) = self.file.clone() else {
            return Ok(());
        };
        if self.dirty && file.access.is_writable() {
            self.write_file(&file.path)?;
            debug!(path = %file.path.display(), "synced surfel scene");
        }
        Ok(())
    }

    /// Sync the scene to a different file, leaving the open file alone.
    pub fn sync_file_as(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.database().sync_file()?;
        self.write_file(path)
    }

    /// Purge pending deletes, sync, then close both files.
    pub fn close_file(&mut self) -> Result<()> {
        if self.database().purge_deleted_blocks()? > 0 {
            self.dirty = true;
        }
        self.sync_file()?;
        self.database().close_file()?;
        if let Some(file) = self.file.take() {
            info!(path = %file.path.display(), "closed surfel scene");
        }
        Ok(())
    }

    /// Read a scene file, dispatching on its extension. The contents are
    /// added to this scene.
    pub fn read_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        serialize::read_scene_file(self, path.as_ref())
    }

    /// Write the scene, dispatching on extension (`.ssa`, `.ssx`, `.arff`,
    /// `.tqn`).
    pub fn write_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        serialize::write_scene_file(self, path.as_ref())?;
        if SceneFormat::from_path(path.as_ref())?.is_scene() {
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_scene_has_roots() {
        let scene = SurfelScene::new();
        assert_eq!(scene.object_count(), 1);
        assert_eq!(scene.label_count(), 1);
        assert_eq!(scene.object(scene.root_object()).unwrap().name(), Some(ROOT_NAME));
        assert_eq!(scene.label(scene.root_label()).unwrap().name(), Some(ROOT_NAME));
        assert!(!scene.is_dirty());
    }

    #[test]
    fn test_comments_are_deduplicated() {
        let mut scene = SurfelScene::new();
        scene.insert_comment("source: lidar");
        scene.insert_comment("source: lidar");
        assert_eq!(scene.comments().len(), 1);
        assert!(scene.remove_comment("source: lidar"));
        assert!(!scene.remove_comment("source: lidar"));
    }

    #[test]
    fn test_transform_without_surfels_composes() {
        let mut scene = SurfelScene::new();
        let a = DMat4::from_translation(glam::DVec3::X);
        let b = DMat4::from_scale(glam::DVec3::splat(2.0));
        scene.transform(&a, false).unwrap();
        scene.transform(&b, false).unwrap();
        assert_eq!(scene.transformation(), b * a);
        scene.set_transformation(DMat4::IDENTITY);
        assert_eq!(scene.transformation(), DMat4::IDENTITY);
    }
}
