//! Deep copy of one scene into another.

use hashbrown::HashMap;
use tracing::info;

use crate::model::{LabelId, NodeId, ObjectId, ScanId};
use crate::storage::{BlockFlags, SurfelBlock};
use crate::tree::SurfelNode;
use crate::Result;

use super::{
    Assignment, LabelProperty, LabelRelationship, ObjectProperty, ObjectRelationship, SurfelLabel, SurfelObject,
    SurfelScene,
};

impl SurfelScene {
    /// Copy every entity of `other` into this scene.
    ///
    /// `other`'s root node, object and label are replaced by `parent_node`,
    /// `parent_object` and `parent_label`; anything that hung below them (or
    /// had no parent) hangs below the given parents here. Block records are
    /// copied into new blocks of this scene's database. Features are matched
    /// by name, and features missing here are appended.
    ///
    /// `other`'s records are read before this scene changes, so an
    /// unreadable source block or a read-only database here leaves this
    /// scene as it was.
    pub fn insert_scene(
        &mut self,
        other: &SurfelScene,
        parent_object: ObjectId,
        parent_label: LabelId,
        parent_node: NodeId,
    ) -> Result<()> {
        self.objects.try_get(parent_object)?;
        self.labels.try_get(parent_label)?;
        self.tree.node(parent_node)?;

        let mut staged: Vec<(NodeId, SurfelBlock)> = Vec::new();
        for (id, node) in other.tree.nodes() {
            for &block in node.blocks() {
                let pin = other.database().pin_block(block)?;
                let info = pin.info()?;
                let surfels = pin.to_vec()?;
                pin.release()?;
                let copy = SurfelBlock::new(info.origin, surfels)
                    .with_timestamp_origin(info.timestamp_origin)
                    .with_multiresolution(info.flags.contains(BlockFlags::MULTIRESOLUTION));
                staged.push((id, copy));
            }
        }
        if !staged.is_empty() {
            self.database().check_writable()?;
        }

        for comment in other.comments() {
            self.insert_comment(comment.clone());
        }

        // Features first so copied vectors land in the right slots.
        let mut feature_slots = Vec::with_capacity(other.features.len());
        for (_, feature) in other.features.iter() {
            let id = match feature.name().and_then(|name| self.find_feature_by_name(name)) {
                Some(id) => id,
                None => self.insert_feature(feature.clone()),
            };
            feature_slots.push(id);
        }

        // Nodes, then the staged blocks.
        let mut nodes: HashMap<NodeId, NodeId> = HashMap::new();
        nodes.insert(other.tree.root(), parent_node);
        for (id, node) in other.tree.nodes() {
            if id == other.tree.root() {
                continue;
            }
            let mut copy = SurfelNode::new();
            if let Some(name) = node.name() {
                copy = SurfelNode::named(name);
            }
            nodes.insert(id, self.tree.insert_detached(copy));
        }
        for (id, node) in other.tree.nodes() {
            let target = nodes[&id];
            if id != other.tree.root() {
                let parent = node.parent().and_then(|p| nodes.get(&p).copied()).unwrap_or(parent_node);
                self.tree.set_parent(target, parent)?;
            }
        }
        for (source, block) in staged {
            let pin = self.database().insert_block(block)?;
            self.tree.insert_block(nodes[&source], pin.id())?;
            pin.release()?;
        }

        // Objects.
        let mut objects: HashMap<ObjectId, ObjectId> = HashMap::new();
        objects.insert(other.root_object, parent_object);
        for (id, object) in other.objects.iter() {
            if id == other.root_object {
                continue;
            }
            let mut copy = SurfelObject::new().with_identifier(object.identifier()).with_flags(object.flags());
            copy.set_name(object.name().map(str::to_owned));
            let mut vector = vec![0.0; self.features.len()];
            for (slot, &feature) in feature_slots.iter().enumerate() {
                if let (Some(index), Some(&value)) = (self.features.index_of(feature), object.feature_vector.get(slot)) {
                    vector[index] = value;
                }
            }
            copy.feature_vector = vector;
            objects.insert(id, self.insert_object_detached(copy));
        }
        for (id, object) in other.objects.iter() {
            let target = objects[&id];
            if id != other.root_object {
                let parent = object.parent.and_then(|p| objects.get(&p).copied()).unwrap_or(parent_object);
                self.set_object_parent(target, parent)?;
            }
            for node in &object.nodes {
                if let Some(&n) = nodes.get(node)
                    && self.tree.node(n)?.object().is_none()
                {
                    self.insert_object_node(target, n)?;
                }
            }
        }

        // Labels.
        let mut labels: HashMap<LabelId, LabelId> = HashMap::new();
        labels.insert(other.root_label, parent_label);
        for (id, label) in other.labels.iter() {
            if id == other.root_label {
                continue;
            }
            let copy: SurfelLabel = label.clone();
            labels.insert(id, self.insert_label_detached(copy));
        }
        for (id, label) in other.labels.iter() {
            if id == other.root_label {
                continue;
            }
            let parent = label.parent.and_then(|p| labels.get(&p).copied()).unwrap_or(parent_label);
            self.set_label_parent(labels[&id], parent)?;
        }

        // Annotations.
        for (_, p) in other.object_properties.iter() {
            if let Some(&object) = objects.get(&p.object) {
                self.insert_object_property(ObjectProperty::new(p.kind, object, p.operands.iter().copied()))?;
            }
        }
        for (_, p) in other.label_properties.iter() {
            if let Some(&label) = labels.get(&p.label) {
                self.insert_label_property(LabelProperty::new(p.kind, label, p.operands.iter().copied()))?;
            }
        }
        for (_, r) in other.object_relationships.iter() {
            let members: Option<Vec<ObjectId>> = r.objects.iter().map(|o| objects.get(o).copied()).collect();
            if let Some(members) = members {
                self.insert_object_relationship(ObjectRelationship::new(r.kind, members, r.operands.iter().copied()))?;
            }
        }
        for (_, r) in other.label_relationships.iter() {
            let members: Option<Vec<LabelId>> = r.labels.iter().map(|l| labels.get(l).copied()).collect();
            if let Some(members) = members {
                self.insert_label_relationship(LabelRelationship::new(r.kind, members, r.operands.iter().copied()))?;
            }
        }
        for (_, a) in other.assignments.iter() {
            if let (Some(&object), Some(&label)) = (objects.get(&a.object), labels.get(&a.label)) {
                self.insert_assignment(Assignment::new(object, label, a.confidence, a.originator))?;
            }
        }

        // Scans and images.
        let mut scans: HashMap<ScanId, ScanId> = HashMap::new();
        for (id, scan) in other.scans.iter() {
            let copy = self.insert_scan(scan.clone());
            if let Some(node) = scan.node.and_then(|n| nodes.get(&n).copied())
                && self.tree.node(node)?.scan().is_none()
            {
                self.set_scan_node(copy, Some(node))?;
            }
            scans.insert(id, copy);
        }
        for (_, image) in other.images.iter() {
            let copy = self.insert_image(image.clone());
            if let Some(scan) = image.scan.and_then(|s| scans.get(&s).copied()) {
                self.set_image_scan(copy, Some(scan))?;
            }
        }

        self.dirty = true;
        info!(
            nodes = nodes.len() - 1,
            objects = objects.len() - 1,
            labels = labels.len() - 1,
            "inserted scene"
        );
        Ok(())
    }
}
