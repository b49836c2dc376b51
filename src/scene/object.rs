//! Objects: the part-of tree over tree nodes.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{AssignmentId, BBox, FeatureId, LabelId, NodeId, ObjectId, ObjectPropertyId, ObjectRelationshipId};
use crate::pointset::SurfelPointSet;
use crate::tree::PointQuery;
use crate::{Error, Result};

use super::{Originator, SurfelScene};

/// One instance in the scene.
///
/// Link fields (parent, parts, nodes, assignments, relationships,
/// properties) are maintained by [`SurfelScene`]; only the descriptive
/// fields can be edited through [`SurfelScene::object_mut`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfelObject {
    name: Option<String>,
    identifier: i32,
    flags: u32,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) parts: Vec<ObjectId>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) feature_vector: Vec<f64>,
    pub(crate) assignments: Vec<AssignmentId>,
    pub(crate) relationships: Vec<ObjectRelationshipId>,
    pub(crate) properties: Vec<ObjectPropertyId>,
}

impl Default for SurfelObject {
    fn default() -> Self {
        Self {
            name: None,
            identifier: -1,
            flags: 0,
            parent: None,
            parts: Vec::new(),
            nodes: Vec::new(),
            feature_vector: Vec::new(),
            assignments: Vec::new(),
            relationships: Vec::new(),
            properties: Vec::new(),
        }
    }
}

impl SurfelObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn with_identifier(mut self, identifier: i32) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// User identifier, `-1` when unset.
    pub fn identifier(&self) -> i32 {
        self.identifier
    }

    pub fn set_identifier(&mut self, identifier: i32) {
        self.identifier = identifier;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn parts(&self) -> &[ObjectId] {
        &self.parts
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn feature_vector(&self) -> &[f64] {
        &self.feature_vector
    }

    pub fn assignments(&self) -> &[AssignmentId] {
        &self.assignments
    }

    pub fn relationships(&self) -> &[ObjectRelationshipId] {
        &self.relationships
    }

    pub fn properties(&self) -> &[ObjectPropertyId] {
        &self.properties
    }

    /// Reset every link, keeping the descriptive fields.
    pub(crate) fn unlinked(mut self) -> Self {
        self.parent = None;
        self.parts.clear();
        self.nodes.clear();
        self.assignments.clear();
        self.relationships.clear();
        self.properties.clear();
        self
    }
}

impl SurfelScene {
    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    pub fn root_object(&self) -> ObjectId {
        self.root_object
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn object(&self, id: ObjectId) -> Result<&SurfelObject> {
        self.objects.try_get(id)
    }

    /// Descriptive access to an object. Marks the scene dirty.
    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut SurfelObject> {
        self.dirty = true;
        self.objects.try_get_mut(id)
    }

    pub fn object_at(&self, index: usize) -> Option<ObjectId> {
        self.objects.handle_at(index)
    }

    /// Dense position of an object, the index written to scene files.
    pub fn object_index(&self, id: ObjectId) -> Option<usize> {
        self.objects.index_of(id)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.handles()
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &SurfelObject)> + '_ {
        self.objects.iter()
    }

    pub fn find_object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.objects.iter().find(|(_, o)| o.name() == Some(name)).map(|(id, _)| id)
    }

    /// Negative identifiers never match.
    pub fn find_object_by_identifier(&self, identifier: i32) -> Option<ObjectId> {
        if identifier < 0 {
            return None;
        }
        self.objects.iter().find(|(_, o)| o.identifier == identifier).map(|(id, _)| id)
    }

    // ------------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------------

    pub fn insert_object(&mut self, object: SurfelObject, parent: ObjectId) -> Result<ObjectId> {
        self.objects.try_get(parent)?;
        let id = self.insert_object_detached(object);
        self.attach_object(id, parent);
        debug!(object = %id, %parent, "inserted object");
        Ok(id)
    }

    /// Insert an object with no links. Its feature vector is padded to the
    /// scene's feature count.
    pub(crate) fn insert_object_detached(&mut self, object: SurfelObject) -> ObjectId {
        let mut object = object.unlinked();
        if object.feature_vector.len() < self.features.len() {
            object.feature_vector.resize(self.features.len(), 0.0);
        }
        self.dirty = true;
        self.objects.insert(object)
    }

    fn attach_object(&mut self, id: ObjectId, parent: ObjectId) {
        if let Some(object) = self.objects.get_mut(id) {
            object.parent = Some(parent);
        }
        if let Some(p) = self.objects.get_mut(parent) {
            p.parts.push(id);
        }
        self.dirty = true;
    }

    fn detach_object(&mut self, id: ObjectId) {
        let Some(parent) = self.objects.get_mut(id).and_then(|o| o.parent.take()) else {
            return;
        };
        if let Some(p) = self.objects.get_mut(parent) {
            p.parts.retain(|&part| part != id);
        }
        self.dirty = true;
    }

    /// Parent chain, nearest first.
    pub fn object_ancestors(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut cursor = self.objects.get(id).and_then(|o| o.parent);
        while let Some(ancestor) = cursor {
            if out.contains(&ancestor) {
                break;
            }
            out.push(ancestor);
            cursor = self.objects.get(ancestor).and_then(|o| o.parent);
        }
        out
    }

    /// Move `id` under `parent`.
    pub fn set_object_parent(&mut self, id: ObjectId, parent: ObjectId) -> Result<()> {
        self.objects.try_get(id)?;
        self.objects.try_get(parent)?;
        if id == self.root_object {
            return Err(Error::ConstraintViolation("the root object has no parent".into()));
        }
        if id == parent || self.object_ancestors(parent).contains(&id) {
            return Err(Error::ConstraintViolation(format!("{parent} is a part of {id}")));
        }
        self.detach_object(id);
        self.attach_object(id, parent);
        Ok(())
    }

    /// Give a tree node to an object. A node belongs to at most one object.
    pub fn insert_object_node(&mut self, object: ObjectId, node: NodeId) -> Result<()> {
        self.objects.try_get(object)?;
        if let Some(owner) = self.tree.node(node)?.object() {
            return Err(Error::ConstraintViolation(format!("{node} already belongs to {owner}")));
        }
        self.tree.set_node_object(node, Some(object))?;
        self.objects.try_get_mut(object)?.nodes.push(node);
        self.dirty = true;
        Ok(())
    }

    pub fn remove_object_node(&mut self, object: ObjectId, node: NodeId) -> Result<()> {
        let o = self.objects.try_get_mut(object)?;
        let Some(pos) = o.nodes.iter().position(|&n| n == node) else {
            return Err(Error::NotFound(format!("{node} in {object}")));
        };
        o.nodes.remove(pos);
        self.tree.set_node_object(node, None)?;
        self.dirty = true;
        Ok(())
    }

    /// Remove an object and everything that references it.
    ///
    /// Properties, relationships and assignments go first, then the object
    /// leaves its parent. Its parts are orphaned and its nodes released;
    /// the caller decides what happens to them.
    pub fn remove_object(&mut self, id: ObjectId) -> Result<SurfelObject> {
        if id == self.root_object {
            return Err(Error::ConstraintViolation("the root object cannot be removed".into()));
        }
        let object = self.objects.try_get(id)?;
        let properties = object.properties.clone();
        let relationships = object.relationships.clone();
        let assignments = object.assignments.clone();

        for property in properties {
            self.remove_object_property(property)?;
        }
        for relationship in relationships {
            self.remove_object_relationship(relationship)?;
        }
        for assignment in assignments {
            self.remove_assignment(assignment)?;
        }

        self.detach_object(id);
        let object = self.objects.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        for &part in &object.parts {
            if let Some(p) = self.objects.get_mut(part) {
                p.parent = None;
            }
        }
        for &node in &object.nodes {
            self.tree.set_node_object(node, None)?;
        }
        self.dirty = true;
        debug!(object = %id, "removed object");
        Ok(object)
    }

    /// Move everything `src` owns onto `dst`, then remove `src`.
    pub fn merge_object(&mut self, dst: ObjectId, src: ObjectId) -> Result<()> {
        self.objects.try_get(dst)?;
        self.objects.try_get(src)?;
        if dst == src {
            return Err(Error::ConstraintViolation(format!("cannot merge {src} into itself")));
        }
        if src == self.root_object {
            return Err(Error::ConstraintViolation("the root object cannot be merged away".into()));
        }
        if self.object_ancestors(dst).contains(&src) {
            return Err(Error::ConstraintViolation(format!("{dst} is a part of {src}")));
        }

        let source = self.objects.try_get_mut(src)?;
        let nodes = std::mem::take(&mut source.nodes);
        let parts = std::mem::take(&mut source.parts);
        let properties = std::mem::take(&mut source.properties);
        let relationships = std::mem::take(&mut source.relationships);
        let assignments = std::mem::take(&mut source.assignments);

        for &node in &nodes {
            self.tree.set_node_object(node, Some(dst))?;
        }
        for &part in &parts {
            if let Some(p) = self.objects.get_mut(part) {
                p.parent = Some(dst);
            }
        }
        for &property in &properties {
            self.object_properties.try_get_mut(property)?.object = dst;
        }
        for &relationship in &relationships {
            let rel = self.object_relationships.try_get_mut(relationship)?;
            for object in rel.objects.iter_mut() {
                if *object == src {
                    *object = dst;
                }
            }
        }
        for &assignment in &assignments {
            self.assignments.try_get_mut(assignment)?.object = dst;
        }

        let target = self.objects.try_get_mut(dst)?;
        target.nodes.extend(nodes);
        target.parts.extend(parts);
        target.properties.extend(properties);
        for relationship in relationships {
            if !target.relationships.contains(&relationship) {
                target.relationships.push(relationship);
            }
        }
        target.assignments.extend(assignments);

        self.remove_object(src)?;
        debug!(%dst, %src, "merged objects");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------------

    pub fn set_feature_value(&mut self, object: ObjectId, feature: FeatureId, value: f64) -> Result<()> {
        let index = self
            .features
            .index_of(feature)
            .ok_or_else(|| Error::NotFound(feature.to_string()))?;
        let o = self.objects.try_get_mut(object)?;
        if o.feature_vector.len() <= index {
            o.feature_vector.resize(index + 1, 0.0);
        }
        o.feature_vector[index] = value;
        self.dirty = true;
        Ok(())
    }

    /// Replace an object's feature vector. Its length must equal the
    /// feature count.
    pub fn set_feature_vector(&mut self, object: ObjectId, vector: Vec<f64>) -> Result<()> {
        if vector.len() != self.features.len() {
            return Err(Error::ConstraintViolation(format!(
                "feature vector has {} values for {} features",
                vector.len(),
                self.features.len()
            )));
        }
        self.objects.try_get_mut(object)?.feature_vector = vector;
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    /// Surfels under the object's nodes (whole node subtrees) and parts.
    pub fn object_complexity(&self, id: ObjectId) -> Result<i64> {
        let object = self.objects.try_get(id)?;
        let mut complexity = 0;
        for &node in &object.nodes {
            for n in self.tree.subtree(node) {
                complexity += self.tree.summary(n)?.complexity;
            }
        }
        for &part in &object.parts {
            complexity += self.object_complexity(part)?;
        }
        Ok(complexity)
    }

    pub fn object_bbox(&self, id: ObjectId) -> Result<BBox> {
        let object = self.objects.try_get(id)?;
        let mut bbox = BBox::EMPTY;
        for &node in &object.nodes {
            bbox.union(&self.tree.summary(node)?.bbox);
        }
        for &part in &object.parts {
            bbox.union(&self.object_bbox(part)?);
        }
        Ok(bbox)
    }

    /// Center of the object's bounding box.
    pub fn object_centroid(&self, id: ObjectId) -> Result<DVec3> {
        Ok(self.object_bbox(id)?.centroid())
    }

    pub fn object_point_set(&self, id: ObjectId, query: &PointQuery<'_>) -> Result<SurfelPointSet> {
        let mut set = SurfelPointSet::new();
        self.insert_object_points(id, query, &mut set)?;
        Ok(set)
    }

    fn insert_object_points(&self, id: ObjectId, query: &PointQuery<'_>, set: &mut SurfelPointSet) -> Result<()> {
        let object = self.objects.try_get(id)?;
        for &node in &object.nodes {
            self.tree.insert_into_point_set(node, query, set)?;
        }
        for &part in &object.parts {
            self.insert_object_points(part, query, set)?;
        }
        Ok(())
    }

    /// The object a node belongs to.
    ///
    /// Looks at the node itself, then optionally up its ancestors, then
    /// optionally down its descendants, where the owner with the most
    /// surfels wins.
    pub fn find_node_object(&self, node: NodeId, search_ancestors: bool, search_descendants: bool) -> Result<Option<ObjectId>> {
        if let Some(object) = self.tree.node(node)?.object() {
            return Ok(Some(object));
        }
        if search_ancestors
            && let Some(object) = self
                .tree
                .ancestors(node)
                .into_iter()
                .find_map(|a| self.tree.node(a).ok().and_then(|n| n.object()))
        {
            return Ok(Some(object));
        }
        if search_descendants {
            let mut best: Option<(ObjectId, i64)> = None;
            for n in self.tree.subtree(node).into_iter().skip(1) {
                let Some(object) = self.tree.node(n)?.object() else { continue };
                let complexity = self.object_complexity(object)?;
                if best.is_none_or(|(_, c)| complexity > c) {
                    best = Some((object, complexity));
                }
            }
            return Ok(best.map(|(object, _)| object));
        }
        Ok(None)
    }

    // ------------------------------------------------------------------------
    // Label resolution
    // ------------------------------------------------------------------------

    fn label_by_originator(&self, id: ObjectId, originator: Originator) -> Result<Option<LabelId>> {
        let object = self.objects.try_get(id)?;
        let mut best: Option<(LabelId, f64)> = None;
        for &a in &object.assignments {
            let assignment = self.assignments.try_get(a)?;
            if assignment.originator != originator {
                continue;
            }
            if best.is_none_or(|(_, c)| assignment.confidence > c) {
                best = Some((assignment.label, assignment.confidence));
            }
        }
        Ok(best.map(|(label, _)| label))
    }

    pub fn ground_truth_label(&self, id: ObjectId) -> Result<Option<LabelId>> {
        self.label_by_originator(id, Originator::GroundTruth)
    }

    pub fn human_label(&self, id: ObjectId) -> Result<Option<LabelId>> {
        self.label_by_originator(id, Originator::Human)
    }

    /// Highest-confidence machine assignment.
    pub fn predicted_label(&self, id: ObjectId) -> Result<Option<LabelId>> {
        self.label_by_originator(id, Originator::Machine)
    }

    /// Ground truth, else human, else the best machine prediction.
    pub fn current_label(&self, id: ObjectId) -> Result<Option<LabelId>> {
        if let Some(label) = self.ground_truth_label(id)? {
            return Ok(Some(label));
        }
        if let Some(label) = self.human_label(id)? {
            return Ok(Some(label));
        }
        self.predicted_label(id)
    }
}
