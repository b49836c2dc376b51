//! Assignments, relationships and properties.
//!
//! All three are edges owned by the scene. Each endpoint keeps the edge's
//! handle in its own list so removal can cascade from either side.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::model::{
    AssignmentId, LabelId, LabelPropertyId, LabelRelationshipId, ObjectId, ObjectPropertyId, ObjectRelationshipId,
};
use crate::{Error, Result};

use super::SurfelScene;

/// Who produced an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Originator {
    #[default]
    Unknown,
    Machine,
    Human,
    GroundTruth,
}

impl Originator {
    pub fn code(self) -> i32 {
        match self {
            Originator::Unknown => 0,
            Originator::Machine => 1,
            Originator::Human => 2,
            Originator::GroundTruth => 3,
        }
    }

    /// Unrecognized codes read as [`Originator::Unknown`].
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Originator::Machine,
            2 => Originator::Human,
            3 => Originator::GroundTruth,
            _ => Originator::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub object: ObjectId,
    pub label: LabelId,
    pub confidence: f64,
    pub originator: Originator,
}

impl Assignment {
    pub fn new(object: ObjectId, label: LabelId, confidence: f64, originator: Originator) -> Self {
        Self { object, label, confidence, originator }
    }
}

pub type Operands = SmallVec<[f64; 4]>;

/// Typed N-ary edge over objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRelationship {
    pub kind: i32,
    pub objects: SmallVec<[ObjectId; 2]>,
    pub operands: Operands,
}

impl ObjectRelationship {
    pub fn new(kind: i32, objects: impl IntoIterator<Item = ObjectId>, operands: impl IntoIterator<Item = f64>) -> Self {
        Self { kind, objects: objects.into_iter().collect(), operands: operands.into_iter().collect() }
    }
}

/// Typed N-ary edge over labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRelationship {
    pub kind: i32,
    pub labels: SmallVec<[LabelId; 2]>,
    pub operands: Operands,
}

impl LabelRelationship {
    pub fn new(kind: i32, labels: impl IntoIterator<Item = LabelId>, operands: impl IntoIterator<Item = f64>) -> Self {
        Self { kind, labels: labels.into_iter().collect(), operands: operands.into_iter().collect() }
    }
}

/// Typed unary annotation on an object, e.g. PCA axes or an oriented box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub kind: i32,
    pub object: ObjectId,
    pub operands: Operands,
}

impl ObjectProperty {
    pub fn new(kind: i32, object: ObjectId, operands: impl IntoIterator<Item = f64>) -> Self {
        Self { kind, object, operands: operands.into_iter().collect() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelProperty {
    pub kind: i32,
    pub label: LabelId,
    pub operands: Operands,
}

impl LabelProperty {
    pub fn new(kind: i32, label: LabelId, operands: impl IntoIterator<Item = f64>) -> Self {
        Self { kind, label, operands: operands.into_iter().collect() }
    }
}

impl SurfelScene {
    // ------------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------------

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn assignment(&self, id: AssignmentId) -> Result<&Assignment> {
        self.assignments.try_get(id)
    }

    pub fn assignment_at(&self, index: usize) -> Option<AssignmentId> {
        self.assignments.handle_at(index)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (AssignmentId, &Assignment)> + '_ {
        self.assignments.iter()
    }

    pub fn insert_assignment(&mut self, assignment: Assignment) -> Result<AssignmentId> {
        self.objects.try_get(assignment.object)?;
        self.labels.try_get(assignment.label)?;
        let id = self.assignments.insert(assignment);
        self.objects.try_get_mut(assignment.object)?.assignments.push(id);
        self.labels.try_get_mut(assignment.label)?.assignments.push(id);
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_assignment(&mut self, id: AssignmentId) -> Result<Assignment> {
        let assignment = self.assignments.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(object) = self.objects.get_mut(assignment.object) {
            object.assignments.retain(|&a| a != id);
        }
        if let Some(label) = self.labels.get_mut(assignment.label) {
            label.assignments.retain(|&a| a != id);
        }
        self.dirty = true;
        Ok(assignment)
    }

    /// Exact match on all four fields, searched through the object's list.
    pub fn find_assignment(
        &self,
        object: ObjectId,
        label: LabelId,
        confidence: f64,
        originator: Originator,
    ) -> Option<AssignmentId> {
        let o = self.objects.get(object)?;
        o.assignments.iter().copied().find(|&a| {
            self.assignments.get(a).is_some_and(|x| {
                x.label == label && x.confidence == confidence && x.originator == originator
            })
        })
    }

    // ------------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------------

    pub fn object_relationship_count(&self) -> usize {
        self.object_relationships.len()
    }

    pub fn object_relationship(&self, id: ObjectRelationshipId) -> Result<&ObjectRelationship> {
        self.object_relationships.try_get(id)
    }

    pub fn object_relationships(&self) -> impl Iterator<Item = (ObjectRelationshipId, &ObjectRelationship)> + '_ {
        self.object_relationships.iter()
    }

    pub fn insert_object_relationship(&mut self, relationship: ObjectRelationship) -> Result<ObjectRelationshipId> {
        for &object in &relationship.objects {
            self.objects.try_get(object)?;
        }
        let objects = relationship.objects.clone();
        let id = self.object_relationships.insert(relationship);
        for object in objects {
            let o = self.objects.try_get_mut(object)?;
            if !o.relationships.contains(&id) {
                o.relationships.push(id);
            }
        }
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_object_relationship(&mut self, id: ObjectRelationshipId) -> Result<ObjectRelationship> {
        let relationship = self
            .object_relationships
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        for &object in &relationship.objects {
            if let Some(o) = self.objects.get_mut(object) {
                o.relationships.retain(|&r| r != id);
            }
        }
        self.dirty = true;
        Ok(relationship)
    }

    pub fn label_relationship_count(&self) -> usize {
        self.label_relationships.len()
    }

    pub fn label_relationship(&self, id: LabelRelationshipId) -> Result<&LabelRelationship> {
        self.label_relationships.try_get(id)
    }

    pub fn label_relationships(&self) -> impl Iterator<Item = (LabelRelationshipId, &LabelRelationship)> + '_ {
        self.label_relationships.iter()
    }

    pub fn insert_label_relationship(&mut self, relationship: LabelRelationship) -> Result<LabelRelationshipId> {
        for &label in &relationship.labels {
            self.labels.try_get(label)?;
        }
        let labels = relationship.labels.clone();
        let id = self.label_relationships.insert(relationship);
        for label in labels {
            let l = self.labels.try_get_mut(label)?;
            if !l.relationships.contains(&id) {
                l.relationships.push(id);
            }
        }
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_label_relationship(&mut self, id: LabelRelationshipId) -> Result<LabelRelationship> {
        let relationship = self
            .label_relationships
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        for &label in &relationship.labels {
            if let Some(l) = self.labels.get_mut(label) {
                l.relationships.retain(|&r| r != id);
            }
        }
        self.dirty = true;
        Ok(relationship)
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn object_property_count(&self) -> usize {
        self.object_properties.len()
    }

    pub fn object_property(&self, id: ObjectPropertyId) -> Result<&ObjectProperty> {
        self.object_properties.try_get(id)
    }

    pub fn object_properties(&self) -> impl Iterator<Item = (ObjectPropertyId, &ObjectProperty)> + '_ {
        self.object_properties.iter()
    }

    pub fn insert_object_property(&mut self, property: ObjectProperty) -> Result<ObjectPropertyId> {
        self.objects.try_get(property.object)?;
        let object = property.object;
        let id = self.object_properties.insert(property);
        self.objects.try_get_mut(object)?.properties.push(id);
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_object_property(&mut self, id: ObjectPropertyId) -> Result<ObjectProperty> {
        let property = self
            .object_properties
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(o) = self.objects.get_mut(property.object) {
            o.properties.retain(|&p| p != id);
        }
        self.dirty = true;
        Ok(property)
    }

    pub fn label_property_count(&self) -> usize {
        self.label_properties.len()
    }

    pub fn label_property(&self, id: LabelPropertyId) -> Result<&LabelProperty> {
        self.label_properties.try_get(id)
    }

    pub fn label_properties(&self) -> impl Iterator<Item = (LabelPropertyId, &LabelProperty)> + '_ {
        self.label_properties.iter()
    }

    pub fn insert_label_property(&mut self, property: LabelProperty) -> Result<LabelPropertyId> {
        self.labels.try_get(property.label)?;
        let label = property.label;
        let id = self.label_properties.insert(property);
        self.labels.try_get_mut(label)?.properties.push(id);
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_label_property(&mut self, id: LabelPropertyId) -> Result<LabelProperty> {
        let property = self
            .label_properties
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(l) = self.labels.get_mut(property.label) {
            l.properties.retain(|&p| p != id);
        }
        self.dirty = true;
        Ok(property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{SurfelLabel, SurfelObject};
    use pretty_assertions::assert_eq;

    fn two_objects() -> (SurfelScene, ObjectId, ObjectId) {
        let mut scene = SurfelScene::new();
        let root = scene.root_object();
        let a = scene.insert_object(SurfelObject::named("a"), root).unwrap();
        let b = scene.insert_object(SurfelObject::named("b"), root).unwrap();
        (scene, a, b)
    }

    #[test]
    fn test_originator_codes() {
        for o in [Originator::Unknown, Originator::Machine, Originator::Human, Originator::GroundTruth] {
            assert_eq!(Originator::from_code(o.code()), o);
        }
        assert_eq!(Originator::from_code(42), Originator::Unknown);
    }

    #[test]
    fn test_find_assignment_matches_all_fields() {
        let (mut scene, a, _) = two_objects();
        let label = scene.insert_label(SurfelLabel::named("car"), scene.root_label()).unwrap();
        let id = scene.insert_assignment(Assignment::new(a, label, 0.5, Originator::Machine)).unwrap();
        assert_eq!(scene.find_assignment(a, label, 0.5, Originator::Machine), Some(id));
        assert_eq!(scene.find_assignment(a, label, 0.5, Originator::Human), None);
        assert_eq!(scene.find_assignment(a, label, 0.6, Originator::Machine), None);
    }

    #[test]
    fn test_relationship_cascade_on_object_removal() {
        let (mut scene, a, b) = two_objects();
        let rel = scene
            .insert_object_relationship(ObjectRelationship::new(1, [a, b], [0.25]))
            .unwrap();
        scene.insert_object_property(ObjectProperty::new(2, a, [1.0, 2.0, 3.0])).unwrap();
        assert_eq!(scene.object(b).unwrap().relationships(), &[rel]);

        scene.remove_object(a).unwrap();
        assert_eq!(scene.object_relationship_count(), 0);
        assert_eq!(scene.object_property_count(), 0);
        assert!(scene.object(b).unwrap().relationships().is_empty());
    }

    #[test]
    fn test_label_relationships_and_properties() {
        let mut scene = SurfelScene::new();
        let root = scene.root_label();
        let x = scene.insert_label(SurfelLabel::named("x"), root).unwrap();
        let y = scene.insert_label(SurfelLabel::named("y"), root).unwrap();
        scene.insert_label_relationship(LabelRelationship::new(3, [x, y], Vec::<f64>::new())).unwrap();
        scene.insert_label_property(LabelProperty::new(1, y, [0.9])).unwrap();
        scene.remove_label(y).unwrap();
        assert_eq!(scene.label_relationship_count(), 0);
        assert_eq!(scene.label_property_count(), 0);
        assert!(scene.label(x).unwrap().relationships().is_empty());
    }
}
