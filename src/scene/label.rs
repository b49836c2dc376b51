//! Labels: the category taxonomy.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{AssignmentId, LabelId, LabelPropertyId, LabelRelationshipId, Rgb};
use crate::{Error, Result};

use super::SurfelScene;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfelLabel {
    name: Option<String>,
    identifier: i32,
    keystroke: i32,
    color: Rgb,
    flags: u32,
    pub(crate) parent: Option<LabelId>,
    pub(crate) parts: Vec<LabelId>,
    pub(crate) assignments: Vec<AssignmentId>,
    pub(crate) relationships: Vec<LabelRelationshipId>,
    pub(crate) properties: Vec<LabelPropertyId>,
}

impl Default for SurfelLabel {
    fn default() -> Self {
        Self {
            name: None,
            identifier: -1,
            keystroke: -1,
            color: Rgb::BLACK,
            flags: 0,
            parent: None,
            parts: Vec::new(),
            assignments: Vec::new(),
            relationships: Vec::new(),
            properties: Vec::new(),
        }
    }
}

impl SurfelLabel {
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

    /// Keyboard shortcut used by labeling tools, as a character code.
    pub fn with_keystroke(mut self, keystroke: i32) -> Self {
        self.keystroke = keystroke;
        self
    }

    pub fn with_color(mut self, color: Rgb) -> Self {
        self.color = color;
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

    pub fn identifier(&self) -> i32 {
        self.identifier
    }

    pub fn set_identifier(&mut self, identifier: i32) {
        self.identifier = identifier;
    }

    pub fn keystroke(&self) -> i32 {
        self.keystroke
    }

    pub fn set_keystroke(&mut self, keystroke: i32) {
        self.keystroke = keystroke;
    }

    pub fn color(&self) -> Rgb {
        self.color
    }

    pub fn set_color(&mut self, color: Rgb) {
        self.color = color;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn parent(&self) -> Option<LabelId> {
        self.parent
    }

    pub fn parts(&self) -> &[LabelId] {
        &self.parts
    }

    pub fn assignments(&self) -> &[AssignmentId] {
        &self.assignments
    }

    pub fn relationships(&self) -> &[LabelRelationshipId] {
        &self.relationships
    }

    pub fn properties(&self) -> &[LabelPropertyId] {
        &self.properties
    }

    pub(crate) fn unlinked(mut self) -> Self {
        self.parent = None;
        self.parts.clear();
        self.assignments.clear();
        self.relationships.clear();
        self.properties.clear();
        self
    }
}

impl SurfelScene {
    pub fn root_label(&self) -> LabelId {
        self.root_label
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, id: LabelId) -> Result<&SurfelLabel> {
        self.labels.try_get(id)
    }

    pub fn label_mut(&mut self, id: LabelId) -> Result<&mut SurfelLabel> {
        self.dirty = true;
        self.labels.try_get_mut(id)
    }

    pub fn label_at(&self, index: usize) -> Option<LabelId> {
        self.labels.handle_at(index)
    }

    pub fn label_index(&self, id: LabelId) -> Option<usize> {
        self.labels.index_of(id)
    }

    pub fn label_ids(&self) -> Vec<LabelId> {
        self.labels.handles()
    }

    pub fn labels(&self) -> impl Iterator<Item = (LabelId, &SurfelLabel)> + '_ {
        self.labels.iter()
    }

    pub fn find_label_by_name(&self, name: &str) -> Option<LabelId> {
        self.labels.iter().find(|(_, l)| l.name() == Some(name)).map(|(id, _)| id)
    }

    pub fn find_label_by_identifier(&self, identifier: i32) -> Option<LabelId> {
        if identifier < 0 {
            return None;
        }
        self.labels.iter().find(|(_, l)| l.identifier == identifier).map(|(id, _)| id)
    }

    pub fn find_label_by_keystroke(&self, keystroke: i32) -> Option<LabelId> {
        if keystroke < 0 {
            return None;
        }
        self.labels.iter().find(|(_, l)| l.keystroke == keystroke).map(|(id, _)| id)
    }

    pub fn insert_label(&mut self, label: SurfelLabel, parent: LabelId) -> Result<LabelId> {
        self.labels.try_get(parent)?;
        let id = self.insert_label_detached(label);
        self.attach_label(id, parent);
        debug!(label = %id, %parent, "inserted label");
        Ok(id)
    }

    pub(crate) fn insert_label_detached(&mut self, label: SurfelLabel) -> LabelId {
        self.dirty = true;
        self.labels.insert(label.unlinked())
    }

    fn attach_label(&mut self, id: LabelId, parent: LabelId) {
        if let Some(label) = self.labels.get_mut(id) {
            label.parent = Some(parent);
        }
        if let Some(p) = self.labels.get_mut(parent) {
            p.parts.push(id);
        }
        self.dirty = true;
    }

    fn detach_label(&mut self, id: LabelId) {
        let Some(parent) = self.labels.get_mut(id).and_then(|l| l.parent.take()) else {
            return;
        };
        if let Some(p) = self.labels.get_mut(parent) {
            p.parts.retain(|&part| part != id);
        }
        self.dirty = true;
    }

    pub fn label_ancestors(&self, id: LabelId) -> Vec<LabelId> {
        let mut out = Vec::new();
        let mut cursor = self.labels.get(id).and_then(|l| l.parent);
        while let Some(ancestor) = cursor {
            if out.contains(&ancestor) {
                break;
            }
            out.push(ancestor);
            cursor = self.labels.get(ancestor).and_then(|l| l.parent);
        }
        out
    }

    pub fn set_label_parent(&mut self, id: LabelId, parent: LabelId) -> Result<()> {
        self.labels.try_get(id)?;
        self.labels.try_get(parent)?;
        if id == self.root_label {
            return Err(Error::ConstraintViolation("the root label has no parent".into()));
        }
        if id == parent || self.label_ancestors(parent).contains(&id) {
            return Err(Error::ConstraintViolation(format!("{parent} is below {id}")));
        }
        self.detach_label(id);
        self.attach_label(id, parent);
        Ok(())
    }

    /// Remove a label. Cascades like [`SurfelScene::remove_object`]: its
    /// properties, relationships and assignments go too and its children
    /// are orphaned.
    pub fn remove_label(&mut self, id: LabelId) -> Result<SurfelLabel> {
        if id == self.root_label {
            return Err(Error::ConstraintViolation("the root label cannot be removed".into()));
        }
        let label = self.labels.try_get(id)?;
        let properties = label.properties.clone();
        let relationships = label.relationships.clone();
        let assignments = label.assignments.clone();

        for property in properties {
            self.remove_label_property(property)?;
        }
        for relationship in relationships {
            self.remove_label_relationship(relationship)?;
        }
        for assignment in assignments {
            self.remove_assignment(assignment)?;
        }

        self.detach_label(id);
        let label = self.labels.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        for &part in &label.parts {
            if let Some(p) = self.labels.get_mut(part) {
                p.parent = None;
            }
        }
        self.dirty = true;
        debug!(label = %id, "removed label");
        Ok(label)
    }
}
