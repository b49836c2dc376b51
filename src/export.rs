//! Export-only scene writers.
//!
//! ```text
//! SurfelScene → write_arff() → @relation / @attribute / @data table
//! SurfelScene → write_tqn()  → object hierarchy with leaf groups and labels
//! ```
//!
//! Neither format can be read back; they feed external classifiers and
//! hierarchy tools.

use std::io::Write;

use hashbrown::HashMap;

use crate::model::{LabelId, ObjectId};
use crate::scene::SurfelScene;
use crate::Result;

/// Label used by both exports: ground truth first, then human.
fn annotated_label(scene: &SurfelScene, object: ObjectId) -> Result<Option<LabelId>> {
    Ok(match scene.ground_truth_label(object)? {
        Some(label) => Some(label),
        None => scene.human_label(object)?,
    })
}

fn label_name(scene: &SurfelScene, label: LabelId) -> Result<&str> {
    Ok(scene.label(label)?.name().unwrap_or("None"))
}

/// Write the object feature table in ARFF.
///
/// One attribute per feature plus a nominal `Label` attribute listing every
/// label. Each non-root object contributes a `%` comment line with its name
/// and centroid followed by its feature values and label.
pub fn write_arff<W: Write>(scene: &SurfelScene, w: &mut W) -> Result<()> {
    writeln!(w, "@relation UGOR")?;

    for (_, feature) in scene.features() {
        writeln!(w, "@attribute {} real", feature.name().unwrap_or("None"))?;
    }

    write!(w, "@attribute Label {{ ")?;
    for (i, (_, label)) in scene.labels().enumerate() {
        if i != 0 {
            write!(w, ", ")?;
        }
        write!(w, "{} ", label.name().unwrap_or("None"))?;
    }
    writeln!(w, "}}")?;

    writeln!(w, "@data")?;
    for (id, object) in scene.objects().skip(1) {
        let c = scene.object_centroid(id)?;
        writeln!(w, "% {} {} {} {}", object.name().unwrap_or("None"), c.x, c.y, c.z)?;
        for value in object.feature_vector() {
            write!(w, "{value:12.6} ")?;
        }
        let label = match annotated_label(scene, id)? {
            Some(label) => label_name(scene, label)?,
            None => "Unknown",
        };
        writeln!(w, "{label}")?;
    }
    Ok(())
}

/// Objects in stack order from the root: children are pushed in part order
/// and popped last-first.
fn stack_order(scene: &SurfelScene, start: ObjectId) -> Result<Vec<ObjectId>> {
    let mut order = Vec::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        stack.extend_from_slice(scene.object(id)?.parts());
        order.push(id);
    }
    Ok(order)
}

/// Write the object hierarchy in the "tqn" text format.
///
/// Unannotated leaf objects directly under the root are skipped. Every kept
/// object gets a model index; every kept leaf also gets a leaf index, and
/// each model lists the leaves below it as its `leaf_group`.
pub fn write_tqn<W: Write>(scene: &SurfelScene, scene_name: &str, w: &mut W) -> Result<()> {
    let root = scene.root_object();
    let order = stack_order(scene, root)?;

    let mut models: HashMap<ObjectId, usize> = HashMap::new();
    let mut leaves: HashMap<ObjectId, usize> = HashMap::new();
    for &id in &order {
        let object = scene.object(id)?;
        let is_leaf = object.parts().is_empty();
        if is_leaf && object.parent() == Some(root) && annotated_label(scene, id)?.is_none() {
            continue;
        }
        models.insert(id, models.len());
        if is_leaf {
            leaves.insert(id, leaves.len());
        }
    }

    writeln!(w, "root 0")?;
    writeln!(w, "scene_name {scene_name}")?;

    for &id in &order {
        let Some(&model) = models.get(&id) else { continue };
        let object = scene.object(id)?;
        writeln!(w, "newModel {model}")?;

        let parent = object.parent().and_then(|p| models.get(&p).copied());
        match parent {
            Some(p) => writeln!(w, "parent {p}")?,
            None => writeln!(w, "parent -1")?,
        }

        write!(w, "children ")?;
        for part in object.parts() {
            if let Some(child) = models.get(part) {
                write!(w, "{child} ")?;
            }
        }
        writeln!(w)?;

        write!(w, "leaf_group")?;
        for below in stack_order(scene, id)? {
            if let Some(leaf) = leaves.get(&below) {
                write!(w, " {leaf}")?;
            }
        }
        writeln!(w)?;

        let label = match annotated_label(scene, id)? {
            None if id == root => Some(scene.root_label()),
            other => other,
        };
        if let Some(label) = label {
            let index = scene.label_index(label).unwrap_or(0);
            writeln!(w, "label {index} {}", label_name(scene, label)?)?;
        }
    }
    Ok(())
}
