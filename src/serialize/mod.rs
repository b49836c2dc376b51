//! # Scene Serialization
//!
//! Both scene formats share one intermediate form, [`SceneRecords`]: a flat,
//! index-based image of the graph. Writers flatten the scene into records
//! and then encode; readers decode records, validate every cross-reference,
//! and only then build entities.
//!
//! ```text
//!  SurfelScene ──from_scene──► SceneRecords ──ascii/binary──► bytes
//!  SurfelScene ◄────apply───── SceneRecords ◄──ascii/binary── bytes
//! ```
//!
//! Section order on the wire: header and counts, transformation, comments,
//! nodes, objects, labels, features, object relationships, label
//! relationships, assignments, scans, images, object properties, label
//! properties. Index 0 of nodes, objects and labels is always the root.

pub mod ascii;
pub mod binary;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use glam::DMat4;
use hashbrown::HashSet;
use tracing::info;

use crate::export;
use crate::model::{BlockId, Rgb};
use crate::scene::{
    Assignment, Camera, Distortion, FeatureKind, Intrinsics, LabelProperty, LabelRelationship, ObjectProperty,
    ObjectRelationship, Originator, RollingShutter, SurfelFeature, SurfelImage, SurfelLabel, SurfelObject, SurfelScan,
    SurfelScene,
};
use crate::tree::SurfelNode;
use crate::{Error, Result};

/// File kinds recognized by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneFormat {
    Ascii,
    Binary,
    Arff,
    Tqn,
}

impl SceneFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "ssa" => Ok(SceneFormat::Ascii),
            "ssx" => Ok(SceneFormat::Binary),
            "arff" => Ok(SceneFormat::Arff),
            "tqn" => Ok(SceneFormat::Tqn),
            _ => Err(Error::Format(format!("unrecognized scene file extension: {}", path.display()))),
        }
    }

    /// Whether the format can be read back.
    pub fn is_scene(self) -> bool {
        matches!(self, SceneFormat::Ascii | SceneFormat::Binary)
    }
}

pub(crate) fn read_scene_file(scene: &mut SurfelScene, path: &Path) -> Result<()> {
    let format = SceneFormat::from_path(path)?;
    let mut reader = BufReader::new(File::open(path)?);
    let records = match format {
        SceneFormat::Ascii => ascii::read_records(&mut reader)?,
        SceneFormat::Binary => binary::read_records(&mut reader)?,
        SceneFormat::Arff | SceneFormat::Tqn => {
            return Err(Error::Format(format!("{} is an export-only format", path.display())));
        }
    };
    records.apply(scene)?;
    info!(path = %path.display(), objects = scene.object_count(), labels = scene.label_count(), "read scene");
    Ok(())
}

/// The whole stream is encoded before the file is created, so an encoding
/// error leaves any existing file alone.
pub(crate) fn write_scene_file(scene: &SurfelScene, path: &Path) -> Result<()> {
    let format = SceneFormat::from_path(path)?;
    let mut w = Vec::new();
    match format {
        SceneFormat::Ascii => ascii::write_records(&SceneRecords::from_scene(scene)?, &mut w)?,
        SceneFormat::Binary => binary::write_records(&SceneRecords::from_scene(scene)?, &mut w)?,
        SceneFormat::Arff => export::write_arff(scene, &mut w)?,
        SceneFormat::Tqn => {
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("scene");
            export::write_tqn(scene, name, &mut w)?
        }
    }
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&w)?;
    file.flush()?;
    info!(path = %path.display(), ?format, bytes = w.len(), "wrote scene");
    Ok(())
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeRecord {
    pub name: Option<String>,
    pub parent: i32,
    pub part_count: i32,
    pub complexity: f64,
    pub resolution: f64,
    pub blocks: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectRecord {
    pub name: Option<String>,
    pub identifier: i32,
    pub parent: i32,
    pub part_count: i32,
    pub complexity: f64,
    pub flags: u32,
    pub values: Vec<f64>,
    pub nodes: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LabelRecord {
    pub name: Option<String>,
    pub identifier: i32,
    pub keystroke: i32,
    pub parent: i32,
    pub part_count: i32,
    pub color: Rgb,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeatureRecord {
    pub name: Option<String>,
    pub minimum: f64,
    pub maximum: f64,
    pub weight: f64,
    pub kind: i32,
    pub filename: Option<String>,
}

/// Relationship or property: a kind, member indices and operands.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EdgeRecord {
    pub kind: i32,
    pub members: Vec<i32>,
    pub operands: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AssignmentRecord {
    pub object: i32,
    pub label: i32,
    pub confidence: f64,
    pub originator: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScanRecord {
    pub name: Option<String>,
    pub camera: Camera,
    pub timestamp: f64,
    pub node: i32,
    pub intrinsics: Intrinsics,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImageRecord {
    pub name: Option<String>,
    pub camera: Camera,
    pub timestamp: f64,
    pub scan: i32,
    pub intrinsics: Intrinsics,
    pub flags: u32,
    pub distortion: Distortion,
    pub rolling_shutter: Option<RollingShutter>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct SceneRecords {
    pub name: Option<String>,
    /// Row-major.
    pub transformation: [[f64; 4]; 4],
    pub comments: Vec<String>,
    pub nodes: Vec<NodeRecord>,
    pub objects: Vec<ObjectRecord>,
    pub labels: Vec<LabelRecord>,
    pub features: Vec<FeatureRecord>,
    pub object_relationships: Vec<EdgeRecord>,
    pub label_relationships: Vec<EdgeRecord>,
    pub assignments: Vec<AssignmentRecord>,
    pub scans: Vec<ScanRecord>,
    pub images: Vec<ImageRecord>,
    /// `members` holds the single owning object.
    pub object_properties: Vec<EdgeRecord>,
    pub label_properties: Vec<EdgeRecord>,
}

/// Counts in header order.
pub(crate) struct Counts {
    pub nodes: usize,
    pub objects: usize,
    pub labels: usize,
    pub features: usize,
    pub object_relationships: usize,
    pub label_relationships: usize,
    pub assignments: usize,
    pub scans: usize,
    pub object_properties: usize,
    pub label_properties: usize,
    pub images: usize,
    pub comments: usize,
}

impl Counts {
    pub fn to_array(&self) -> [usize; 12] {
        [
            self.nodes,
            self.objects,
            self.labels,
            self.features,
            self.object_relationships,
            self.label_relationships,
            self.assignments,
            self.scans,
            self.object_properties,
            self.label_properties,
            self.images,
            self.comments,
        ]
    }

    pub fn from_array(v: [i32; 12]) -> Result<Self> {
        if let Some(bad) = v.iter().find(|&&n| n < 0) {
            return Err(Error::Format(format!("negative entity count {bad}")));
        }
        let n = |i: usize| v[i] as usize;
        Ok(Self {
            nodes: n(0),
            objects: n(1),
            labels: n(2),
            features: n(3),
            object_relationships: n(4),
            label_relationships: n(5),
            assignments: n(6),
            scans: n(7),
            object_properties: n(8),
            label_properties: n(9),
            images: n(10),
            comments: n(11),
        })
    }
}

pub(crate) fn matrix_to_rows(m: &DMat4) -> [[f64; 4]; 4] {
    let t = m.transpose().to_cols_array_2d();
    [t[0], t[1], t[2], t[3]]
}

pub(crate) fn matrix_from_rows(rows: &[[f64; 4]; 4]) -> DMat4 {
    DMat4::from_cols_array_2d(rows).transpose()
}

fn index_or_none(index: Option<usize>) -> i32 {
    index.map_or(-1, |i| i as i32)
}

fn check_index(kind: &str, index: i32, len: usize, allow_none: bool) -> Result<()> {
    if (allow_none && index == -1) || (index >= 0 && (index as usize) < len) {
        return Ok(());
    }
    Err(Error::Format(format!("{kind} index {index} out of range (count {len})")))
}

/// Every record's parent chain must end at the root or at -1. Record 0 is
/// the root and its parent is ignored. Indices are already range-checked.
fn check_acyclic(kind: &str, parents: &[i32]) -> Result<()> {
    for start in 1..parents.len() {
        let mut at = start;
        let mut steps = 0;
        while at != 0 && parents[at] >= 0 {
            at = parents[at] as usize;
            steps += 1;
            if at == start || steps > parents.len() {
                return Err(Error::Format(format!("{kind} {start} is its own ancestor")));
            }
        }
    }
    Ok(())
}

/// Indices that may be claimed by only one record, e.g. a block by one node.
struct Claims<'a> {
    kind: &'a str,
    seen: HashSet<i32>,
}

impl<'a> Claims<'a> {
    fn new(kind: &'a str) -> Self {
        Self { kind, seen: HashSet::new() }
    }

    fn claim(&mut self, index: i32) -> Result<()> {
        if self.seen.insert(index) {
            Ok(())
        } else {
            Err(Error::Format(format!("{} {index} is claimed twice", self.kind)))
        }
    }
}

impl SceneRecords {
    pub fn counts(&self) -> Counts {
        Counts {
            nodes: self.nodes.len(),
            objects: self.objects.len(),
            labels: self.labels.len(),
            features: self.features.len(),
            object_relationships: self.object_relationships.len(),
            label_relationships: self.label_relationships.len(),
            assignments: self.assignments.len(),
            scans: self.scans.len(),
            object_properties: self.object_properties.len(),
            label_properties: self.label_properties.len(),
            images: self.images.len(),
            comments: self.comments.len(),
        }
    }

    /// Flatten a scene. Every handle becomes its dense index.
    pub fn from_scene(scene: &SurfelScene) -> Result<Self> {
        let tree = scene.tree();
        let db = scene.database();

        let mut nodes = Vec::with_capacity(tree.node_count());
        for (id, node) in tree.nodes() {
            let summary = tree.summary(id)?;
            nodes.push(NodeRecord {
                name: node.name().map(str::to_owned),
                parent: index_or_none(node.parent().and_then(|p| tree.node_index(p))),
                part_count: node.parts().len() as i32,
                complexity: summary.complexity as f64,
                resolution: summary.resolution,
                blocks: node.blocks().iter().map(|&b| index_or_none(db.block_index(b))).collect(),
            });
        }

        let mut objects = Vec::with_capacity(scene.object_count());
        for (id, object) in scene.objects() {
            objects.push(ObjectRecord {
                name: object.name().map(str::to_owned),
                identifier: object.identifier(),
                parent: index_or_none(object.parent().and_then(|p| scene.object_index(p))),
                part_count: object.parts().len() as i32,
                complexity: scene.object_complexity(id)? as f64,
                flags: object.flags(),
                values: object.feature_vector().to_vec(),
                nodes: object.nodes().iter().map(|&n| index_or_none(tree.node_index(n))).collect(),
            });
        }

        let labels = scene
            .labels()
            .map(|(_, label)| LabelRecord {
                name: label.name().map(str::to_owned),
                identifier: label.identifier(),
                keystroke: label.keystroke(),
                parent: index_or_none(label.parent().and_then(|p| scene.label_index(p))),
                part_count: label.parts().len() as i32,
                color: label.color(),
                flags: label.flags(),
            })
            .collect();

        let features = scene
            .features()
            .map(|(_, f)| FeatureRecord {
                name: f.name.clone(),
                minimum: f.minimum,
                maximum: f.maximum,
                weight: f.weight,
                kind: f.kind.code(),
                filename: match &f.kind {
                    FeatureKind::OverheadGrid { filename } => filename.clone(),
                    _ => None,
                },
            })
            .collect();

        let object_relationships = scene
            .object_relationships()
            .map(|(_, r)| EdgeRecord {
                kind: r.kind,
                members: r.objects.iter().map(|&o| index_or_none(scene.object_index(o))).collect(),
                operands: r.operands.to_vec(),
            })
            .collect();
        let label_relationships = scene
            .label_relationships()
            .map(|(_, r)| EdgeRecord {
                kind: r.kind,
                members: r.labels.iter().map(|&l| index_or_none(scene.label_index(l))).collect(),
                operands: r.operands.to_vec(),
            })
            .collect();

        let assignments = scene
            .assignments()
            .map(|(_, a)| AssignmentRecord {
                object: index_or_none(scene.object_index(a.object)),
                label: index_or_none(scene.label_index(a.label)),
                confidence: a.confidence,
                originator: a.originator.code(),
            })
            .collect();

        let scans = scene
            .scans()
            .map(|(_, s)| ScanRecord {
                name: s.name.clone(),
                camera: s.camera,
                timestamp: s.timestamp,
                node: index_or_none(s.node().and_then(|n| tree.node_index(n))),
                intrinsics: s.intrinsics,
                flags: s.flags,
            })
            .collect();

        let images = scene
            .images()
            .map(|(_, i)| ImageRecord {
                name: i.name.clone(),
                camera: i.camera,
                timestamp: i.timestamp,
                scan: index_or_none(i.scan().and_then(|s| scene.scan_index(s))),
                intrinsics: i.intrinsics,
                flags: i.flags,
                distortion: i.distortion,
                rolling_shutter: i.rolling_shutter,
            })
            .collect();

        let object_properties = scene
            .object_properties()
            .map(|(_, p)| EdgeRecord {
                kind: p.kind,
                members: vec![index_or_none(scene.object_index(p.object))],
                operands: p.operands.to_vec(),
            })
            .collect();
        let label_properties = scene
            .label_properties()
            .map(|(_, p)| EdgeRecord {
                kind: p.kind,
                members: vec![index_or_none(scene.label_index(p.label))],
                operands: p.operands.to_vec(),
            })
            .collect();

        Ok(Self {
            name: scene.name().map(str::to_owned),
            transformation: matrix_to_rows(&scene.transformation()),
            comments: scene.comments().to_vec(),
            nodes,
            objects,
            labels,
            features,
            object_relationships,
            label_relationships,
            assignments,
            scans,
            images,
            object_properties,
            label_properties,
        })
    }

    /// Check every cross-reference against the records and against the
    /// scene they will be built into, before anything is built.
    ///
    /// Beyond range checks: parent chains must be acyclic, a block may go to
    /// one node and must not already have an owner, and a node may go to one
    /// object and one scan. Record 0 maps onto the scene's root node, so it
    /// is checked against the root's current links.
    fn validate(&self, scene: &SurfelScene, db_blocks: &[BlockId]) -> Result<()> {
        let (nn, no, nl, ns) = (self.nodes.len(), self.objects.len(), self.labels.len(), self.scans.len());
        if nn == 0 || no == 0 || nl == 0 {
            return Err(Error::Format("scene has no root node, object or label".into()));
        }
        let mut blocks = Claims::new("block");
        for n in &self.nodes {
            check_index("node parent", n.parent, nn, true)?;
            for &b in &n.blocks {
                check_index("block", b, db_blocks.len(), false)?;
                blocks.claim(b)?;
                let block = db_blocks[b as usize];
                if let Some(owner) = scene.database().block_info(block)?.node {
                    return Err(Error::Format(format!("{block} already belongs to {owner}")));
                }
            }
        }
        let root = scene.tree.node(scene.tree.root())?;
        let mut object_nodes = Claims::new("object node");
        for o in &self.objects {
            check_index("object parent", o.parent, no, true)?;
            for &n in &o.nodes {
                check_index("object node", n, nn, false)?;
                object_nodes.claim(n)?;
                if n == 0
                    && let Some(owner) = root.object()
                {
                    return Err(Error::Format(format!("root node already belongs to {owner}")));
                }
            }
        }
        for l in &self.labels {
            check_index("label parent", l.parent, nl, true)?;
        }
        check_acyclic("node", &self.nodes.iter().map(|n| n.parent).collect::<Vec<_>>())?;
        check_acyclic("object", &self.objects.iter().map(|o| o.parent).collect::<Vec<_>>())?;
        check_acyclic("label", &self.labels.iter().map(|l| l.parent).collect::<Vec<_>>())?;
        for f in &self.features {
            FeatureKind::from_code(f.kind, None)?;
        }
        for r in &self.object_relationships {
            r.members.iter().try_for_each(|&m| check_index("relationship object", m, no, false))?;
        }
        for r in &self.label_relationships {
            r.members.iter().try_for_each(|&m| check_index("relationship label", m, nl, false))?;
        }
        for a in &self.assignments {
            check_index("assignment object", a.object, no, false)?;
            check_index("assignment label", a.label, nl, false)?;
        }
        let mut scan_nodes = Claims::new("scan node");
        for s in &self.scans {
            check_index("scan node", s.node, nn, true)?;
            if s.node < 0 {
                continue;
            }
            scan_nodes.claim(s.node)?;
            if s.node == 0
                && let Some(other) = root.scan()
            {
                return Err(Error::Format(format!("root node is already linked to {other}")));
            }
        }
        for i in &self.images {
            check_index("image scan", i.scan, ns, true)?;
        }
        for p in &self.object_properties {
            p.members.iter().try_for_each(|&m| check_index("property object", m, no, false))?;
        }
        for p in &self.label_properties {
            p.members.iter().try_for_each(|&m| check_index("property label", m, nl, false))?;
        }
        Ok(())
    }

    /// Build the records' entities into `scene`.
    ///
    /// Record 0 of nodes, objects and labels updates the scene's roots;
    /// everything else is added. Referenced kinds are created before the
    /// kinds that point at them.
    ///
    /// Records that fail validation leave `scene` untouched.
    pub fn apply(self, scene: &mut SurfelScene) -> Result<()> {
        let db_blocks = scene.database().block_ids();
        self.validate(scene, &db_blocks)?;

        if self.name.is_some() {
            scene.name = self.name;
        }
        scene.transformation = matrix_from_rows(&self.transformation);
        for comment in self.comments {
            scene.insert_comment(comment);
        }

        for f in &self.features {
            let kind = FeatureKind::from_code(f.kind, f.filename.clone())?;
            scene.features.insert(SurfelFeature {
                name: f.name.clone(),
                minimum: f.minimum,
                maximum: f.maximum,
                weight: f.weight,
                kind,
            });
        }
        let width = scene.features.len();

        // Nodes
        let root = scene.tree.root();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if i == 0 {
                if n.name.is_some() {
                    scene.tree.set_node_name(root, n.name.clone())?;
                }
                nodes.push(root);
            } else {
                let node = match &n.name {
                    Some(name) => SurfelNode::named(name.clone()),
                    None => SurfelNode::new(),
                };
                nodes.push(scene.tree.insert_detached(node));
            }
        }
        for (i, n) in self.nodes.iter().enumerate() {
            if i > 0 && n.parent >= 0 {
                scene.tree.set_parent(nodes[i], nodes[n.parent as usize])?;
            }
            for &b in &n.blocks {
                scene.tree.insert_block(nodes[i], db_blocks[b as usize])?;
            }
        }

        // Objects
        let root_object = scene.root_object;
        let mut objects = Vec::with_capacity(self.objects.len());
        for (i, o) in self.objects.iter().enumerate() {
            let mut values = o.values.clone();
            values.resize(width, 0.0);
            if i == 0 {
                let root = scene.objects.try_get_mut(root_object)?;
                if o.name.is_some() {
                    root.set_name(o.name.clone());
                }
                root.set_identifier(o.identifier);
                root.set_flags(o.flags);
                root.feature_vector = values;
                objects.push(root_object);
            } else {
                let mut object = SurfelObject::new().with_identifier(o.identifier).with_flags(o.flags);
                object.set_name(o.name.clone());
                object.feature_vector = values;
                objects.push(scene.insert_object_detached(object));
            }
        }
        for (i, o) in self.objects.iter().enumerate() {
            if i > 0 && o.parent >= 0 {
                scene.set_object_parent(objects[i], objects[o.parent as usize])?;
            }
            for &n in &o.nodes {
                scene.insert_object_node(objects[i], nodes[n as usize])?;
            }
        }

        // Labels
        let root_label = scene.root_label;
        let mut labels = Vec::with_capacity(self.labels.len());
        for (i, l) in self.labels.iter().enumerate() {
            if i == 0 {
                let root = scene.labels.try_get_mut(root_label)?;
                if l.name.is_some() {
                    root.set_name(l.name.clone());
                }
                root.set_identifier(l.identifier);
                root.set_keystroke(l.keystroke);
                root.set_color(l.color);
                root.set_flags(l.flags);
                labels.push(root_label);
            } else {
                let mut label = SurfelLabel::new()
                    .with_identifier(l.identifier)
                    .with_keystroke(l.keystroke)
                    .with_color(l.color)
                    .with_flags(l.flags);
                label.set_name(l.name.clone());
                labels.push(scene.insert_label_detached(label));
            }
        }
        for (i, l) in self.labels.iter().enumerate() {
            if i > 0 && l.parent >= 0 {
                scene.set_label_parent(labels[i], labels[l.parent as usize])?;
            }
        }

        // Edges
        for r in &self.object_relationships {
            let members = r.members.iter().map(|&m| objects[m as usize]);
            scene.insert_object_relationship(ObjectRelationship::new(r.kind, members, r.operands.iter().copied()))?;
        }
        for r in &self.label_relationships {
            let members = r.members.iter().map(|&m| labels[m as usize]);
            scene.insert_label_relationship(LabelRelationship::new(r.kind, members, r.operands.iter().copied()))?;
        }
        for a in &self.assignments {
            scene.insert_assignment(Assignment::new(
                objects[a.object as usize],
                labels[a.label as usize],
                a.confidence,
                Originator::from_code(a.originator),
            ))?;
        }

        // Cameras
        let mut scans = Vec::with_capacity(self.scans.len());
        for s in &self.scans {
            let id = scene.insert_scan(SurfelScan {
                name: s.name.clone(),
                camera: s.camera,
                timestamp: s.timestamp,
                intrinsics: s.intrinsics.normalized(),
                flags: s.flags,
                ..SurfelScan::default()
            });
            if s.node >= 0 {
                scene.set_scan_node(id, Some(nodes[s.node as usize]))?;
            }
            scans.push(id);
        }
        for i in &self.images {
            let mut image = SurfelImage::new("", i.camera, i.intrinsics.normalized())
                .with_timestamp(i.timestamp)
                .with_distortion(i.distortion);
            image.name = i.name.clone();
            image.flags = i.flags;
            image.rolling_shutter = i.rolling_shutter;
            let id = scene.insert_image(image);
            if i.scan >= 0 {
                scene.set_image_scan(id, Some(scans[i.scan as usize]))?;
            }
        }

        // Properties
        for p in &self.object_properties {
            for &m in &p.members {
                scene.insert_object_property(ObjectProperty::new(p.kind, objects[m as usize], p.operands.iter().copied()))?;
            }
        }
        for p in &self.label_properties {
            for &m in &p.members {
                scene.insert_label_property(LabelProperty::new(p.kind, labels[m as usize], p.operands.iter().copied()))?;
            }
        }

        scene.dirty = true;
        Ok(())
    }
}

/// A scene touching every entity kind, shared by the format tests.
#[cfg(test)]
pub(crate) fn sample_scene() -> SurfelScene {
    use crate::model::Surfel;
    use crate::storage::SurfelBlock;
    use glam::{DVec2, DVec3, Vec3};

    let mut scene = SurfelScene::new();
    scene.set_name(Some("test site".into()));
    scene.set_transformation(DMat4::from_translation(DVec3::new(10.0, -2.5, 0.125)));
    scene.insert_comment("first comment\twith tab");
    scene.insert_comment("second");

    let pin = scene
        .database()
        .insert_block(SurfelBlock::new(DVec3::new(1.0, 1.0, 0.0), vec![Surfel::new(Vec3::new(0.5, 0.25, 1.0)); 3]))
        .unwrap();
    let root_node = scene.tree().root();
    let scan_node = scene.tree_mut().insert_node(SurfelNode::named("scan 0"), root_node).unwrap();
    let leaf = scene.tree_mut().insert_node(SurfelNode::new(), scan_node).unwrap();
    scene.tree_mut().insert_block(leaf, pin.id()).unwrap();
    pin.release().unwrap();

    let height = scene.insert_feature(SurfelFeature::new("height", 0.0, 30.0));
    scene.insert_feature(
        SurfelFeature::new("ndsm", -5.0, 5.0)
            .with_weight(0.5)
            .with_kind(FeatureKind::OverheadGrid { filename: Some("grid.grd".into()) }),
    );

    let root_object = scene.root_object();
    let building = scene.insert_object(SurfelObject::named("building").with_identifier(12), root_object).unwrap();
    let window = scene.insert_object(SurfelObject::named("window").with_flags(3), building).unwrap();
    scene.insert_object_node(window, leaf).unwrap();
    scene.set_feature_value(building, height, 21.5).unwrap();

    let root_label = scene.root_label();
    let structure = scene
        .insert_label(
            SurfelLabel::named("structure").with_identifier(1).with_keystroke('s' as i32).with_color(Rgb::new(1.0, 0.5, 0.25)),
            root_label,
        )
        .unwrap();
    let glass = scene.insert_label(SurfelLabel::named("glass"), structure).unwrap();

    scene.insert_assignment(Assignment::new(building, structure, 1.0, Originator::GroundTruth)).unwrap();
    scene.insert_assignment(Assignment::new(window, glass, 0.75, Originator::Machine)).unwrap();
    scene.insert_object_relationship(ObjectRelationship::new(1, [building, window], [0.3])).unwrap();
    scene.insert_label_relationship(LabelRelationship::new(2, [glass, structure], [1.0, 2.0])).unwrap();
    scene.insert_object_property(ObjectProperty::new(4, building, [1.0, 2.0, 3.0, 4.0, 5.0])).unwrap();
    scene.insert_label_property(LabelProperty::new(5, glass, [0.125])).unwrap();

    let camera = Camera::new(DVec3::new(0.0, -10.0, 2.0), DVec3::Y, DVec3::Z);
    let scan = scene.insert_scan(
        SurfelScan::new("scan 0", camera, 1234.5).with_intrinsics(Intrinsics::new(640, 480, 500.0).with_yfocal(510.0)),
    );
    scene.set_scan_node(scan, Some(scan_node)).unwrap();
    let image = scene.insert_image(
        SurfelImage::new("cam0", camera, Intrinsics::new(320, 240, 300.0).with_center(DVec2::new(150.0, 110.0)))
            .with_timestamp(1234.25)
            .with_distortion(Distortion::Perspective { radial: [0.1, -0.01, 0.001], tangential: [0.002, -0.003] })
            .with_rolling_shutter(RollingShutter {
                cameras: [camera, Camera::new(DVec3::new(0.5, -10.0, 2.0), DVec3::Y, DVec3::Z)],
                timestamps: [1234.0, 1234.5],
            }),
    );
    scene.set_image_scan(image, Some(scan)).unwrap();
    scene.insert_image(SurfelImage::new("loose", Camera::default(), Intrinsics::new(8, 8, 4.0)));
    scene
}

/// Compare two scenes through their record images, ignoring node
/// aggregates that depend on the database rather than the graph.
#[cfg(test)]
pub(crate) fn assert_same_graph(a: &SurfelScene, b: &SurfelScene) {
    let mut ra = SceneRecords::from_scene(a).unwrap();
    let mut rb = SceneRecords::from_scene(b).unwrap();
    for r in [&mut ra, &mut rb] {
        for n in &mut r.nodes {
            n.complexity = 0.0;
            n.resolution = 0.0;
        }
    }
    pretty_assertions::assert_eq!(ra, rb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Records of the sample scene with block references dropped, so they
    /// apply to a scene over an empty database.
    fn blockless_records() -> SceneRecords {
        let mut records = SceneRecords::from_scene(&sample_scene()).unwrap();
        for n in &mut records.nodes {
            n.blocks.clear();
        }
        records
    }

    fn assert_rejected(records: SceneRecords) {
        let mut scene = SurfelScene::new();
        assert!(matches!(records.apply(&mut scene), Err(Error::Format(_))));
        assert_eq!(scene.tree().node_count(), 1);
        assert_eq!(scene.object_count(), 1);
        assert_eq!(scene.label_count(), 1);
        assert_eq!(scene.feature_count(), 0);
    }

    #[test]
    fn test_blockless_records_apply() {
        let mut scene = SurfelScene::new();
        blockless_records().apply(&mut scene).unwrap();
        assert_eq!(scene.tree().node_count(), 3);
    }

    #[test]
    fn test_records_reapplied_to_their_own_scene_are_rejected() {
        let mut scene = sample_scene();
        let records = SceneRecords::from_scene(&scene).unwrap();
        let before = SceneRecords::from_scene(&scene).unwrap();
        assert!(matches!(records.apply(&mut scene), Err(Error::Format(_))));
        assert_eq!(SceneRecords::from_scene(&scene).unwrap(), before);
    }

    #[test]
    fn test_node_parent_cycle_is_rejected() {
        let mut records = blockless_records();
        records.nodes[1].parent = 2;
        records.nodes[2].parent = 1;
        assert_rejected(records);
    }

    #[test]
    fn test_self_parented_label_is_rejected() {
        let mut records = blockless_records();
        records.labels[2].parent = 2;
        assert_rejected(records);
    }

    #[test]
    fn test_node_claimed_by_two_objects_is_rejected() {
        let mut records = blockless_records();
        records.objects[1].nodes = vec![2];
        records.objects[2].nodes = vec![2];
        assert_rejected(records);
    }

    #[test]
    fn test_block_claimed_by_two_nodes_is_rejected() {
        let mut scene = SurfelScene::new();
        let pin = scene
            .database()
            .insert_block(crate::storage::SurfelBlock::new(glam::DVec3::ZERO, vec![crate::model::Surfel::default()]))
            .unwrap();
        pin.release().unwrap();
        let mut records = blockless_records();
        records.nodes[1].blocks = vec![0];
        records.nodes[2].blocks = vec![0];
        assert!(matches!(records.apply(&mut scene), Err(Error::Format(_))));
        assert_eq!(scene.tree().node_count(), 1);
        assert_eq!(scene.database().block_info(scene.database().block_ids()[0]).unwrap().node, None);
    }
}
