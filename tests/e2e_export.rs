//! End-to-end export tests: `.arff` feature tables and `.tqn` hierarchies
//! written through `SurfelScene::write_file`.

use glam::{DVec3, Vec3};
use pretty_assertions::assert_eq;
use surfels_rs::{
    Assignment, Originator, Surfel, SurfelBlock, SurfelFeature, SurfelLabel, SurfelNode, SurfelObject, SurfelScene,
};

/// Two labelled parked cars and one unlabelled blob, each backed by a leaf.
fn seed_street() -> SurfelScene {
    let mut scene = SurfelScene::new();
    let root_node = scene.tree().root();
    let root_object = scene.root_object();
    let root_label = scene.root_label();
    let car = scene.insert_label(SurfelLabel::named("car"), root_label).unwrap();
    let length = scene.insert_feature(SurfelFeature::new("length", 0.0, 10.0));
    let height = scene.insert_feature(SurfelFeature::new("height", 0.0, 5.0));

    for (i, name) in ["car_a", "car_b", "blob"].into_iter().enumerate() {
        let x = 10.0 * i as f32;
        let surfels = vec![Surfel::new(Vec3::new(x, 0.0, 0.0)), Surfel::new(Vec3::new(x + 2.0, 4.0, 2.0))];
        let pin = scene.database().insert_block(SurfelBlock::new(DVec3::ZERO, surfels)).unwrap();
        let node = scene.tree_mut().insert_node(SurfelNode::named(name), root_node).unwrap();
        scene.tree_mut().insert_block(node, pin.id()).unwrap();
        pin.release().unwrap();

        let object = scene.insert_object(SurfelObject::named(name), root_object).unwrap();
        scene.insert_object_node(object, node).unwrap();
        scene.set_feature_value(object, length, 4.0 + i as f64).unwrap();
        scene.set_feature_value(object, height, 1.5).unwrap();
        if name != "blob" {
            scene.insert_assignment(Assignment::new(object, car, 1.0, Originator::Human)).unwrap();
        }
    }
    scene
}

// ============================================================================
// 1. ARFF
// ============================================================================

#[test]
fn test_arff_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("street.arff");
    let mut scene = seed_street();
    scene.write_file(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    assert_eq!(
        lines,
        [
            "@relation UGOR",
            "@attribute length real",
            "@attribute height real",
            "@attribute Label { Root , car }",
            "@data",
            "% car_a 1 2 1",
            "    4.000000     1.500000 car",
            "% car_b 11 2 1",
            "    5.000000     1.500000 car",
            "% blob 21 2 1",
            "    6.000000     1.500000 Unknown",
        ]
    );
    assert!(scene.is_dirty());
}

// ============================================================================
// 2. tqn
// ============================================================================

#[test]
fn test_tqn_file_skips_unlabelled_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("street.tqn");
    let mut scene = seed_street();
    scene.write_file(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    assert_eq!(&lines[..2], ["root 0", "scene_name street"]);
    assert!(!text.contains("blob"));
    // root plus two cars, popped last-first
    assert_eq!(lines.iter().filter(|l| l.starts_with("newModel")).count(), 3);
    assert_eq!(&lines[2..7], ["newModel 0", "parent -1", "children 2 1", "leaf_group 0 1", "label 0 Root"]);
    assert_eq!(&lines[7..12], ["newModel 1", "parent 0", "children", "leaf_group 0", "label 1 car"]);
}

#[test]
fn test_export_of_empty_scene() {
    let dir = tempfile::tempdir().unwrap();
    let mut scene = SurfelScene::new();
    scene.write_file(dir.path().join("empty.tqn")).unwrap();
    scene.write_file(dir.path().join("empty.arff")).unwrap();

    let tqn = std::fs::read_to_string(dir.path().join("empty.tqn")).unwrap();
    assert_eq!(tqn.lines().count(), 7);
    let arff = std::fs::read_to_string(dir.path().join("empty.arff")).unwrap();
    assert_eq!(arff.lines().last(), Some("@data"));
}
