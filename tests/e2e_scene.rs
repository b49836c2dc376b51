//! End-to-end tests for the scene graph.
//!
//! Each test builds a scene over a block database and exercises the graph
//! operations that keep objects, labels, nodes, scans and images linked:
//! cascading removal, merging, scene import, culling and the file lifecycle.

use std::path::Path;

use glam::{DMat4, DVec3, Vec3};
use pretty_assertions::assert_eq;
use surfels_rs::constraint::FnConstraint;
use surfels_rs::{
    AccessMode, Assignment, Camera, Intrinsics, LabelId, NodeId, ObjectId, Originator, PointQuery, Surfel,
    SurfelBlock, SurfelFeature, SurfelImage, SurfelLabel, SurfelNode, SurfelObject, SurfelScan, SurfelScene,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Add a leaf node holding one block of `n` surfels along x at `origin`.
fn seed_node(scene: &mut SurfelScene, name: &str, origin: DVec3, n: usize) -> NodeId {
    let surfels = (0..n).map(|i| Surfel::new(Vec3::new(i as f32, 0.0, 0.0))).collect();
    let pin = scene.database().insert_block(SurfelBlock::new(origin, surfels)).unwrap();
    let root = scene.tree().root();
    let node = scene.tree_mut().insert_node(SurfelNode::named(name), root).unwrap();
    scene.tree_mut().insert_block(node, pin.id()).unwrap();
    pin.release().unwrap();
    node
}

struct Seeded {
    car: ObjectId,
    vehicle: LabelId,
    node: NodeId,
}

/// A small street scene: one car over eight surfels, labeled and scanned.
fn seed_scene(scene: &mut SurfelScene) -> Seeded {
    let node = seed_node(scene, "scan0", DVec3::new(10.0, 0.0, 0.0), 8);
    let length = scene.insert_feature(SurfelFeature::new("length", 0.0, 10.0));
    let root_object = scene.root_object();
    let car = scene.insert_object(SurfelObject::named("car").with_identifier(7), root_object).unwrap();
    scene.insert_object_node(car, node).unwrap();
    scene.set_feature_value(car, length, 4.2).unwrap();

    let root_label = scene.root_label();
    let vehicle = scene.insert_label(SurfelLabel::named("vehicle").with_keystroke('v' as i32), root_label).unwrap();
    scene.insert_assignment(Assignment::new(car, vehicle, 1.0, Originator::GroundTruth)).unwrap();

    let camera = Camera::new(DVec3::new(13.5, 0.0, 20.0), DVec3::NEG_Z, DVec3::Y);
    let scan = scene.insert_scan(SurfelScan::new("scan0", camera, 100.0));
    scene.set_scan_node(scan, Some(node)).unwrap();
    let image = scene.insert_image(SurfelImage::new("top", camera, Intrinsics::new(200, 200, 100.0)));
    scene.set_image_scan(image, Some(scan)).unwrap();
    scene.insert_comment("seeded");
    Seeded { car, vehicle, node }
}

fn scene_paths(dir: &Path, ext: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    (dir.join(format!("site.{ext}")), dir.join("site.ssb"))
}

// ============================================================================
// 1. Removing an object cleans up its assignments
// ============================================================================

#[test]
fn test_remove_object_drops_assignment_keeps_label() {
    init_tracing();
    let mut scene = SurfelScene::new();
    let (root_object, root_label) = (scene.root_object(), scene.root_label());
    let a = scene.insert_object(SurfelObject::named("A"), root_object).unwrap();
    let l = scene.insert_label(SurfelLabel::named("L"), root_label).unwrap();
    let other = scene.insert_object(SurfelObject::named("B"), root_object).unwrap();
    scene.insert_assignment(Assignment::new(a, l, 0.8, Originator::Human)).unwrap();
    let kept = scene.insert_assignment(Assignment::new(other, l, 0.4, Originator::Machine)).unwrap();

    scene.remove_object(a).unwrap();

    assert_eq!(scene.assignment_count(), 1);
    assert_eq!(scene.label(l).unwrap().assignments(), &[kept]);
    assert_eq!(scene.label(l).unwrap().name(), Some("L"));
    assert_eq!(scene.object(root_object).unwrap().parts(), &[other]);
    assert_eq!(scene.find_object_by_name("A"), None);
    assert_eq!(scene.object_index(other), Some(1));
}

// ============================================================================
// 2. Merging objects
// ============================================================================

#[test]
fn test_merge_objects_moves_nodes_and_labels() {
    let mut scene = SurfelScene::new();
    let seeded = seed_scene(&mut scene);
    let extra = seed_node(&mut scene, "extra", DVec3::ZERO, 3);
    let root_object = scene.root_object();
    let wheel = scene.insert_object(SurfelObject::named("wheel"), root_object).unwrap();
    scene.insert_object_node(wheel, extra).unwrap();
    let human = scene.insert_assignment(Assignment::new(wheel, seeded.vehicle, 0.9, Originator::Human)).unwrap();

    scene.merge_object(seeded.car, wheel).unwrap();

    assert!(scene.object(wheel).is_err());
    let car = scene.object(seeded.car).unwrap();
    assert_eq!(car.nodes(), &[seeded.node, extra]);
    assert!(car.assignments().contains(&human));
    assert_eq!(scene.tree().node(extra).unwrap().object(), Some(seeded.car));
    assert_eq!(scene.object_complexity(seeded.car).unwrap(), 11);
    assert_eq!(scene.human_label(seeded.car).unwrap(), Some(seeded.vehicle));
}

// ============================================================================
// 3. Importing one scene into another
// ============================================================================

#[test]
fn test_insert_scene_under_new_parent() {
    init_tracing();
    let mut source = SurfelScene::new();
    seed_scene(&mut source);

    let mut target = SurfelScene::new();
    let mine = seed_scene(&mut target);
    let root_object = target.root_object();
    let imported = target.insert_object(SurfelObject::named("imported"), root_object).unwrap();
    let (root_label, root_node) = (target.root_label(), target.tree().root());

    target.insert_scene(&source, imported, root_label, root_node).unwrap();

    assert_eq!(target.database().surfel_count(), 16);
    assert_eq!(target.feature_count(), 1);
    assert_eq!(target.comments(), &["seeded".to_string()]);
    assert_eq!(target.scan_count(), 2);
    assert_eq!(target.image_count(), 2);

    let copied = target
        .objects()
        .find(|(id, o)| o.name() == Some("car") && *id != mine.car)
        .map(|(id, _)| id)
        .unwrap();
    assert_eq!(target.object(copied).unwrap().parent(), Some(imported));
    assert_eq!(target.object(copied).unwrap().feature_vector(), &[4.2]);
    assert_eq!(target.object_complexity(imported).unwrap(), 8);
    assert_eq!(target.label_count(), 3);
}

// ============================================================================
// 4. Culling and transforming surfels
// ============================================================================

#[test]
fn test_cull_surfels_releases_emptied_nodes() {
    let mut scene = SurfelScene::new();
    let seeded = seed_scene(&mut scene);
    let doomed = seed_node(&mut scene, "doomed", DVec3::new(-50.0, 0.0, 0.0), 4);
    let root_object = scene.root_object();
    let ghost = scene.insert_object(SurfelObject::named("ghost"), root_object).unwrap();
    scene.insert_object_node(ghost, doomed).unwrap();

    let keep_east = FnConstraint(|p: DVec3, _: &Surfel| p.x >= 0.0);
    assert_eq!(scene.cull_surfels(&keep_east).unwrap(), 4);

    assert!(!scene.tree().contains_node(doomed));
    assert!(scene.object(ghost).unwrap().nodes().is_empty());
    assert_eq!(scene.object_complexity(seeded.car).unwrap(), 8);
    assert_eq!(scene.database().surfel_count(), 8);
}

#[test]
fn test_transform_bakes_into_blocks_and_cameras() {
    let mut scene = SurfelScene::new();
    let seeded = seed_scene(&mut scene);
    let shift = DMat4::from_translation(DVec3::new(0.0, 5.0, 0.0));
    scene.transform(&shift, false).unwrap();
    assert_eq!(scene.transformation(), shift);

    scene.transform(&DMat4::IDENTITY, true).unwrap();
    assert_eq!(scene.transformation(), DMat4::IDENTITY);

    let block = scene.tree().node(seeded.node).unwrap().blocks()[0];
    assert_eq!(scene.database().block_info(block).unwrap().origin, DVec3::new(10.0, 5.0, 0.0));
    let scan = scene.find_scan_by_name("scan0").unwrap();
    assert_eq!(scene.scan(scan).unwrap().camera.viewpoint, DVec3::new(13.5, 5.0, 20.0));

    let points = scene.object_point_set(seeded.car, &PointQuery::default()).unwrap();
    assert_eq!(points.len(), 8);
    assert_eq!(points.points()[3].position(), DVec3::new(13.0, 5.0, 0.0));
}

#[test]
fn test_best_view_sees_the_car() {
    let mut scene = SurfelScene::new();
    let seeded = seed_scene(&mut scene);
    let top = scene.find_image_by_name("top").unwrap();
    let centroid = scene.object_centroid(seeded.car).unwrap();
    assert_eq!(scene.find_image_by_best_view(centroid), Some(top));
    assert_eq!(scene.find_image_by_best_view(DVec3::new(0.0, 0.0, 40.0)), None);
}

// ============================================================================
// 5. File lifecycle
// ============================================================================

#[test]
fn test_binary_scene_survives_close_and_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (scene_path, db_path) = scene_paths(dir.path(), "ssx");

    let mut scene = SurfelScene::new();
    scene.open_file(&scene_path, Some(&db_path), AccessMode::Create).unwrap();
    seed_scene(&mut scene);
    scene.close_file().unwrap();
    assert!(scene.path().is_none());

    let mut reopened = SurfelScene::new();
    reopened.open_file(&scene_path, Some(&db_path), AccessMode::ReadOnly).unwrap();
    assert!(!reopened.is_dirty());
    assert_eq!(reopened.object_count(), 2);
    assert_eq!(reopened.label_count(), 2);
    assert_eq!(reopened.tree().node_count(), 2);

    let car = reopened.find_object_by_identifier(7).unwrap();
    let vehicle = reopened.find_label_by_keystroke('v' as i32).unwrap();
    assert_eq!(reopened.ground_truth_label(car).unwrap(), Some(vehicle));
    assert_eq!(reopened.object_complexity(car).unwrap(), 8);

    let node = reopened.object(car).unwrap().nodes()[0];
    let scan = reopened.find_scan_by_name("scan0").unwrap();
    assert_eq!(reopened.tree().scan_of(node, false).unwrap(), Some(scan));

    let points = reopened.object_point_set(car, &PointQuery::default()).unwrap();
    assert_eq!(points.len(), 8);
    assert_eq!(points.points()[0].position(), DVec3::new(10.0, 0.0, 0.0));
}

#[test]
fn test_ascii_scene_sync_after_update() {
    let dir = tempfile::tempdir().unwrap();
    let (scene_path, db_path) = scene_paths(dir.path(), "ssa");

    let mut scene = SurfelScene::new();
    scene.open_file(&scene_path, Some(&db_path), AccessMode::Create).unwrap();
    seed_scene(&mut scene);
    scene.close_file().unwrap();

    let mut update = SurfelScene::new();
    update.open_file(&scene_path, Some(&db_path), AccessMode::ReadWrite).unwrap();
    update.insert_comment("reviewed");
    assert!(update.is_dirty());
    update.sync_file().unwrap();
    assert!(!update.is_dirty());
    update.close_file().unwrap();

    let mut check = SurfelScene::new();
    check.open_file(&scene_path, Some(&db_path), AccessMode::ReadOnly).unwrap();
    assert_eq!(check.comments(), &["seeded".to_string(), "reviewed".to_string()]);
}

#[test]
fn test_read_only_scene_is_never_written() {
    let dir = tempfile::tempdir().unwrap();
    let (scene_path, db_path) = scene_paths(dir.path(), "ssx");

    let mut scene = SurfelScene::new();
    scene.open_file(&scene_path, Some(&db_path), AccessMode::Create).unwrap();
    seed_scene(&mut scene);
    scene.close_file().unwrap();
    let before = std::fs::read(&scene_path).unwrap();

    let mut ro = SurfelScene::new();
    ro.open_file(&scene_path, Some(&db_path), AccessMode::ReadOnly).unwrap();
    ro.insert_comment("not saved");
    ro.sync_file().unwrap();
    assert!(ro.is_dirty());
    ro.close_file().unwrap();

    assert_eq!(std::fs::read(&scene_path).unwrap(), before);
}

#[test]
fn test_open_rejects_unknown_extension_and_double_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut scene = SurfelScene::new();
    assert!(scene.open_file(dir.path().join("site.obj"), None::<&Path>, AccessMode::Create).is_err());

    scene.open_file(dir.path().join("site.ssx"), None::<&Path>, AccessMode::Create).unwrap();
    assert!(scene.open_file(dir.path().join("other.ssx"), None::<&Path>, AccessMode::Create).is_err());
}
