//! End-to-end tests for the block database.
//!
//! Each test drives `SurfelDatabase` through its public API: inserting and
//! removing blocks, pinning and releasing them against a backing `.ssb`
//! file, and decoding legacy record layouts.

use glam::{DVec3, Vec3};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use surfels_rs::constraint::FnConstraint;
use surfels_rs::storage::codec_for;
use surfels_rs::{
    AccessMode, BlockPin, BlockSplit, Error, FormatVersion, StoreConfig, Surfel, SurfelBlock, SurfelCodec,
    SurfelDatabase, SurfelFlags, SurfelTree,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A block of `n` surfels along x, identifiers starting at 1.
fn seed_block(n: usize) -> SurfelBlock {
    let surfels = (0..n)
        .map(|i| {
            Surfel::new(Vec3::new(i as f32, 1.0, -1.0))
                .with_normal(Vec3::Z)
                .with_identifier(i as u32 + 1)
                .with_color([i as u8, 100, 200])
        })
        .collect();
    SurfelBlock::new(DVec3::new(100.0, 200.0, 0.0), surfels)
}

/// A file-backed database in a fresh temporary directory.
fn seed_file_database() -> (TempDir, SurfelDatabase) {
    let dir = tempfile::tempdir().unwrap();
    let db = SurfelDatabase::new();
    db.open_file(dir.path().join("blocks.ssb"), AccessMode::Create).unwrap();
    (dir, db)
}

// ============================================================================
// 1. Removal keeps counts and indices consistent
// ============================================================================

#[test]
fn test_remove_empty_block_then_reindex() {
    init_tracing();
    let db = SurfelDatabase::new();
    let ids: Vec<_> = [10, 0, 5]
        .into_iter()
        .map(|n| {
            let pin = db.insert_block(seed_block(n)).unwrap();
            let id = pin.id();
            pin.release().unwrap();
            id
        })
        .collect();
    assert_eq!(db.surfel_count(), 15);
    assert_eq!(db.block_index(ids[2]), Some(2));

    db.remove_block(ids[1]).unwrap();
    assert_eq!(db.surfel_count(), 15);
    assert_eq!(db.block_count(), 2);

    db.remove_block(ids[0]).unwrap();
    assert_eq!(db.surfel_count(), 5);
    assert_eq!(db.block_index(ids[2]), Some(0));
    assert_eq!(db.block_at(0), Some(ids[2]));
    assert!(!db.contains_block(ids[0]));
}

// ============================================================================
// 2. Residency follows the pin count
// ============================================================================

#[test]
fn test_double_pin_single_flush() {
    init_tracing();
    let (_dir, db) = seed_file_database();
    let pin = db.insert_block(seed_block(4)).unwrap();
    let id = pin.id();
    pin.release().unwrap();
    assert!(!db.is_resident(id).unwrap());

    let first = db.pin_block(id).unwrap();
    let second = db.pin_block(id).unwrap();
    first.with_surfels_mut(|s| s[0].position[0] = 9.0).unwrap();
    let writes_before = db.stats().block_writes;

    first.release().unwrap();
    assert!(db.is_resident(id).unwrap());
    assert_eq!(db.stats().block_writes, writes_before);

    second.release().unwrap();
    assert!(!db.is_resident(id).unwrap());
    assert_eq!(db.stats().block_writes, writes_before + 1);

    let again = db.pin_block(id).unwrap();
    assert_eq!(again.surfel(0).unwrap().unwrap().position[0], 9.0);
}

#[test]
fn test_memory_database_keeps_released_blocks() {
    let db = SurfelDatabase::new();
    let id = db.insert_block(seed_block(3)).unwrap().id();
    // dropped pin: nowhere to page out to
    assert!(db.is_resident(id).unwrap());
    assert_eq!(db.resident_surfel_count(), 3);
}

#[test]
fn test_evict_on_release_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig { evict_on_release: false, ..StoreConfig::default() };
    let db = SurfelDatabase::with_config(config);
    db.open_file(dir.path().join("warm.ssb"), AccessMode::Create).unwrap();
    let id = db.insert_block(seed_block(3)).unwrap().id();
    assert!(db.is_resident(id).unwrap());
    assert_eq!(db.stats().evictions, 0);
}

// ============================================================================
// 3. Backing files survive close and reopen
// ============================================================================

#[test]
fn test_file_round_trip_pages_blocks_back_in() {
    init_tracing();
    let (dir, db) = seed_file_database();
    let original = seed_block(6);
    let expected = original.surfels().unwrap().to_vec();
    db.insert_block(original).unwrap().release().unwrap();
    db.insert_block(seed_block(2)).unwrap().release().unwrap();
    db.close_file().unwrap();

    let reopened = SurfelDatabase::new();
    reopened.open_file(dir.path().join("blocks.ssb"), AccessMode::ReadWrite).unwrap();
    assert_eq!(reopened.block_count(), 2);
    assert_eq!(reopened.surfel_count(), 8);
    assert_eq!(reopened.version(), FormatVersion::CURRENT);

    let first = reopened.block_at(0).unwrap();
    assert!(!reopened.is_resident(first).unwrap());
    let info = reopened.block_info(first).unwrap();
    assert_eq!(info.origin, DVec3::new(100.0, 200.0, 0.0));
    assert_eq!(info.identifier_range, (1, 6));

    let pin = reopened.pin_block(first).unwrap();
    assert_eq!(pin.to_vec().unwrap(), expected);
    assert_eq!(reopened.stats().block_reads, 1);
}

#[test]
fn test_read_only_rejects_write_back() {
    let (dir, db) = seed_file_database();
    db.insert_block(seed_block(3)).unwrap().release().unwrap();
    db.close_file().unwrap();

    let ro = SurfelDatabase::new();
    ro.open_file(dir.path().join("blocks.ssb"), AccessMode::ReadOnly).unwrap();
    let pin = ro.pin_block(ro.block_at(0).unwrap()).unwrap();
    pin.with_surfels_mut(|s| s[0].color = [0, 0, 0]).unwrap();
    assert!(matches!(pin.release(), Err(Error::ReadOnly(_))));
}

#[test]
fn test_create_refuses_to_drop_paged_out_blocks() {
    let (dir, db) = seed_file_database();
    db.insert_block(seed_block(3)).unwrap().release().unwrap();
    db.close_file().unwrap();
    // the block is paged out and belongs to the closed file
    let err = db.open_file(dir.path().join("other.ssb"), AccessMode::Create).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn test_self_contained_file_image() {
    let dir = tempfile::tempdir().unwrap();
    let db = SurfelDatabase::new();
    db.insert_block(seed_block(5)).unwrap().release().unwrap();
    let path = dir.path().join("image.ssb");
    db.write_file(&path).unwrap();

    let copy = SurfelDatabase::new();
    copy.read_file(&path).unwrap();
    assert_eq!(copy.surfel_count(), 5);
    let id = copy.block_at(0).unwrap();
    assert!(copy.is_resident(id).unwrap());
    assert_eq!(copy.pin_block(id).unwrap().to_vec().unwrap(), seed_block(5).surfels().unwrap());

    assert!(matches!(copy.write_file(dir.path().join("image.txt")), Err(Error::Format(_))));
}

/// Write `n` surfels to `blocks.ssb`, close it, and reopen it read-only.
fn seed_read_only_database(n: usize) -> (TempDir, SurfelDatabase) {
    let (dir, db) = seed_file_database();
    db.insert_block(seed_block(n)).unwrap().release().unwrap();
    db.close_file().unwrap();
    let db = SurfelDatabase::new();
    db.open_file(dir.path().join("blocks.ssb"), AccessMode::ReadOnly).unwrap();
    (dir, db)
}

#[test]
fn test_read_only_split_keeps_everything() {
    init_tracing();
    let (_dir, db) = seed_read_only_database(6);
    let id = db.block_at(0).unwrap();
    assert!(matches!(db.split_block(id, |s| s.position[0] < 3.0), Err(Error::ReadOnly(_))));
    assert!(db.contains_block(id));
    assert_eq!(db.block_count(), 1);

    let mut tree = SurfelTree::new(db.clone());
    let leaf = tree.root();
    tree.insert_block(leaf, id).unwrap();
    let halves = FnConstraint(|p: DVec3, _: &Surfel| p.x < 103.0);
    assert!(matches!(tree.split_leaf_node(leaf, &halves), Err(Error::ReadOnly(_))));
    assert_eq!(tree.node(leaf).unwrap().blocks(), &[id]);
    assert!(tree.node(leaf).unwrap().parts().is_empty());
    assert!(matches!(tree.cull(&halves), Err(Error::ReadOnly(_))));
    assert_eq!(tree.node(leaf).unwrap().blocks(), &[id]);

    assert!(db.contains_block(id));
    assert_eq!(db.block_count(), 1);
    assert_eq!(db.surfel_count(), 6);
    assert_eq!(db.pin_block(id).unwrap().to_vec().unwrap(), seed_block(6).surfels().unwrap());
}

#[test]
fn test_split_of_pinned_block_counts_surfels_once() {
    let db = SurfelDatabase::new();
    let holder = db.insert_block(seed_block(10)).unwrap();
    let split = db.split_block(holder.id(), |s| s.position[0] < 4.0).unwrap();
    assert!(matches!(split, BlockSplit::Split { .. }));
    // the parent lingers until `holder` lets go but no longer counts
    assert!(db.contains_block(holder.id()));
    assert_eq!(db.surfel_count(), 10);
    assert_eq!(db.block_count(), 3);

    let mut image = std::io::Cursor::new(Vec::new());
    db.write_stream(&mut image).unwrap();
    let copy = SurfelDatabase::new();
    image.set_position(0);
    copy.read_stream(&mut image).unwrap();
    assert_eq!(copy.block_count(), 2);
    assert_eq!(copy.surfel_count(), 10);

    holder.release().unwrap();
    assert_eq!(db.block_count(), 2);
    assert_eq!(db.surfel_count(), 10);
}

/// Close a one-block file and hand back its path and raw bytes.
fn seed_file_bytes() -> (TempDir, std::path::PathBuf, Vec<u8>) {
    let (dir, db) = seed_file_database();
    db.insert_block(seed_block(4)).unwrap().release().unwrap();
    db.close_file().unwrap();
    let path = dir.path().join("blocks.ssb");
    let bytes = std::fs::read(&path).unwrap();
    (dir, path, bytes)
}

#[test]
fn test_corrupt_block_count_is_a_format_error() {
    let (_dir, path, mut bytes) = seed_file_bytes();
    bytes[60..64].copy_from_slice(&u32::MAX.to_ne_bytes());
    std::fs::write(&path, &bytes).unwrap();

    let db = SurfelDatabase::new();
    assert!(matches!(db.open_file(&path, AccessMode::ReadOnly), Err(Error::Format(_))));
    assert_eq!(db.block_count(), 0);
    assert_eq!(db.surfel_count(), 0);
}

#[test]
fn test_directory_entry_overrunning_its_region_is_a_format_error() {
    let (_dir, path, mut bytes) = seed_file_bytes();
    let directory = u64::from_ne_bytes(bytes[48..56].try_into().unwrap()) as usize;
    // surfel count of the first entry, past its capacity of 4
    bytes[directory + 12..directory + 16].copy_from_slice(&5i32.to_ne_bytes());
    std::fs::write(&path, &bytes).unwrap();

    let db = SurfelDatabase::new();
    assert!(matches!(db.open_file(&path, AccessMode::ReadOnly), Err(Error::Format(_))));
    assert_eq!(db.block_count(), 0);
}

// ============================================================================
// 4. Legacy layouts decode to the current record
// ============================================================================

fn push_f32s(out: &mut Vec<u8>, values: &[f32]) {
    values.iter().for_each(|v| out.extend_from_slice(&v.to_ne_bytes()));
}

fn push_i16s(out: &mut Vec<u8>, values: &[i16]) {
    values.iter().for_each(|v| out.extend_from_slice(&v.to_ne_bytes()));
}

#[test]
fn test_v3_record_decode() {
    let mut bytes = Vec::new();
    push_f32s(&mut bytes, &[1.0, 2.0, 3.0]);
    push_i16s(&mut bytes, &[0, 0, 32767]);
    bytes.extend_from_slice(&800u16.to_ne_bytes());
    bytes.extend_from_slice(&[10, 20, 30, SurfelFlags::AERIAL.bits()]);
    assert_eq!(bytes.len(), 24);

    let expected = Surfel {
        position: [1.0, 2.0, 3.0],
        normal: [0, 0, 32767],
        radius: [800, 800],
        color: [10, 20, 30],
        flags: SurfelFlags::AERIAL,
        ..Surfel::default()
    };
    assert_eq!(codec_for(FormatVersion::new(3, 0)).decode(&bytes, false).unwrap(), expected);
}

fn oriented_prefix() -> Vec<u8> {
    let mut bytes = Vec::new();
    push_f32s(&mut bytes, &[-4.0, 0.5, 8.0, 12.25]);
    push_i16s(&mut bytes, &[32767, 0, 0, 0, 32767, 0]);
    bytes.extend_from_slice(&100u16.to_ne_bytes());
    bytes.extend_from_slice(&50u16.to_ne_bytes());
    bytes.extend_from_slice(&77u32.to_ne_bytes());
    bytes
}

fn oriented_expected() -> Surfel {
    Surfel {
        position: [-4.0, 0.5, 8.0],
        timestamp: 12.25,
        normal: [32767, 0, 0],
        tangent: [0, 32767, 0],
        radius: [100, 50],
        identifier: 77,
        color: [1, 2, 3],
        flags: SurfelFlags::ACTIVE,
        ..Surfel::default()
    }
}

#[test]
fn test_v4_record_decode() {
    let mut bytes = oriented_prefix();
    bytes.extend_from_slice(&[1, 2, 3, SurfelFlags::ACTIVE.bits()]);
    assert_eq!(bytes.len(), 40);
    assert_eq!(codec_for(FormatVersion::new(4, 0)).decode(&bytes, false).unwrap(), oriented_expected());
}

#[test]
fn test_v5_record_decode_unpacks_elevation() {
    let elevation = surfels_rs::model::surfel::encode_elevation(-2.5);
    let mut packed = oriented_prefix();
    packed.extend_from_slice(&(((elevation as u32) << 16) | 0x42).to_ne_bytes());
    packed.extend_from_slice(&[1, 2, 3, SurfelFlags::ACTIVE.bits()]);
    assert_eq!(packed.len(), 44);

    let decoded = codec_for(FormatVersion::new(5, 0)).decode(&packed, false).unwrap();
    assert_eq!(decoded, Surfel { elevation, attribute: 0x42, ..oriented_expected() });
    assert_eq!(decoded.elevation(), Some(-2.5));

    // without a packed elevation the attribute is taken whole
    let mut plain = oriented_prefix();
    plain.extend_from_slice(&0x42u32.to_ne_bytes());
    plain.extend_from_slice(&[1, 2, 3, SurfelFlags::ACTIVE.bits()]);
    let decoded = codec_for(FormatVersion::new(5, 0)).decode(&plain, false).unwrap();
    assert_eq!(decoded, Surfel { attribute: 0x42, ..oriented_expected() });
}

#[test]
fn test_legacy_file_version_is_kept_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.ssb");
    let config = StoreConfig { format_version: FormatVersion::new(4, 0), ..StoreConfig::default() };
    let db = SurfelDatabase::with_config(config);
    db.open_file(&path, AccessMode::Create).unwrap();
    db.insert_block(seed_block(4)).unwrap().release().unwrap();
    db.close_file().unwrap();

    let reopened = SurfelDatabase::new();
    reopened.open_file(&path, AccessMode::ReadOnly).unwrap();
    assert_eq!(reopened.version(), FormatVersion::new(4, 0));
    let pin = reopened.pin_block(reopened.block_at(0).unwrap()).unwrap();
    assert_eq!(pin.to_vec().unwrap(), seed_block(4).surfels().unwrap());
}

// ============================================================================
// 5. Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A block is resident exactly while pins on it are alive.
    #[test]
    fn prop_residency_tracks_pins(ops in prop::collection::vec(any::<bool>(), 1..40)) {
        let (_dir, db) = seed_file_database();
        let id = db.insert_block(seed_block(3)).unwrap().id();
        let mut pins: Vec<BlockPin> = Vec::new();
        for pin in ops {
            if pin {
                pins.push(db.pin_block(id).unwrap());
            } else if let Some(p) = pins.pop() {
                p.release().unwrap();
            }
            prop_assert_eq!(db.is_resident(id).unwrap(), !pins.is_empty());
            prop_assert_eq!(db.block_info(id).unwrap().pin_count as usize, pins.len());
        }
    }

    /// After any insert/remove sequence every live block's index is its
    /// position.
    #[test]
    fn prop_block_indices_stay_dense(ops in prop::collection::vec((any::<bool>(), 0usize..8), 1..60)) {
        let db = SurfelDatabase::new();
        let mut live = Vec::new();
        let mut surfels = 0i64;
        for (insert, n) in ops {
            if insert || live.is_empty() {
                live.push(db.insert_block(seed_block(n)).unwrap().id());
                surfels += n as i64;
            } else {
                let id = live.swap_remove(n % live.len());
                surfels -= db.remove_block(id).unwrap().surfel_count() as i64;
            }
            prop_assert_eq!(db.block_count(), live.len());
            prop_assert_eq!(db.surfel_count(), surfels);
            for (i, id) in db.block_ids().into_iter().enumerate() {
                prop_assert_eq!(db.block_index(id), Some(i));
                prop_assert!(live.contains(&id));
            }
        }
    }
}
