//! Surfel blocks: the unit of paging.

use bitflags::bitflags;
use glam::{DVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::model::{BBox, Interval, NodeId, Surfel};

bitflags! {
    /// Block state. The low byte caches surfel properties and is persisted
    /// in the directory; the high byte is database bookkeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BlockFlags: u32 {
        const BBOX_UPTODATE = 0x0001;
        const RESOLUTION_UPTODATE = 0x0002;
        const FLAGS_UPTODATE = 0x0004;
        const HAS_TANGENTS = 0x0008;
        const HAS_AERIAL = 0x0010;
        const HAS_TERRESTRIAL = 0x0020;
        const HAS_ACTIVE = 0x0040;
        const HAS_NORMALS = 0x0080;
        const DIRTY = 0x0100;
        const DELETE_PENDING = 0x0200;
        const MULTIRESOLUTION = 0x0400;

        const PROPERTY_MASK = 0x00FF;
        const DATABASE_MASK = 0xFF00;
    }
}

impl BlockFlags {
    /// Flags that only make sense while the block is in memory.
    pub(crate) const RUNTIME: BlockFlags = BlockFlags::DIRTY.union(BlockFlags::DELETE_PENDING);
}

/// A contiguous run of surfels sharing one origin.
///
/// The record count is fixed when the block is built. While the block lives
/// in a [`SurfelDatabase`](super::SurfelDatabase) its records are either
/// resident or on disk, and all mutation goes through a [`BlockPin`](super::BlockPin).
#[derive(Debug, Clone)]
pub struct SurfelBlock {
    pub(crate) origin: DVec3,
    pub(crate) timestamp_origin: f64,
    pub(crate) surfel_count: usize,
    pub(crate) surfels: Option<Vec<Surfel>>,
    pub(crate) bbox: BBox,
    pub(crate) resolution: f64,
    pub(crate) timestamp_range: Interval,
    pub(crate) elevation_range: Interval,
    pub(crate) identifier_range: (u32, u32),
    pub(crate) flags: BlockFlags,
    // database bookkeeping
    pub(crate) file_offset: u64,
    pub(crate) file_capacity: u32,
    pub(crate) pin_count: u32,
    pub(crate) node: Option<NodeId>,
}

impl SurfelBlock {
    /// Build a resident block from origin-relative records.
    pub fn new(origin: DVec3, surfels: Vec<Surfel>) -> Self {
        let mut block = Self::shell(origin, 0.0, surfels.len());
        block.surfels = Some(surfels);
        block.update_properties();
        block
    }

    /// Build a block from world-space positions; the origin is the centroid
    /// of the inputs and each record's position is rewritten relative to it.
    pub fn from_world(points: impl IntoIterator<Item = (DVec3, Surfel)>) -> Self {
        let points: Vec<(DVec3, Surfel)> = points.into_iter().collect();
        let origin = if points.is_empty() {
            DVec3::ZERO
        } else {
            points.iter().map(|(p, _)| *p).sum::<DVec3>() / points.len() as f64
        };
        let surfels = points
            .into_iter()
            .map(|(p, mut s)| {
                s.set_position((p - origin).as_vec3());
                s
            })
            .collect();
        Self::new(origin, surfels)
    }

    pub fn with_timestamp_origin(mut self, timestamp_origin: f64) -> Self {
        self.timestamp_origin = timestamp_origin;
        self.update_properties();
        self
    }

    pub fn with_multiresolution(mut self, on: bool) -> Self {
        self.flags.set(BlockFlags::MULTIRESOLUTION, on);
        self
    }

    /// Non-resident block carrying only metadata.
    pub(crate) fn shell(origin: DVec3, timestamp_origin: f64, surfel_count: usize) -> Self {
        Self {
            origin,
            timestamp_origin,
            surfel_count,
            surfels: None,
            bbox: BBox::EMPTY,
            resolution: 0.0,
            timestamp_range: Interval::EMPTY,
            elevation_range: Interval::EMPTY,
            identifier_range: (0, 0),
            flags: BlockFlags::empty(),
            file_offset: 0,
            file_capacity: 0,
            pin_count: 0,
            node: None,
        }
    }

    // --- accessors ---

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn timestamp_origin(&self) -> f64 {
        self.timestamp_origin
    }

    pub fn surfel_count(&self) -> usize {
        self.surfel_count
    }

    pub fn is_resident(&self) -> bool {
        self.surfels.is_some()
    }

    /// Resident records, origin-relative.
    pub fn surfels(&self) -> Option<&[Surfel]> {
        self.surfels.as_deref()
    }

    /// World-space position of record `i`.
    pub fn surfel_position(&self, i: usize) -> Option<DVec3> {
        let s = self.surfels.as_ref()?.get(i)?;
        Some(self.origin + s.position().as_dvec3())
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// Surfels per unit of XY footprint.
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Radius a surfel would need to tile the footprint at this resolution.
    pub fn average_radius(&self) -> f64 {
        if self.resolution <= 0.0 {
            return 0.0;
        }
        (1.0 / (self.resolution * std::f64::consts::PI)).sqrt()
    }

    pub fn timestamp_range(&self) -> Interval {
        self.timestamp_range
    }

    pub fn elevation_range(&self) -> Interval {
        self.elevation_range
    }

    /// `(min, max)` surfel identifier.
    pub fn identifier_range(&self) -> (u32, u32) {
        self.identifier_range
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BlockFlags::DIRTY)
    }

    pub fn is_delete_pending(&self) -> bool {
        self.flags.contains(BlockFlags::DELETE_PENDING)
    }

    pub fn is_multiresolution(&self) -> bool {
        self.flags.contains(BlockFlags::MULTIRESOLUTION)
    }

    pub fn has_normals(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_NORMALS)
    }

    pub fn has_tangents(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_TANGENTS)
    }

    pub fn has_aerial(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_AERIAL)
    }

    pub fn has_terrestrial(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_TERRESTRIAL)
    }

    pub fn has_active(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_ACTIVE)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            origin: self.origin,
            timestamp_origin: self.timestamp_origin,
            surfel_count: self.surfel_count,
            bbox: self.bbox,
            resolution: self.resolution,
            timestamp_range: self.timestamp_range,
            identifier_range: self.identifier_range,
            flags: self.flags,
            pin_count: self.pin_count,
            resident: self.is_resident(),
            node: self.node,
        }
    }

    /// Recompute cached aggregates from the resident records.
    pub(crate) fn update_properties(&mut self) {
        let Some(surfels) = self.surfels.as_ref() else {
            return;
        };
        let mut bbox = BBox::EMPTY;
        let mut timestamps = Interval::EMPTY;
        let mut elevations = Interval::EMPTY;
        let mut ids = (u32::MAX, 0u32);
        let mut flags = self.flags & BlockFlags::DATABASE_MASK;
        for s in surfels {
            bbox.union_point(self.origin + s.position().as_dvec3());
            timestamps.union_value(self.timestamp_origin + s.timestamp as f64);
            if let Some(e) = s.elevation() {
                elevations.union_value(e as f64);
            }
            ids.0 = ids.0.min(s.identifier);
            ids.1 = ids.1.max(s.identifier);
            if s.is_oriented() {
                flags |= BlockFlags::HAS_NORMALS;
            }
            if s.has_tangent() {
                flags |= BlockFlags::HAS_TANGENTS;
            }
            if s.is_active() {
                flags |= BlockFlags::HAS_ACTIVE;
            }
            if s.is_aerial() {
                flags |= BlockFlags::HAS_AERIAL;
            } else {
                flags |= BlockFlags::HAS_TERRESTRIAL;
            }
        }
        if surfels.is_empty() {
            ids = (0, 0);
        }
        let area = bbox.xy_area();
        self.resolution = if area > 0.0 { surfels.len() as f64 / area } else { 0.0 };
        self.bbox = bbox;
        self.timestamp_range = timestamps;
        self.elevation_range = elevations;
        self.identifier_range = ids;
        self.flags = flags
            | BlockFlags::BBOX_UPTODATE
            | BlockFlags::RESOLUTION_UPTODATE
            | BlockFlags::FLAGS_UPTODATE;
    }

    /// Apply an affine map to every record, moving the origin with it.
    pub(crate) fn transform(&mut self, m: &glam::DMat4) {
        let new_origin = m.transform_point3(self.origin);
        let linear = glam::DMat3::from_mat4(*m);
        let normal_map = linear.inverse().transpose();
        let origin = self.origin;
        if let Some(surfels) = self.surfels.as_mut() {
            for s in surfels.iter_mut() {
                let world = origin + s.position().as_dvec3();
                s.set_position((m.transform_point3(world) - new_origin).as_vec3());
                if s.is_oriented() {
                    let n = (normal_map * s.normal().as_dvec3()).normalize_or_zero();
                    s.set_normal(n.as_vec3());
                }
                if s.has_tangent() {
                    let t = (linear * s.tangent().as_dvec3()).normalize_or_zero();
                    s.set_tangent(t.as_vec3());
                }
            }
        }
        self.origin = new_origin;
        self.update_properties();
    }
}

/// Snapshot of a block's metadata, available without pinning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockInfo {
    pub origin: DVec3,
    pub timestamp_origin: f64,
    pub surfel_count: usize,
    pub bbox: BBox,
    pub resolution: f64,
    pub timestamp_range: Interval,
    pub identifier_range: (u32, u32),
    pub flags: BlockFlags,
    pub pin_count: u32,
    pub resident: bool,
    pub node: Option<NodeId>,
}

/// Translate a world position into a block-relative record position.
pub fn relative_position(origin: DVec3, world: DVec3) -> Vec3 {
    (world - origin).as_vec3()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurfelFlags;

    fn grid_block() -> SurfelBlock {
        let surfels = (0..4)
            .map(|i| {
                Surfel::new(Vec3::new((i % 2) as f32, (i / 2) as f32, 0.0))
                    .with_timestamp(i as f32)
                    .with_identifier(10 + i)
                    .with_flags(SurfelFlags::ACTIVE)
            })
            .collect();
        SurfelBlock::new(DVec3::new(100.0, 0.0, 5.0), surfels).with_timestamp_origin(1000.0)
    }

    #[test]
    fn test_aggregates() {
        let block = grid_block();
        assert_eq!(block.surfel_count(), 4);
        assert_eq!(block.bbox().min, DVec3::new(100.0, 0.0, 5.0));
        assert_eq!(block.bbox().max, DVec3::new(101.0, 1.0, 5.0));
        assert_eq!(block.resolution(), 4.0);
        assert_eq!(block.timestamp_range(), Interval::new(1000.0, 1003.0));
        assert_eq!(block.identifier_range(), (10, 13));
        assert!(block.has_active());
        assert!(block.has_terrestrial());
        assert!(!block.has_aerial());
        assert!(!block.has_normals());
    }

    #[test]
    fn test_average_radius() {
        let block = grid_block();
        let expected = (1.0 / (4.0 * std::f64::consts::PI)).sqrt();
        assert!((block.average_radius() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_from_world_uses_centroid_origin() {
        let block = SurfelBlock::from_world([
            (DVec3::new(10.0, 10.0, 0.0), Surfel::default()),
            (DVec3::new(12.0, 10.0, 0.0), Surfel::default()),
        ]);
        assert_eq!(block.origin(), DVec3::new(11.0, 10.0, 0.0));
        assert_eq!(block.surfel_position(1), Some(DVec3::new(12.0, 10.0, 0.0)));
    }

    #[test]
    fn test_transform_translates_origin_only() {
        let mut block = grid_block();
        let before = block.surfels().unwrap().to_vec();
        block.transform(&glam::DMat4::from_translation(DVec3::new(0.0, 0.0, 10.0)));
        assert_eq!(block.origin(), DVec3::new(100.0, 0.0, 15.0));
        assert_eq!(block.surfels().unwrap(), &before[..]);
        assert_eq!(block.bbox().min.z, 15.0);
    }
}
