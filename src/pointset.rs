//! Flat collections of surfels pulled out of the tree.
//!
//! A [`SurfelPointSet`] copies records together with the block metadata
//! needed to place them in the world, so it stays valid after the pins used
//! to build it are released.

use glam::DVec3;

use crate::constraint::SurfelConstraint;
use crate::model::{BBox, BlockId, Surfel};
use crate::storage::BlockPin;
use crate::Result;

/// One surfel and where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfelPoint {
    pub block: BlockId,
    pub index: usize,
    pub origin: DVec3,
    pub timestamp_origin: f64,
    pub surfel: Surfel,
}

impl SurfelPoint {
    pub fn position(&self) -> DVec3 {
        self.origin + self.surfel.position().as_dvec3()
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp_origin + self.surfel.timestamp as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurfelPointSet {
    points: Vec<SurfelPoint>,
}

impl SurfelPointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SurfelPoint] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SurfelPoint> {
        self.points.iter()
    }

    pub fn push(&mut self, point: SurfelPoint) {
        self.points.push(point);
    }

    /// Append the records of a pinned block that pass `constraint`.
    ///
    /// When `max_resolution` is positive and the block is denser than that,
    /// records are taken at a regular stride to approximate the cap.
    pub fn insert_block_points(
        &mut self,
        pin: &BlockPin,
        max_resolution: f64,
        constraint: Option<&dyn SurfelConstraint>,
    ) -> Result<usize> {
        let info = pin.info()?;
        if let Some(c) = constraint
            && !c.check_block(&info)
        {
            return Ok(0);
        }
        let n = info.surfel_count;
        let stride = if max_resolution > 0.0 && info.resolution > max_resolution && n > 0 {
            let target = ((n as f64 * max_resolution / info.resolution) as usize).max(1);
            (n / target).max(1)
        } else {
            1
        };
        let before = self.points.len();
        pin.with_surfels(|surfels| {
            for (index, surfel) in surfels.iter().enumerate().step_by(stride) {
                if let Some(c) = constraint
                    && !c.check_surfel(&info, surfel)
                {
                    continue;
                }
                self.points.push(SurfelPoint {
                    block: pin.id(),
                    index,
                    origin: info.origin,
                    timestamp_origin: info.timestamp_origin,
                    surfel: *surfel,
                });
            }
        })?;
        Ok(self.points.len() - before)
    }

    pub fn bbox(&self) -> BBox {
        let mut bbox = BBox::EMPTY;
        for p in &self.points {
            bbox.union_point(p.position());
        }
        bbox
    }

    /// Mean position, or the origin when empty.
    pub fn centroid(&self) -> DVec3 {
        if self.points.is_empty() {
            return DVec3::ZERO;
        }
        self.points.iter().map(SurfelPoint::position).sum::<DVec3>() / self.points.len() as f64
    }
}

impl<'a> IntoIterator for &'a SurfelPointSet {
    type Item = &'a SurfelPoint;
    type IntoIter = std::slice::Iter<'a, SurfelPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::FnConstraint;
    use crate::storage::{SurfelBlock, SurfelDatabase};
    use glam::Vec3;

    fn grid_block(n: usize) -> SurfelBlock {
        let surfels = (0..n)
            .map(|i| Surfel::new(Vec3::new((i % 10) as f32 * 0.1, (i / 10) as f32 * 0.1, 0.0)))
            .collect();
        SurfelBlock::new(DVec3::new(100.0, 0.0, 0.0), surfels)
    }

    #[test]
    fn test_points_are_world_space() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(grid_block(4)).unwrap();
        let mut set = SurfelPointSet::new();
        assert_eq!(set.insert_block_points(&pin, 0.0, None).unwrap(), 4);
        assert_eq!(set.points()[1].position(), DVec3::new(100.0 + 0.1f32 as f64, 0.0, 0.0));
        assert!(set.bbox().min.x >= 100.0);
    }

    #[test]
    fn test_constraint_filters_points() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(grid_block(20)).unwrap();
        let mut set = SurfelPointSet::new();
        let c = FnConstraint(|p: DVec3, _: &Surfel| p.y < 0.05);
        set.insert_block_points(&pin, 0.0, Some(&c)).unwrap();
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn test_resolution_cap_subsamples() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(grid_block(100)).unwrap();
        let resolution = pin.info().unwrap().resolution;
        assert!(resolution > 0.0);
        let mut set = SurfelPointSet::new();
        set.insert_block_points(&pin, resolution / 4.0, None).unwrap();
        assert_eq!(set.len(), 25);
    }
}
