//! Predicates used to prune and partition surfels.
//!
//! A constraint is consulted coarse-to-fine: node summaries and blocks are
//! tested first so whole subtrees can be skipped without paging records in,
//! then individual surfels.

use glam::DVec3;

use crate::model::{BBox, Interval, Surfel, SurfelFlags};
use crate::storage::BlockInfo;
use crate::tree::NodeSummary;

pub trait SurfelConstraint {
    /// `false` if nothing inside `bbox` can pass.
    fn check_bbox(&self, _bbox: &BBox) -> bool {
        true
    }

    fn check_node(&self, node: &NodeSummary) -> bool {
        self.check_bbox(&node.bbox)
    }

    fn check_block(&self, block: &BlockInfo) -> bool {
        self.check_bbox(&block.bbox)
    }

    fn check_surfel(&self, block: &BlockInfo, surfel: &Surfel) -> bool;
}

/// World-space position of a record in `block`.
#[inline]
pub fn world_position(block: &BlockInfo, surfel: &Surfel) -> DVec3 {
    block.origin + surfel.position().as_dvec3()
}

/// Keeps surfels inside an axis-aligned box.
#[derive(Debug, Clone, Copy)]
pub struct BoxConstraint {
    pub bbox: BBox,
}

impl BoxConstraint {
    pub fn new(bbox: BBox) -> Self {
        Self { bbox }
    }
}

impl SurfelConstraint for BoxConstraint {
    fn check_bbox(&self, bbox: &BBox) -> bool {
        self.bbox.intersects(bbox)
    }

    fn check_surfel(&self, block: &BlockInfo, surfel: &Surfel) -> bool {
        self.bbox.contains_point(world_position(block, surfel))
    }
}

/// Keeps surfels captured within a time window.
#[derive(Debug, Clone, Copy)]
pub struct TimestampConstraint {
    pub range: Interval,
}

impl SurfelConstraint for TimestampConstraint {
    fn check_node(&self, node: &NodeSummary) -> bool {
        node.timestamp_range.is_empty() || self.range.intersects(&node.timestamp_range)
    }

    fn check_block(&self, block: &BlockInfo) -> bool {
        block.timestamp_range.is_empty() || self.range.intersects(&block.timestamp_range)
    }

    fn check_surfel(&self, block: &BlockInfo, surfel: &Surfel) -> bool {
        self.range.contains(block.timestamp_origin + surfel.timestamp as f64)
    }
}

/// Requires some flags and forbids others.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagConstraint {
    pub required: SurfelFlags,
    pub forbidden: SurfelFlags,
}

impl SurfelConstraint for FlagConstraint {
    fn check_surfel(&self, _block: &BlockInfo, surfel: &Surfel) -> bool {
        surfel.flags.contains(self.required) && !surfel.flags.intersects(self.forbidden)
    }
}

/// Adapts a closure over world position and record.
pub struct FnConstraint<F>(pub F);

impl<F: Fn(DVec3, &Surfel) -> bool> SurfelConstraint for FnConstraint<F> {
    fn check_surfel(&self, block: &BlockInfo, surfel: &Surfel) -> bool {
        (self.0)(world_position(block, surfel), surfel)
    }
}

/// Conjunction of several constraints.
#[derive(Default)]
pub struct AllOf {
    constraints: Vec<Box<dyn SurfelConstraint>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, constraint: impl SurfelConstraint + 'static) -> Self {
        self.constraints.push(Box::new(constraint));
        self
    }
}

impl SurfelConstraint for AllOf {
    fn check_bbox(&self, bbox: &BBox) -> bool {
        self.constraints.iter().all(|c| c.check_bbox(bbox))
    }

    fn check_node(&self, node: &NodeSummary) -> bool {
        self.constraints.iter().all(|c| c.check_node(node))
    }

    fn check_block(&self, block: &BlockInfo) -> bool {
        self.constraints.iter().all(|c| c.check_block(block))
    }

    fn check_surfel(&self, block: &BlockInfo, surfel: &Surfel) -> bool {
        self.constraints.iter().all(|c| c.check_surfel(block, surfel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SurfelBlock;
    use glam::Vec3;

    #[test]
    fn test_box_constraint_uses_world_position() {
        let block = SurfelBlock::new(DVec3::new(10.0, 0.0, 0.0), vec![Surfel::new(Vec3::new(0.5, 0.5, 0.5))]);
        let info = block.info();
        let inside = BoxConstraint::new(BBox::new(DVec3::new(10.0, 0.0, 0.0), DVec3::new(11.0, 1.0, 1.0)));
        let outside = BoxConstraint::new(BBox::new(DVec3::ZERO, DVec3::ONE));
        assert!(inside.check_surfel(&info, &block.surfels().unwrap()[0]));
        assert!(!outside.check_surfel(&info, &block.surfels().unwrap()[0]));
        assert!(!outside.check_block(&info));
    }

    #[test]
    fn test_all_of() {
        let block = SurfelBlock::new(DVec3::ZERO, vec![Surfel::new(Vec3::ZERO).with_flags(SurfelFlags::AERIAL)]);
        let info = block.info();
        let surfel = block.surfels().unwrap()[0];
        let c = AllOf::new()
            .with(FlagConstraint { required: SurfelFlags::AERIAL, forbidden: SurfelFlags::MARKED })
            .with(FnConstraint(|p: DVec3, _: &Surfel| p.z >= 0.0));
        assert!(c.check_surfel(&info, &surfel));
        let strict = AllOf::new().with(FlagConstraint { required: SurfelFlags::ACTIVE, ..Default::default() });
        assert!(!strict.check_surfel(&info, &surfel));
    }
}
