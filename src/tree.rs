//! The node hierarchy over a [`SurfelDatabase`].
//!
//! Nodes live in a [`Registry`] owned by the tree and refer to each other by
//! [`NodeId`]. Interior nodes usually only hold parts; leaves hold blocks.
//! Aggregates (bounding box, complexity, resolution, timestamp range) are
//! computed on demand and cached per node; any edit made through the tree
//! drops the cache of the edited node and all of its ancestors.
//!
//! ```text
//!            Root
//!           /    \
//!        node    node ── [block, block]
//!          |
//!        node ── [block]
//! ```

use std::cell::Cell;

use glam::DMat4;
use tracing::debug;

use crate::constraint::SurfelConstraint;
use crate::model::{BBox, BlockId, Interval, NodeId, ObjectId, ScanId, SurfelFlags};
use crate::pointset::SurfelPointSet;
use crate::registry::Registry;
use crate::storage::{BlockFlags, BlockPin, BlockSplit, SurfelDatabase};
use crate::{Error, Result};

pub const ROOT_NODE_NAME: &str = "Root";

/// Cached aggregates of one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSummary {
    /// Union over own blocks and parts.
    pub bbox: BBox,
    /// Surfels in the node's own blocks.
    pub complexity: i64,
    /// Lowest resolution among the node's own blocks, 0 without surfels.
    pub resolution: f64,
    /// Union over own blocks and parts.
    pub timestamp_range: Interval,
    /// Union of the own blocks' property flags.
    pub flags: BlockFlags,
}

impl NodeSummary {
    pub fn average_radius(&self) -> f64 {
        if self.resolution <= 0.0 {
            return 0.0;
        }
        (1.0 / (self.resolution * std::f64::consts::PI)).sqrt()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurfelNode {
    name: Option<String>,
    parent: Option<NodeId>,
    parts: Vec<NodeId>,
    blocks: Vec<BlockId>,
    object: Option<ObjectId>,
    scan: Option<ScanId>,
    summary: Cell<Option<NodeSummary>>,
}

impl SurfelNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn parts(&self) -> &[NodeId] {
        &self.parts
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// The object this node is directly attached to.
    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    /// The scan this node is directly attached to.
    pub fn scan(&self) -> Option<ScanId> {
        self.scan
    }

    pub fn is_leaf(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Options for [`SurfelTree::point_set`].
#[derive(Clone, Copy, Default)]
pub struct PointQuery<'a> {
    /// Descend to the leaves instead of reading the node's own blocks.
    pub leaf_level: bool,
    /// Subsample blocks denser than this (0 keeps everything).
    pub max_resolution: f64,
    /// Include reduced-density blocks.
    pub multiresolution: bool,
    pub constraint: Option<&'a dyn SurfelConstraint>,
}

/// Children created by [`SurfelTree::split_leaf_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeSplit {
    pub inside: Option<NodeId>,
    pub outside: Option<NodeId>,
}

#[derive(Debug)]
pub struct SurfelTree {
    database: SurfelDatabase,
    nodes: Registry<NodeId, SurfelNode>,
    root: NodeId,
}

impl SurfelTree {
    pub fn new(database: SurfelDatabase) -> Self {
        let mut nodes = Registry::new();
        let root = nodes.insert(SurfelNode::named(ROOT_NODE_NAME));
        Self { database, nodes, root }
    }

    pub fn database(&self) -> &SurfelDatabase {
        &self.database
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&SurfelNode> {
        self.nodes.try_get(id)
    }

    pub fn node_at(&self, index: usize) -> Option<NodeId> {
        self.nodes.handle_at(index)
    }

    /// Dense position of a node, as written to scene files.
    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.index_of(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.handles()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &SurfelNode)> + '_ {
        self.nodes.iter()
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|(_, n)| n.name() == Some(name)).map(|(id, _)| id)
    }

    // ------------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------------

    pub fn insert_node(&mut self, node: SurfelNode, parent: NodeId) -> Result<NodeId> {
        self.nodes.try_get(parent)?;
        let id = self.insert_detached(node);
        self.attach(id, parent);
        Ok(id)
    }

    /// Insert a node with no parent. Used by readers that wire parents in a
    /// second pass.
    pub(crate) fn insert_detached(&mut self, mut node: SurfelNode) -> NodeId {
        node.parent = None;
        node.parts.clear();
        node.blocks.clear();
        node.object = None;
        node.scan = None;
        node.summary.set(None);
        self.nodes.insert(node)
    }

    fn attach(&mut self, id: NodeId, parent: NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = Some(parent);
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            p.parts.push(id);
        }
        self.invalidate(parent);
    }

    fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.nodes.get_mut(id).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(parent) {
            p.parts.retain(|&part| part != id);
        }
        self.invalidate(parent);
    }

    /// Move `id` under `parent`.
    pub fn set_parent(&mut self, id: NodeId, parent: NodeId) -> Result<()> {
        self.nodes.try_get(id)?;
        self.nodes.try_get(parent)?;
        if id == self.root {
            return Err(Error::ConstraintViolation("the root node has no parent".into()));
        }
        if self.ancestors(parent).contains(&id) || parent == id {
            return Err(Error::ConstraintViolation(format!("{parent} is inside the subtree of {id}")));
        }
        self.detach(id);
        self.attach(id, parent);
        Ok(())
    }

    /// Remove an empty, unowned node.
    pub fn remove_node(&mut self, id: NodeId) -> Result<SurfelNode> {
        let node = self.nodes.try_get(id)?;
        if id == self.root {
            return Err(Error::ConstraintViolation("the root node cannot be removed".into()));
        }
        if !node.blocks.is_empty() || !node.parts.is_empty() {
            return Err(Error::ConstraintViolation(format!(
                "{id} still has {} blocks and {} parts",
                node.blocks.len(),
                node.parts.len()
            )));
        }
        if let Some(object) = node.object {
            return Err(Error::ConstraintViolation(format!("{id} still belongs to {object}")));
        }
        if let Some(scan) = node.scan {
            return Err(Error::ConstraintViolation(format!("{id} is still linked to {scan}")));
        }
        self.detach(id);
        let node = self.nodes.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        debug!(node = %id, "removed node");
        Ok(node)
    }

    pub fn set_node_name(&mut self, id: NodeId, name: Option<String>) -> Result<()> {
        self.nodes.try_get_mut(id)?.name = name;
        Ok(())
    }

    pub(crate) fn set_node_object(&mut self, id: NodeId, object: Option<ObjectId>) -> Result<()> {
        self.nodes.try_get_mut(id)?.object = object;
        Ok(())
    }

    pub(crate) fn set_node_scan(&mut self, id: NodeId, scan: Option<ScanId>) -> Result<()> {
        self.nodes.try_get_mut(id)?.scan = scan;
        Ok(())
    }

    /// Hand a database block to a node.
    pub fn insert_block(&mut self, id: NodeId, block: BlockId) -> Result<()> {
        self.nodes.try_get(id)?;
        self.database.set_block_node(block, Some(id))?;
        self.nodes.try_get_mut(id)?.blocks.push(block);
        self.invalidate(id);
        Ok(())
    }

    /// Take a block away from a node. The block stays in the database.
    pub fn remove_block(&mut self, id: NodeId, block: BlockId) -> Result<()> {
        let node = self.nodes.try_get_mut(id)?;
        let Some(pos) = node.blocks.iter().position(|&b| b == block) else {
            return Err(Error::NotFound(format!("{block} in {id}")));
        };
        node.blocks.remove(pos);
        self.database.set_block_node(block, None)?;
        self.invalidate(id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------------

    /// Parent chain, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(id).and_then(|n| n.parent);
        while let Some(ancestor) = cursor {
            out.push(ancestor);
            cursor = self.nodes.get(ancestor).and_then(|n| n.parent);
        }
        out
    }

    /// `id` and everything below it, preorder.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(next) else { continue };
            out.push(next);
            stack.extend(node.parts.iter().rev());
        }
        out
    }

    /// Depth below the root (root is 0).
    pub fn tree_level(&self, id: NodeId) -> Result<usize> {
        self.nodes.try_get(id)?;
        Ok(self.ancestors(id).len())
    }

    /// The scan linked to this node, optionally looking up the hierarchy.
    pub fn scan_of(&self, id: NodeId, search_ancestors: bool) -> Result<Option<ScanId>> {
        let node = self.nodes.try_get(id)?;
        if node.scan.is_some() || !search_ancestors {
            return Ok(node.scan);
        }
        Ok(self
            .ancestors(id)
            .into_iter()
            .find_map(|a| self.nodes.get(a).and_then(|n| n.scan)))
    }

    // ------------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------------

    pub fn summary(&self, id: NodeId) -> Result<NodeSummary> {
        let node = self.nodes.try_get(id)?;
        if let Some(summary) = node.summary.get() {
            return Ok(summary);
        }
        let mut summary = NodeSummary {
            bbox: BBox::EMPTY,
            complexity: 0,
            resolution: 0.0,
            timestamp_range: Interval::EMPTY,
            flags: BlockFlags::empty(),
        };
        let mut resolution = f64::MAX;
        for &block in &node.blocks {
            let info = self.database.block_info(block)?;
            summary.bbox.union(&info.bbox);
            summary.timestamp_range.union(&info.timestamp_range);
            summary.complexity += info.surfel_count as i64;
            summary.flags |= info.flags & BlockFlags::PROPERTY_MASK;
            resolution = resolution.min(info.resolution);
        }
        if summary.complexity > 0 {
            summary.resolution = resolution;
        }
        for &part in &node.parts {
            let child = self.summary(part)?;
            summary.bbox.union(&child.bbox);
            summary.timestamp_range.union(&child.timestamp_range);
        }
        node.summary.set(Some(summary));
        Ok(summary)
    }

    /// Drop cached aggregates of `id` and its ancestors. Call this after
    /// editing a node's records through a [`BlockPin`].
    pub fn invalidate(&self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(next) = cursor {
            let Some(node) = self.nodes.get(next) else { break };
            node.summary.set(None);
            cursor = node.parent;
        }
    }

    /// Whether the node's blocks (or, with `leaf_level`, any descendant's)
    /// hold at least one surfel.
    pub fn has_surfels(&self, id: NodeId, leaf_level: bool) -> Result<bool> {
        let node = self.nodes.try_get(id)?;
        for &block in &node.blocks {
            if self.database.block_info(block)?.surfel_count > 0 {
                return Ok(true);
            }
        }
        if leaf_level {
            for &part in &node.parts {
                if self.has_surfels(part, true)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Block access
    // ------------------------------------------------------------------------

    /// Pin the node's blocks, or the whole subtree's.
    pub fn pin_blocks(&self, id: NodeId, subtree: bool) -> Result<Vec<BlockPin>> {
        let nodes = if subtree { self.subtree(id) } else { vec![id] };
        let mut pins = Vec::new();
        for node in nodes {
            for &block in &self.nodes.try_get(node)?.blocks {
                pins.push(self.database.pin_block(block)?);
            }
        }
        Ok(pins)
    }

    pub fn are_blocks_resident(&self, id: NodeId) -> Result<bool> {
        for &block in &self.nodes.try_get(id)?.blocks {
            if !self.database.is_resident(block)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply an affine map to every surfel in the node's own blocks.
    pub fn transform_node(&mut self, id: NodeId, m: &DMat4) -> Result<()> {
        for &block in &self.nodes.try_get(id)?.blocks {
            self.database.transform_block(block, m)?;
        }
        self.invalidate(id);
        Ok(())
    }

    /// Set or clear the mark flag on every surfel of the node's own blocks.
    pub fn set_marks(&self, id: NodeId, mark: bool) -> Result<()> {
        for pin in self.pin_blocks(id, false)? {
            pin.with_surfels_mut(|surfels| {
                for s in surfels {
                    s.set_flag(SurfelFlags::MARKED, mark);
                }
            })?;
            pin.release()?;
        }
        Ok(())
    }

    /// Gather surfels depth-first.
    pub fn point_set(&self, id: NodeId, query: &PointQuery<'_>) -> Result<SurfelPointSet> {
        let mut set = SurfelPointSet::new();
        self.insert_into_point_set(id, query, &mut set)?;
        Ok(set)
    }

    pub fn insert_into_point_set(&self, id: NodeId, query: &PointQuery<'_>, set: &mut SurfelPointSet) -> Result<()> {
        let node = self.nodes.try_get(id)?;
        if let Some(c) = query.constraint
            && !c.check_node(&self.summary(id)?)
        {
            return Ok(());
        }
        if query.leaf_level && !node.parts.is_empty() {
            for &part in &node.parts {
                self.insert_into_point_set(part, query, set)?;
            }
            return Ok(());
        }
        for &block in &node.blocks {
            let info = self.database.block_info(block)?;
            if info.flags.contains(BlockFlags::MULTIRESOLUTION) && !query.multiresolution {
                continue;
            }
            let pin = self.database.pin_block(block)?;
            set.insert_block_points(&pin, query.max_resolution, query.constraint)?;
            pin.release()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Split / cull
    // ------------------------------------------------------------------------

    /// Partition a leaf's blocks by `constraint`.
    ///
    /// The leaf keeps no blocks of its own afterwards: passing records go to
    /// a new `inside` part and failing records to a new `outside` part.
    /// Parts are created only when they receive surfels.
    ///
    /// A read-only database or an unreadable block fails before the leaf
    /// changes. A later failure hands every block back to the leaf.
    pub fn split_leaf_node(&mut self, id: NodeId, constraint: &dyn SurfelConstraint) -> Result<NodeSplit> {
        let node = self.nodes.try_get(id)?;
        if !node.parts.is_empty() {
            return Err(Error::ConstraintViolation(format!("{id} is not a leaf")));
        }
        let blocks = node.blocks.clone();
        self.database.check_writable()?;
        let pins = self.pin_blocks(id, false)?;

        let mut inside = Vec::new();
        let mut outside = Vec::new();
        for block in blocks {
            match self.split_owned_block(id, block, constraint) {
                Ok((passed, failed)) => {
                    inside.extend(passed);
                    outside.extend(failed);
                }
                Err(e) => {
                    for done in inside.into_iter().chain(outside) {
                        self.insert_block(id, done)?;
                    }
                    return Err(e);
                }
            }
        }
        drop(pins);

        let mut split = NodeSplit::default();
        if !inside.is_empty() {
            let part = self.insert_node(SurfelNode::named("inside"), id)?;
            for block in inside {
                self.insert_block(part, block)?;
            }
            split.inside = Some(part);
        }
        if !outside.is_empty() {
            let part = self.insert_node(SurfelNode::named("outside"), id)?;
            for block in outside {
                self.insert_block(part, block)?;
            }
            split.outside = Some(part);
        }
        debug!(node = %id, inside = ?split.inside, outside = ?split.outside, "split leaf node");
        Ok(split)
    }

    /// Take `block` from node `id` and split it. On failure the block goes
    /// back to the node.
    fn split_owned_block(
        &mut self,
        id: NodeId,
        block: BlockId,
        constraint: &dyn SurfelConstraint,
    ) -> Result<(Option<BlockId>, Option<BlockId>)> {
        self.remove_block(id, block)?;
        match self.split_block(block, constraint) {
            Ok(parts) => Ok(parts),
            Err(e) => {
                self.insert_block(id, block)?;
                Err(e)
            }
        }
    }

    /// Split one detached block, returning the passing and failing parts.
    fn split_block(&self, block: BlockId, constraint: &dyn SurfelConstraint) -> Result<(Option<BlockId>, Option<BlockId>)> {
        let info = self.database.block_info(block)?;
        if info.surfel_count == 0 {
            return Ok((Some(block), None));
        }
        if !constraint.check_block(&info) {
            return Ok((None, Some(block)));
        }
        match self.database.split_block(block, |s| constraint.check_surfel(&info, s))? {
            BlockSplit::Unchanged { all_passed: true } => Ok((Some(block), None)),
            BlockSplit::Unchanged { all_passed: false } => Ok((None, Some(block))),
            BlockSplit::Split { passed, failed } => Ok((Some(passed), Some(failed))),
        }
    }

    /// Delete every surfel that fails `constraint`, then drop nodes left
    /// empty. Returns the number of surfels deleted.
    ///
    /// Fails up front on a read-only database. Each node's blocks are pinned
    /// before any of them is split, and a block whose split fails stays with
    /// its node.
    pub fn cull(&mut self, constraint: &dyn SurfelConstraint) -> Result<i64> {
        self.database.check_writable()?;
        let mut discarded = 0i64;
        for id in self.subtree(self.root) {
            let blocks = self.nodes.try_get(id)?.blocks.clone();
            let _pins = self.pin_blocks(id, false)?;
            for block in blocks {
                let (passed, failed) = self.split_owned_block(id, block, constraint)?;
                if let Some(passed) = passed {
                    self.insert_block(id, passed)?;
                }
                if let Some(failed) = failed {
                    discarded += self.database.block_info(failed)?.surfel_count as i64;
                    self.database.remove_and_delete_block(failed)?;
                }
            }
        }
        let removed = self.remove_empty_nodes()?;
        debug!(discarded, removed_nodes = removed, "culled surfels");
        Ok(discarded)
    }

    /// Remove nodes with no blocks and no parts, bottom-up. The root and
    /// nodes attached to an object or scan are kept.
    pub fn remove_empty_nodes(&mut self) -> Result<usize> {
        let mut removed = 0;
        for id in self.subtree(self.root).into_iter().rev() {
            let node = self.nodes.try_get(id)?;
            let empty = node.blocks.is_empty() && node.parts.is_empty();
            if id != self.root && empty && node.object.is_none() && node.scan.is_none() {
                self.remove_node(id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
