//! The paging database.
//!
//! [`SurfelDatabase`] is a cheap, cloneable handle around the block registry
//! and the optional backing file. Residency is driven by pins:
//!
//! - the first [`BlockPin`] of a non-resident block decodes its records from
//!   the file;
//! - dropping the last pin writes the block back if it is dirty and then
//!   frees the records (file-backed databases only);
//! - removal of a pinned block is deferred until its last pin is dropped.
//!
//! A database without a file keeps every block resident, since there is
//! nowhere to page it back in from.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::DMat4;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::block::{BlockFlags, BlockInfo, SurfelBlock};
use super::codec::codec_for;
use super::header::{self, DirectoryEntry, FileHeader, DIRECTORY_ENTRY_LEN};
use super::{AccessMode, FormatVersion};
use crate::config::StoreConfig;
use crate::model::{BBox, BlockId, Interval, NodeId, Surfel};
use crate::registry::Registry;
use crate::{Error, Result};

/// I/O counters, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub block_reads: u64,
    pub block_writes: u64,
    pub evictions: u64,
}

/// Result of [`SurfelDatabase::split_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSplit {
    /// Every record landed on one side; the block was left alone.
    Unchanged { all_passed: bool },
    /// The block was retired and replaced by two new blocks.
    Split { passed: BlockId, failed: BlockId },
}

// ============================================================================
// Handle + inner state
// ============================================================================

/// Handle to a block database. Clones share the same state.
#[derive(Clone)]
pub struct SurfelDatabase {
    inner: Arc<Mutex<DatabaseInner>>,
}

impl std::fmt::Debug for SurfelDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SurfelDatabase")
            .field("blocks", &inner.blocks.len())
            .field("surfels", &inner.surfel_count)
            .field("resident_surfels", &inner.resident_surfels)
            .field("path", &inner.file.as_ref().map(|f| f.path.clone()))
            .finish()
    }
}

struct BackingFile {
    file: File,
    path: PathBuf,
    access: AccessMode,
    swap: bool,
    directory_offset: u64,
    directory_capacity: u32,
}

struct DatabaseInner {
    config: StoreConfig,
    version: FormatVersion,
    blocks: Registry<BlockId, SurfelBlock>,
    file: Option<BackingFile>,
    surfel_count: i64,
    resident_surfels: i64,
    bbox: BBox,
    timestamp_range: Interval,
    max_identifier: u32,
    stats: DatabaseStats,
}

impl Default for SurfelDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfelDatabase {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let version = config.format_version;
        Self {
            inner: Arc::new(Mutex::new(DatabaseInner {
                config,
                version,
                blocks: Registry::new(),
                file: None,
                surfel_count: 0,
                resident_surfels: 0,
                bbox: BBox::EMPTY,
                timestamp_range: Interval::EMPTY,
                max_identifier: 0,
                stats: DatabaseStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseInner> {
        self.inner.lock()
    }

    /// Whether two handles refer to the same database.
    pub fn same_as(&self, other: &SurfelDatabase) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn surfel_count(&self) -> i64 {
        self.lock().surfel_count
    }

    pub fn resident_surfel_count(&self) -> i64 {
        self.lock().resident_surfels
    }

    pub fn bbox(&self) -> BBox {
        self.lock().bbox
    }

    pub fn timestamp_range(&self) -> Interval {
        self.lock().timestamp_range
    }

    pub fn max_identifier(&self) -> u32 {
        self.lock().max_identifier
    }

    pub fn version(&self) -> FormatVersion {
        self.lock().version
    }

    pub fn stats(&self) -> DatabaseStats {
        self.lock().stats
    }

    pub fn config(&self) -> StoreConfig {
        self.lock().config.clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().file.as_ref().map(|f| f.path.clone())
    }

    pub fn is_open(&self) -> bool {
        self.lock().file.is_some()
    }

    pub fn contains_block(&self, id: BlockId) -> bool {
        self.lock().blocks.contains(id)
    }

    /// Block handles in dense order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.lock().blocks.handles()
    }

    pub fn block_at(&self, index: usize) -> Option<BlockId> {
        self.lock().blocks.handle_at(index)
    }

    /// Dense position of a block, as written to scene files.
    pub fn block_index(&self, id: BlockId) -> Option<usize> {
        self.lock().blocks.index_of(id)
    }

    pub fn block_info(&self, id: BlockId) -> Result<BlockInfo> {
        Ok(self.lock().blocks.try_get(id)?.info())
    }

    /// Run `f` against a block's metadata without pinning it.
    pub fn with_block<R>(&self, id: BlockId, f: impl FnOnce(&SurfelBlock) -> R) -> Result<R> {
        Ok(f(self.lock().blocks.try_get(id)?))
    }

    pub fn is_resident(&self, id: BlockId) -> Result<bool> {
        Ok(self.lock().blocks.try_get(id)?.is_resident())
    }

    // ------------------------------------------------------------------------
    // Insert / remove
    // ------------------------------------------------------------------------

    /// Take ownership of `block` and return the inserter's pin on it.
    pub fn insert_block(&self, block: SurfelBlock) -> Result<BlockPin> {
        let id = self.lock().insert(block, 1)?;
        Ok(BlockPin::adopt(self.clone(), id))
    }

    /// Detach an unpinned, unowned block and hand it back with its records
    /// loaded.
    pub fn remove_block(&self, id: BlockId) -> Result<SurfelBlock> {
        let mut inner = self.lock();
        inner.check_removable(id)?;
        inner.page_in(id)?;
        inner.detach(id)
    }

    /// Remove and drop a block, deferring until its last pin is released.
    pub fn remove_and_delete_block(&self, id: BlockId) -> Result<()> {
        let mut inner = self.lock();
        let block = inner.blocks.try_get_mut(id)?;
        if let Some(node) = block.node {
            return Err(Error::ConstraintViolation(format!("{id} still belongs to {node}")));
        }
        if block.is_delete_pending() {
            return Ok(());
        }
        if block.pin_count > 0 {
            inner.mark_delete_pending(id)?;
            return Ok(());
        }
        inner.detach(id)?;
        Ok(())
    }

    /// Force out every block with a pending delete, pinned or not.
    pub fn purge_deleted_blocks(&self) -> Result<usize> {
        let mut inner = self.lock();
        let pending: Vec<BlockId> = inner
            .blocks
            .iter()
            .filter(|(_, b)| b.is_delete_pending())
            .map(|(id, _)| id)
            .collect();
        for &id in &pending {
            if let Some(block) = inner.blocks.get_mut(id) {
                block.pin_count = 0;
            }
            inner.detach(id)?;
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "purged deleted blocks");
        }
        Ok(pending.len())
    }

    /// Recompute the overall bounding box from the live blocks.
    pub fn recompute_bounds(&self) {
        self.lock().recompute_bounds();
    }

    // ------------------------------------------------------------------------
    // Paging
    // ------------------------------------------------------------------------

    /// Pin a block, paging its records in if needed.
    pub fn pin_block(&self, id: BlockId) -> Result<BlockPin> {
        self.lock().pin(id)?;
        Ok(BlockPin::adopt(self.clone(), id))
    }

    /// Write a dirty resident block to the backing file.
    pub fn sync_block(&self, id: BlockId) -> Result<()> {
        self.lock().sync_block(id)
    }

    /// Partition a block's records with `predicate`.
    ///
    /// If both sides are non-empty the block is replaced by two blocks with
    /// the same origin and retired as by
    /// [`remove_and_delete_block`](Self::remove_and_delete_block). The new
    /// blocks take over the retired block's file region when it has one, the
    /// passing records first.
    ///
    /// Every check runs before anything changes: an owned, deleted or
    /// unreadable block, or a read-only file, leaves the database untouched.
    /// Write-back of the new blocks happens afterwards; if it fails they stay
    /// dirty and are written by the next [`sync_file`](Self::sync_file).
    pub fn split_block(&self, id: BlockId, mut predicate: impl FnMut(&Surfel) -> bool) -> Result<BlockSplit> {
        {
            let inner = self.lock();
            let block = inner.blocks.try_get(id)?;
            if let Some(node) = block.node {
                return Err(Error::ConstraintViolation(format!("{id} still belongs to {node}")));
            }
            inner.check_writable()?;
        }
        let pin = self.pin_block(id)?;
        let (passed, failed): (Vec<Surfel>, Vec<Surfel>) =
            pin.with_surfels(|s| s.iter().copied().partition(|s| predicate(s)))?;
        if passed.is_empty() || failed.is_empty() {
            pin.release()?;
            return Ok(BlockSplit::Unchanged { all_passed: failed.is_empty() });
        }

        let mut inner = self.lock();
        // our pin is folded into the retirement below
        pin.disarm();
        let bytes_per_surfel = inner.version.bytes_per_surfel() as u64;
        let parent = inner.blocks.try_get_mut(id)?;
        let (origin, timestamp_origin) = (parent.origin, parent.timestamp_origin);
        let multiresolution = parent.is_multiresolution();
        let (offset, capacity, total) = (parent.file_offset, parent.file_capacity, parent.surfel_count);
        // the parts own the region from here on
        parent.file_offset = 0;
        parent.file_capacity = 0;
        parent.flags.remove(BlockFlags::DIRTY);
        parent.pin_count = parent.pin_count.saturating_sub(1);
        let still_pinned = parent.pin_count > 0;

        let part = |surfels: Vec<Surfel>| {
            SurfelBlock::new(origin, surfels)
                .with_timestamp_origin(timestamp_origin)
                .with_multiresolution(multiresolution)
        };
        let n_passed = passed.len();
        let first = inner.insert(part(passed), 1)?;
        let second = inner.insert(part(failed), 1)?;
        if offset > 0 && capacity as usize >= total {
            if let Some(block) = inner.blocks.get_mut(first) {
                block.file_offset = offset;
                block.file_capacity = n_passed as u32;
            }
            if let Some(block) = inner.blocks.get_mut(second) {
                block.file_offset = offset + n_passed as u64 * bytes_per_surfel;
                block.file_capacity = (total - n_passed) as u32;
            }
        }
        if still_pinned {
            inner.mark_delete_pending(id)?;
        } else {
            inner.detach(id)?;
        }

        for part in [first, second] {
            if let Err(e) = inner.release(part) {
                warn!(block = %part, error = %e, "split part left dirty");
            }
        }
        debug!(block = %id, passed = %first, failed = %second, "split block");
        Ok(BlockSplit::Split { passed: first, failed: second })
    }

    /// Fail with [`Error::ReadOnly`] if the backing file cannot be written.
    pub(crate) fn check_writable(&self) -> Result<()> {
        self.lock().check_writable()
    }

    pub(crate) fn set_block_node(&self, id: BlockId, node: Option<NodeId>) -> Result<()> {
        let mut inner = self.lock();
        let block = inner.blocks.try_get_mut(id)?;
        if let (Some(owner), Some(_)) = (block.node, node) {
            return Err(Error::ConstraintViolation(format!("{id} already belongs to {owner}")));
        }
        if node.is_some() && block.is_delete_pending() {
            return Err(Error::ConstraintViolation(format!("{id} is pending deletion")));
        }
        block.node = node;
        Ok(())
    }

    /// Apply an affine map to a block's records and origin.
    pub(crate) fn transform_block(&self, id: BlockId, m: &DMat4) -> Result<()> {
        let pin = self.pin_block(id)?;
        {
            let mut inner = self.lock();
            let block = inner.blocks.try_get_mut(id)?;
            block.transform(m);
            block.flags |= BlockFlags::DIRTY;
            let (bbox, ts) = (block.bbox, block.timestamp_range);
            inner.bbox.union(&bbox);
            inner.timestamp_range.union(&ts);
        }
        pin.release()
    }

    // ------------------------------------------------------------------------
    // File lifecycle
    // ------------------------------------------------------------------------

    /// Attach a backing file.
    ///
    /// [`AccessMode::Create`] truncates and writes a fresh header; the other
    /// modes read the header and append the directory's blocks (not
    /// resident, not dirty) to this database.
    pub fn open_file(&self, path: impl AsRef<Path>, access: AccessMode) -> Result<()> {
        let path = path.as_ref();
        let mut inner = self.lock();
        if let Some(open) = &inner.file {
            return Err(Error::ConstraintViolation(format!(
                "database already open on {}",
                open.path.display()
            )));
        }

        // blocks already here get fresh regions in the new file
        inner.prepare_for_new_file()?;
        match access {
            AccessMode::Create => {
                let mut file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                inner.reset_file_regions();
                inner.version = inner.config.format_version;
                inner.header().write_to(&mut file, false)?;
                inner.file = Some(BackingFile {
                    file,
                    path: path.to_path_buf(),
                    access,
                    swap: false,
                    directory_offset: 0,
                    directory_capacity: 0,
                });
            }
            AccessMode::ReadWrite | AccessMode::ReadOnly => {
                let mut file = File::options().read(true).write(access.is_writable()).open(path)?;
                let file_len = file.metadata()?.len();
                let (header, swap) = FileHeader::read_from(&mut file)?;
                let entries = read_checked_directory(&mut file, &header, swap, 0, file_len)?;
                inner.reset_file_regions();
                inner.version = header.version;
                for entry in &entries {
                    let block = entry.to_block();
                    inner.account_loaded(&block);
                    inner.blocks.insert(block);
                }
                inner.bbox.union(&header.bbox);
                inner.timestamp_range.union(&header.timestamp_range);
                inner.max_identifier = inner.max_identifier.max(header.max_identifier);
                inner.file = Some(BackingFile {
                    file,
                    path: path.to_path_buf(),
                    access,
                    swap,
                    directory_offset: header.directory_offset,
                    directory_capacity: header.directory_capacity,
                });
            }
        }
        info!(path = %path.display(), ?access, version = %inner.version, blocks = inner.blocks.len(), "opened surfel database");
        Ok(())
    }

    /// Flush dirty blocks, then the directory and header.
    pub fn sync_file(&self) -> Result<()> {
        self.lock().sync_file()
    }

    /// Sync and detach the backing file.
    pub fn close_file(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.sync_file()?;
        if let Some(file) = inner.file.take() {
            info!(path = %file.path.display(), "closed surfel database");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Self-contained streams
    // ------------------------------------------------------------------------

    /// Write every block into `w` as a complete database image at the
    /// current format version.
    pub fn write_stream<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        let mut inner = self.lock();
        let version = FormatVersion::CURRENT;
        let codec = codec_for(version);
        let start = w.stream_position()?;

        let mut header = inner.header();
        header.version = version;
        header.write_to(w, false)?;

        let live: Vec<BlockId> = inner.live_blocks().map(|(id, _)| id).collect();
        let mut entries = Vec::with_capacity(live.len());
        for id in live {
            let offset = w.stream_position()? - start;
            let resident = inner.blocks.try_get(id)?.surfels.as_deref().map(|s| codec.encode_all(s, false));
            let bytes = match resident {
                Some(bytes) => bytes,
                None => codec.encode_all(&inner.read_records(id)?, false),
            };
            w.write_all(&bytes)?;
            let block = inner.blocks.try_get(id)?;
            let count = block.surfel_count as u32;
            entries.push(DirectoryEntry::from_block(block, if count > 0 { offset } else { 0 }, count));
        }

        header.directory_offset = w.stream_position()? - start;
        header.directory_capacity = entries.len() as u32;
        header::write_directory(w, &entries, false)?;
        let end = w.stream_position()?;

        w.seek(SeekFrom::Start(start))?;
        header.write_to(w, false)?;
        w.seek(SeekFrom::Start(end))?;
        inner.stats.block_writes += entries.len() as u64;
        Ok(())
    }

    /// Load a database image, making every block resident.
    ///
    /// Loaded blocks are dirty: they have no file region of their own until
    /// this database is attached to a file and synced.
    pub fn read_stream<R: Read + Seek>(&self, r: &mut R) -> Result<()> {
        let start = r.stream_position()?;
        let image_len = r.seek(SeekFrom::End(0))?.saturating_sub(start);
        r.seek(SeekFrom::Start(start))?;
        let (header, swap) = FileHeader::read_from(r)?;
        let entries = read_checked_directory(r, &header, swap, start, image_len)?;
        let codec = codec_for(header.version);

        // decode everything before touching the registry
        let mut blocks = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut block = entry.to_block();
            let mut bytes = vec![0u8; block.surfel_count * codec.record_size()];
            if !bytes.is_empty() {
                r.seek(SeekFrom::Start(start + entry.offset))?;
                r.read_exact(&mut bytes)?;
            }
            block.surfels = Some(codec.decode_all(&bytes, swap)?);
            block.file_offset = 0;
            block.file_capacity = 0;
            block.update_properties();
            block.flags |= BlockFlags::DIRTY;
            blocks.push(block);
        }

        let mut inner = self.lock();
        for block in blocks {
            inner.account_loaded(&block);
            inner.resident_surfels += block.surfel_count as i64;
            inner.blocks.insert(block);
        }
        inner.bbox.union(&header.bbox);
        inner.timestamp_range.union(&header.timestamp_range);
        inner.max_identifier = inner.max_identifier.max(header.max_identifier);
        inner.stats.block_reads += entries.len() as u64;
        debug!(blocks = entries.len(), version = %header.version, "read database stream");
        Ok(())
    }

    /// Write a `.ssb` database image to `path`.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_database_extension(path)?;
        let mut file = std::io::BufWriter::new(File::create(path)?);
        self.write_stream(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Load a `.ssb` database image from `path`.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_database_extension(path)?;
        let mut file = std::io::BufReader::new(File::open(path)?);
        self.read_stream(&mut file)
    }
}

fn check_database_extension(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ssb") => Ok(()),
        _ => Err(Error::Format(format!("unrecognized database extension: {}", path.display()))),
    }
}

/// Read the directory of an image starting at `start` and `image_len` bytes
/// long, rejecting any count or region that does not fit inside it.
fn read_checked_directory<R: Read + Seek>(
    r: &mut R,
    header: &FileHeader,
    swap: bool,
    start: u64,
    image_len: u64,
) -> Result<Vec<DirectoryEntry>> {
    let Some(available) = image_len.checked_sub(header.directory_offset) else {
        return Err(Error::Format(format!(
            "directory offset {} is past the {image_len}-byte image",
            header.directory_offset
        )));
    };
    r.seek(SeekFrom::Start(start + header.directory_offset))?;
    let entries = header::read_directory(r, header.block_count as usize, swap, available)?;
    let record_size = codec_for(header.version).record_size();
    for entry in &entries {
        entry.check_region(record_size, image_len)?;
    }
    Ok(entries)
}

// ============================================================================
// Inner operations (called with the lock held)
// ============================================================================

impl DatabaseInner {
    fn header(&self) -> FileHeader {
        FileHeader {
            version: self.version,
            directory_offset: self.file.as_ref().map_or(0, |f| f.directory_offset),
            directory_capacity: self.file.as_ref().map_or(0, |f| f.directory_capacity),
            block_count: self.live_blocks().count() as u32,
            surfel_count: self.surfel_count,
            bbox: self.bbox,
            timestamp_range: self.timestamp_range,
            max_identifier: self.max_identifier,
        }
    }

    /// Blocks not waiting for deletion, in dense order. Only these are
    /// written to directories.
    fn live_blocks(&self) -> impl Iterator<Item = (BlockId, &SurfelBlock)> + '_ {
        self.blocks.iter().filter(|(_, b)| !b.is_delete_pending())
    }

    fn check_writable(&self) -> Result<()> {
        match &self.file {
            Some(file) if !file.access.is_writable() => Err(Error::ReadOnly(file.path.display().to_string())),
            _ => Ok(()),
        }
    }

    /// Blocks already in memory are rewritten into a newly attached file.
    fn prepare_for_new_file(&self) -> Result<()> {
        if let Some((id, _)) = self.blocks.iter().find(|(_, b)| !b.is_resident() && b.surfel_count > 0) {
            return Err(Error::ConstraintViolation(format!(
                "{id} is not resident and would be lost by creating a new file"
            )));
        }
        Ok(())
    }

    fn reset_file_regions(&mut self) {
        for (_, block) in self.blocks.iter_mut() {
            block.file_offset = 0;
            block.file_capacity = 0;
            if block.surfel_count > 0 {
                block.flags |= BlockFlags::DIRTY;
            }
        }
    }

    fn account_loaded(&mut self, block: &SurfelBlock) {
        self.surfel_count += block.surfel_count as i64;
        self.bbox.union(&block.bbox);
        self.timestamp_range.union(&block.timestamp_range);
        self.max_identifier = self.max_identifier.max(block.identifier_range.1);
    }

    fn insert(&mut self, mut block: SurfelBlock, pins: u32) -> Result<BlockId> {
        let Some(surfels) = block.surfels.as_ref() else {
            return Err(Error::ConstraintViolation("inserted block has no resident records".into()));
        };
        if surfels.len() != block.surfel_count {
            return Err(Error::ConstraintViolation(format!(
                "block holds {} records but declares {}",
                surfels.len(),
                block.surfel_count
            )));
        }
        block.file_offset = 0;
        block.file_capacity = 0;
        block.pin_count = pins;
        block.node = None;
        block.flags.remove(BlockFlags::DELETE_PENDING);
        block.flags |= BlockFlags::DIRTY;
        block.update_properties();

        self.account_loaded(&block);
        self.resident_surfels += block.surfel_count as i64;
        let n = block.surfel_count;
        let id = self.blocks.insert(block);
        debug!(block = %id, surfels = n, resident = self.resident_surfels, "inserted block");
        Ok(id)
    }

    fn check_removable(&self, id: BlockId) -> Result<()> {
        let block = self.blocks.try_get(id)?;
        if block.pin_count > 0 {
            return Err(Error::ConstraintViolation(format!("{id} is pinned {} times", block.pin_count)));
        }
        if let Some(node) = block.node {
            return Err(Error::ConstraintViolation(format!("{id} still belongs to {node}")));
        }
        Ok(())
    }

    /// Flag a pinned block for deletion on its last release. Its records
    /// stop counting towards the database total right away.
    fn mark_delete_pending(&mut self, id: BlockId) -> Result<()> {
        let block = self.blocks.try_get_mut(id)?;
        block.flags |= BlockFlags::DELETE_PENDING;
        let (n, pins) = (block.surfel_count, block.pin_count);
        self.surfel_count -= n as i64;
        debug!(block = %id, pins, "deferred block delete");
        Ok(())
    }

    /// Swap-and-pop a block out of the registry and fix up the accounting.
    fn detach(&mut self, id: BlockId) -> Result<SurfelBlock> {
        let mut block = self
            .blocks
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if block.is_resident() {
            self.resident_surfels -= block.surfel_count as i64;
        }
        if !block.is_delete_pending() {
            self.surfel_count -= block.surfel_count as i64;
        }
        block.file_offset = 0;
        block.file_capacity = 0;
        block.pin_count = 0;
        block.node = None;
        block.flags.remove(BlockFlags::DELETE_PENDING);
        if self.config.recompute_bbox_on_remove {
            self.recompute_bounds();
        }
        debug!(block = %id, surfels = block.surfel_count, resident = self.resident_surfels, "removed block");
        Ok(block)
    }

    fn recompute_bounds(&mut self) {
        let mut bbox = BBox::EMPTY;
        let mut timestamps = Interval::EMPTY;
        for block in self.blocks.values() {
            bbox.union(&block.bbox);
            timestamps.union(&block.timestamp_range);
        }
        self.bbox = bbox;
        self.timestamp_range = timestamps;
    }

    /// Decode a block's records from the backing file without touching its
    /// residency.
    fn read_records(&mut self, id: BlockId) -> Result<Vec<Surfel>> {
        let codec = codec_for(self.version);
        let block = self.blocks.try_get(id)?;
        if block.surfel_count == 0 || block.is_delete_pending() {
            return Ok(Vec::new());
        }
        if block.file_offset == 0 || (block.file_capacity as usize) < block.surfel_count {
            return Err(Error::StorageError(format!("{id} has no file region for its records")));
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::StorageError(format!("{id} is not resident and no file is open")));
        };
        let mut bytes = vec![0u8; block.surfel_count * codec.record_size()];
        file.file.seek(SeekFrom::Start(block.file_offset))?;
        file.file.read_exact(&mut bytes)?;
        self.stats.block_reads += 1;
        codec.decode_all(&bytes, file.swap)
    }

    /// Make a block resident without pinning it.
    fn page_in(&mut self, id: BlockId) -> Result<()> {
        if self.blocks.try_get(id)?.is_resident() {
            return Ok(());
        }
        let surfels = self.read_records(id)?;
        let block = self.blocks.try_get_mut(id)?;
        block.surfels = Some(surfels);
        block.update_properties();
        self.resident_surfels += block.surfel_count as i64;
        debug!(block = %id, surfels = block.surfel_count, resident = self.resident_surfels, "read block");
        Ok(())
    }

    fn pin(&mut self, id: BlockId) -> Result<()> {
        if self.blocks.try_get(id)?.is_delete_pending() {
            return Err(Error::ConstraintViolation(format!("{id} is pending deletion")));
        }
        self.page_in(id)?;
        self.blocks.try_get_mut(id)?.pin_count += 1;
        Ok(())
    }

    fn release(&mut self, id: BlockId) -> Result<()> {
        // purged out from under the pin
        let Some(block) = self.blocks.get_mut(id) else {
            return Ok(());
        };
        block.pin_count = block.pin_count.saturating_sub(1);
        if block.pin_count > 0 {
            return Ok(());
        }
        if block.is_delete_pending() {
            self.detach(id)?;
            return Ok(());
        }
        self.sync_block(id)?;

        let evict = self.config.evict_on_release && self.file.is_some();
        let block = self.blocks.try_get_mut(id)?;
        let on_disk = block.surfel_count == 0 || (block.file_offset > 0 && block.file_capacity > 0);
        if evict && on_disk && !block.is_dirty() && block.is_resident() {
            block.surfels = None;
            self.resident_surfels -= block.surfel_count as i64;
            self.stats.evictions += 1;
            debug!(block = %id, resident = self.resident_surfels, "released block");
        }
        Ok(())
    }

    fn sync_block(&mut self, id: BlockId) -> Result<()> {
        let version = self.version;
        let block = self.blocks.try_get_mut(id)?;
        if !block.is_dirty() {
            return Ok(());
        }
        if block.surfel_count == 0 {
            block.flags.remove(BlockFlags::DIRTY);
            return Ok(());
        }
        // memory-only: stays dirty until a file is attached
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        if !file.access.is_writable() {
            return Err(Error::ReadOnly(file.path.display().to_string()));
        }
        let Some(surfels) = block.surfels.as_deref() else {
            return Err(Error::StorageError(format!("{id} is dirty but not resident")));
        };

        let bytes = codec_for(version).encode_all(surfels, file.swap);
        let n = block.surfel_count as u32;
        if block.file_offset > 0 && n <= block.file_capacity {
            file.file.seek(SeekFrom::Start(block.file_offset))?;
        } else {
            block.file_offset = file.file.seek(SeekFrom::End(0))?;
            block.file_capacity = n;
        }
        file.file.write_all(&bytes)?;
        block.flags.remove(BlockFlags::DIRTY);
        self.stats.block_writes += 1;
        debug!(block = %id, offset = block.file_offset, surfels = n, "synced block");
        Ok(())
    }

    fn sync_file(&mut self) -> Result<()> {
        match &self.file {
            None => return Ok(()),
            Some(file) if !file.access.is_writable() => return Ok(()),
            Some(_) => {}
        }

        let live: Vec<BlockId> = self.live_blocks().map(|(id, _)| id).collect();
        for id in live {
            self.sync_block(id)?;
        }

        let bytes_per_surfel = self.version.bytes_per_surfel() as u64;
        let data_end = self
            .blocks
            .values()
            .filter(|b| b.file_offset > 0)
            .map(|b| b.file_offset + b.file_capacity as u64 * bytes_per_surfel)
            .max();

        let entries: Vec<DirectoryEntry> = self
            .live_blocks()
            .map(|(_, b)| DirectoryEntry::from_block(b, b.file_offset, b.file_capacity))
            .collect();
        let block_count = entries.len() as u32;
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        if block_count > file.directory_capacity || file.directory_offset == 0 {
            file.directory_capacity = block_count;
            file.directory_offset = match data_end {
                Some(end) => end,
                None => file.file.seek(SeekFrom::End(0))?,
            };
        }
        file.file.seek(SeekFrom::Start(file.directory_offset))?;
        header::write_directory(&mut file.file, &entries, file.swap)?;
        let swap = file.swap;
        let header = self.header();
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut file.file, swap)?;
        file.file.flush()?;
        info!(
            path = %file.path.display(),
            blocks = block_count,
            directory_offset = file.directory_offset,
            directory_bytes = entries.len() * DIRECTORY_ENTRY_LEN,
            "synced surfel database"
        );

        // memory-built blocks that were just written can now be paged out
        if self.config.evict_on_release {
            for id in self.blocks.handles() {
                let Some(block) = self.blocks.get_mut(id) else { continue };
                if block.pin_count == 0 && block.is_resident() && !block.is_dirty() && block.file_offset > 0 {
                    block.surfels = None;
                    self.resident_surfels -= block.surfel_count as i64;
                    self.stats.evictions += 1;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// BlockPin
// ============================================================================

/// A pin on one block. The block stays resident while any pin is alive.
///
/// Dropping the pin releases it; use [`release`](Self::release) to observe
/// write-back errors instead of having them logged.
#[must_use = "dropping a pin releases the block immediately"]
pub struct BlockPin {
    db: SurfelDatabase,
    id: BlockId,
    released: bool,
}

impl std::fmt::Debug for BlockPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockPin").field(&self.id).finish()
    }
}

impl BlockPin {
    /// Wrap a pin count that has already been taken.
    fn adopt(db: SurfelDatabase, id: BlockId) -> Self {
        Self { db, id, released: false }
    }

    /// Give up the guard without touching the pin count; the caller has
    /// accounted for it.
    fn disarm(mut self) {
        self.released = true;
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn database(&self) -> &SurfelDatabase {
        &self.db
    }

    /// Another pin on the same block.
    pub fn try_clone(&self) -> Result<BlockPin> {
        self.db.pin_block(self.id)
    }

    pub fn info(&self) -> Result<BlockInfo> {
        self.db.block_info(self.id)
    }

    /// Read access to the block (records guaranteed resident). `f` runs
    /// under the database lock.
    pub fn with_block<R>(&self, f: impl FnOnce(&SurfelBlock) -> R) -> Result<R> {
        self.db.with_block(self.id, f)
    }

    /// Read access to the records.
    ///
    /// The database lock is held while `f` runs: calling back into the
    /// database (or any [`BlockPin`] on it) from `f` deadlocks.
    pub fn with_surfels<R>(&self, f: impl FnOnce(&[Surfel]) -> R) -> Result<R> {
        let inner = self.db.lock();
        let block = inner.blocks.try_get(self.id)?;
        Ok(f(block.surfels.as_deref().unwrap_or_default()))
    }

    /// Mutable access to the records. Marks the block dirty and refreshes its
    /// aggregates afterwards.
    ///
    /// As with [`with_surfels`](Self::with_surfels), `f` runs under the
    /// database lock and must not call back into the database.
    pub fn with_surfels_mut<R>(&self, f: impl FnOnce(&mut [Surfel]) -> R) -> Result<R> {
        let mut inner = self.db.lock();
        let block = inner.blocks.try_get_mut(self.id)?;
        let Some(surfels) = block.surfels.as_mut() else {
            return Err(Error::StorageError(format!("{} is not resident", self.id)));
        };
        let out = f(surfels);
        block.flags |= BlockFlags::DIRTY;
        block.update_properties();
        let (bbox, ts, max_id) = (block.bbox, block.timestamp_range, block.identifier_range.1);
        inner.bbox.union(&bbox);
        inner.timestamp_range.union(&ts);
        inner.max_identifier = inner.max_identifier.max(max_id);
        Ok(out)
    }

    pub fn surfel(&self, index: usize) -> Result<Option<Surfel>> {
        self.with_surfels(|s| s.get(index).copied())
    }

    /// Copy of the records.
    pub fn to_vec(&self) -> Result<Vec<Surfel>> {
        self.with_surfels(|s| s.to_vec())
    }

    /// Release explicitly, reporting write-back errors.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.lock().release(self.id)
    }
}

impl Drop for BlockPin {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.db.lock().release(self.id) {
            warn!(block = %self.id, error = %e, "block release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurfelFlags;
    use glam::{DVec3, Vec3};

    fn block(n: usize) -> SurfelBlock {
        let surfels = (0..n)
            .map(|i| Surfel::new(Vec3::new(i as f32, 0.0, 0.0)).with_identifier(i as u32 + 1))
            .collect();
        SurfelBlock::new(DVec3::ZERO, surfels)
    }

    #[test]
    fn test_insert_and_pin_counts() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(block(3)).unwrap();
        let id = pin.id();
        assert_eq!(db.block_info(id).unwrap().pin_count, 1);
        assert_eq!(db.surfel_count(), 3);
        assert_eq!(db.resident_surfel_count(), 3);
        assert_eq!(db.max_identifier(), 3);
        drop(pin);
        assert_eq!(db.block_info(id).unwrap().pin_count, 0);
        // memory-only databases keep released blocks resident
        assert!(db.is_resident(id).unwrap());
    }

    #[test]
    fn test_remove_pinned_block_is_rejected() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(block(2)).unwrap();
        let err = db.remove_block(pin.id());
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));
        assert_eq!(db.block_count(), 1);
    }

    #[test]
    fn test_deferred_delete_runs_on_last_release() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(block(2)).unwrap();
        let id = pin.id();
        db.remove_and_delete_block(id).unwrap();
        assert!(db.contains_block(id));
        assert!(db.block_info(id).unwrap().flags.contains(BlockFlags::DELETE_PENDING));
        assert!(db.pin_block(id).is_err());
        drop(pin);
        assert!(!db.contains_block(id));
        assert_eq!(db.surfel_count(), 0);
    }

    #[test]
    fn test_purge_deleted_blocks() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(block(2)).unwrap();
        db.remove_and_delete_block(pin.id()).unwrap();
        assert_eq!(db.purge_deleted_blocks().unwrap(), 1);
        assert_eq!(db.block_count(), 0);
        // releasing a pin on a purged block is harmless
        assert!(pin.release().is_ok());
    }

    #[test]
    fn test_with_surfels_mut_marks_dirty() {
        let db = SurfelDatabase::new();
        let pin = db.insert_block(block(2)).unwrap();
        pin.with_surfels_mut(|s| s[0].set_flag(SurfelFlags::AERIAL, true)).unwrap();
        let info = pin.info().unwrap();
        assert!(info.flags.contains(BlockFlags::DIRTY));
        assert!(info.flags.contains(BlockFlags::HAS_AERIAL));
    }

    #[test]
    fn test_split_block_conserves_surfels() {
        let db = SurfelDatabase::new();
        let id = db.insert_block(block(10)).unwrap().id();
        let split = db.split_block(id, |s| s.position[0] < 4.0).unwrap();
        let BlockSplit::Split { passed, failed } = split else {
            panic!("expected a split, got {split:?}");
        };
        assert!(!db.contains_block(id));
        assert_eq!(db.block_info(passed).unwrap().surfel_count, 4);
        assert_eq!(db.block_info(failed).unwrap().surfel_count, 6);
        assert_eq!(db.surfel_count(), 10);
        assert_eq!(db.block_info(passed).unwrap().pin_count, 0);
    }

    #[test]
    fn test_split_block_one_sided() {
        let db = SurfelDatabase::new();
        let id = db.insert_block(block(3)).unwrap().id();
        assert_eq!(db.split_block(id, |_| true).unwrap(), BlockSplit::Unchanged { all_passed: true });
        assert_eq!(db.split_block(id, |_| false).unwrap(), BlockSplit::Unchanged { all_passed: false });
        assert!(db.contains_block(id));
    }

    #[test]
    fn test_stream_round_trip() {
        let db = SurfelDatabase::new();
        drop(db.insert_block(block(5)).unwrap());
        drop(db.insert_block(block(0)).unwrap());
        let mut buf = std::io::Cursor::new(Vec::new());
        db.write_stream(&mut buf).unwrap();

        let copy = SurfelDatabase::new();
        buf.set_position(0);
        copy.read_stream(&mut buf).unwrap();
        assert_eq!(copy.block_count(), 2);
        assert_eq!(copy.surfel_count(), 5);
        let first = copy.block_at(0).unwrap();
        let pin = copy.pin_block(first).unwrap();
        assert_eq!(pin.surfel(4).unwrap().map(|s| s.identifier), Some(5));
    }
}
