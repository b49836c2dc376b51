//! Database file header and block directory entries.

use std::io::{Read, Write};

use glam::DVec3;

use super::FormatVersion;
use super::block::{BlockFlags, SurfelBlock};
use super::codec::{ByteReader, ByteWriter};
use crate::model::{BBox, Interval};
use crate::{Error, Result};

pub(crate) const MAGIC: &[u8] = b"R3SurfelDatabase";
const MAGIC_LEN: usize = 32;
const HEADER_PADDING: usize = 1004;
const RECORD_PADDING: usize = 32;
/// magic + two endian tests + major + minor
const PREFIX_LEN: usize = MAGIC_LEN + 16;

pub(crate) const DIRECTORY_ENTRY_LEN: usize = 8 + 4 + 4 + 24 + 48 + 8 + 4 + 8 + 16 + 4 + 4 + RECORD_PADDING;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileHeader {
    pub version: FormatVersion,
    pub directory_offset: u64,
    pub directory_capacity: u32,
    pub block_count: u32,
    pub surfel_count: i64,
    pub bbox: BBox,
    pub timestamp_range: Interval,
    pub max_identifier: u32,
}

impl FileHeader {
    pub fn len(version: FormatVersion) -> usize {
        let count_len = if version.major < 4 { 4 } else { 8 };
        PREFIX_LEN + 8 + 4 + 4 + count_len + 48 + 16 + 4 + HEADER_PADDING
    }

    pub fn write_to(&self, w: &mut dyn Write, swap: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(Self::len(self.version));
        let mut out = ByteWriter::new(&mut buf, swap);
        let mut magic = [0u8; MAGIC_LEN];
        magic[..MAGIC.len()].copy_from_slice(MAGIC);
        out.bytes(&magic);
        out.u32(1);
        out.u32(1);
        out.u32(self.version.major);
        out.u32(self.version.minor);
        out.u64(self.directory_offset);
        out.u32(self.directory_capacity);
        out.u32(self.block_count);
        if self.version.major < 4 {
            out.i32(self.surfel_count as i32);
        } else {
            out.i64(self.surfel_count);
        }
        self.bbox.to_array().iter().for_each(|&v| out.f64(v));
        out.f64(self.timestamp_range.min);
        out.f64(self.timestamp_range.max);
        out.u32(self.max_identifier);
        out.zeros(HEADER_PADDING);
        w.write_all(&buf)?;
        Ok(())
    }

    /// Returns the header and whether the file's byte order is swapped.
    pub fn read_from(r: &mut dyn Read) -> Result<(Self, bool)> {
        let mut prefix = [0u8; PREFIX_LEN];
        r.read_exact(&mut prefix)?;
        let mut input = ByteReader::new(&prefix, false);

        let magic = input.bytes(MAGIC_LEN);
        let end = magic.iter().position(|&b| b == 0).unwrap_or(MAGIC_LEN);
        if &magic[..end] != MAGIC {
            return Err(Error::Format(format!(
                "bad database magic {:?}",
                String::from_utf8_lossy(&magic[..end])
            )));
        }

        let swap = input.u32() != 1;
        input.set_swap(swap);
        if input.u32() != 1 {
            return Err(Error::Format("endian test failed".into()));
        }
        let version = FormatVersion::new(input.u32(), input.u32());
        version.validate()?;

        let mut rest = vec![0u8; Self::len(version) - PREFIX_LEN];
        r.read_exact(&mut rest)?;
        let mut input = ByteReader::new(&rest, swap);
        let directory_offset = input.u64();
        let directory_capacity = input.u32();
        let block_count = input.u32();
        let surfel_count = if version.major < 4 { input.i32() as i64 } else { input.i64() };
        let mut bbox = [0.0; 6];
        bbox.iter_mut().for_each(|v| *v = input.f64());
        let timestamp_range = Interval::new(input.f64(), input.f64());
        let max_identifier = input.u32();

        let header = Self {
            version,
            directory_offset,
            directory_capacity,
            block_count,
            surfel_count,
            bbox: BBox::from_array(bbox),
            timestamp_range,
            max_identifier,
        };
        Ok((header, swap))
    }
}

/// One block's entry in the file directory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DirectoryEntry {
    pub offset: u64,
    pub capacity: u32,
    pub surfel_count: i32,
    pub origin: DVec3,
    pub bbox: BBox,
    pub resolution: f64,
    pub flags: u32,
    pub timestamp_origin: f64,
    pub timestamp_range: Interval,
    pub max_identifier: u32,
    pub min_identifier: u32,
}

impl DirectoryEntry {
    pub fn from_block(block: &SurfelBlock, offset: u64, capacity: u32) -> Self {
        Self {
            offset,
            capacity,
            surfel_count: block.surfel_count as i32,
            origin: block.origin,
            bbox: block.bbox,
            resolution: block.resolution,
            flags: (block.flags - BlockFlags::RUNTIME).bits(),
            timestamp_origin: block.timestamp_origin,
            timestamp_range: block.timestamp_range,
            max_identifier: block.identifier_range.1,
            min_identifier: block.identifier_range.0,
        }
    }

    /// Non-resident block described by this entry.
    pub fn to_block(&self) -> SurfelBlock {
        let mut block = SurfelBlock::shell(self.origin, self.timestamp_origin, self.surfel_count.max(0) as usize);
        block.bbox = self.bbox;
        block.resolution = self.resolution;
        block.flags = BlockFlags::from_bits_truncate(self.flags) - BlockFlags::RUNTIME;
        block.timestamp_range = self.timestamp_range;
        block.identifier_range = (self.min_identifier, self.max_identifier);
        block.file_offset = self.offset;
        block.file_capacity = self.capacity;
        block
    }

    /// Check the entry's records against an image of `image_len` bytes: the
    /// count must fit the region's capacity and the region must end inside
    /// the image.
    pub fn check_region(&self, record_size: usize, image_len: u64) -> Result<()> {
        let count = u64::try_from(self.surfel_count)
            .map_err(|_| Error::Format(format!("negative surfel count {}", self.surfel_count)))?;
        if count == 0 {
            return Ok(());
        }
        if count > self.capacity as u64 {
            return Err(Error::Format(format!(
                "block holds {count} surfels but its region has room for {}",
                self.capacity
            )));
        }
        let end = self.offset.checked_add(count * record_size as u64);
        match end {
            Some(end) if self.offset > 0 && end <= image_len => Ok(()),
            _ => Err(Error::Format(format!(
                "block region at {} for {count} surfels runs past the {image_len}-byte image",
                self.offset
            ))),
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>, swap: bool) {
        let mut out = ByteWriter::new(buf, swap);
        out.u64(self.offset);
        out.u32(self.capacity);
        out.i32(self.surfel_count);
        out.f64(self.origin.x);
        out.f64(self.origin.y);
        out.f64(self.origin.z);
        self.bbox.to_array().iter().for_each(|&v| out.f64(v));
        out.f64(self.resolution);
        out.u32(self.flags);
        out.f64(self.timestamp_origin);
        out.f64(self.timestamp_range.min);
        out.f64(self.timestamp_range.max);
        out.u32(self.max_identifier);
        out.u32(self.min_identifier);
        out.zeros(RECORD_PADDING);
    }

    pub fn read_from(bytes: &[u8], swap: bool) -> Self {
        let mut input = ByteReader::new(bytes, swap);
        let offset = input.u64();
        let capacity = input.u32();
        let surfel_count = input.i32();
        let origin = DVec3::new(input.f64(), input.f64(), input.f64());
        let mut bbox = [0.0; 6];
        bbox.iter_mut().for_each(|v| *v = input.f64());
        let resolution = input.f64();
        let flags = input.u32();
        let timestamp_origin = input.f64();
        let timestamp_range = Interval::new(input.f64(), input.f64());
        let max_identifier = input.u32();
        let min_identifier = input.u32();
        input.skip(RECORD_PADDING);
        Self {
            offset,
            capacity,
            surfel_count,
            origin,
            bbox: BBox::from_array(bbox),
            resolution,
            flags,
            timestamp_origin,
            timestamp_range,
            max_identifier,
            min_identifier,
        }
    }
}

/// Read `count` consecutive directory entries. `available` is the number of
/// bytes left in the image at the directory offset.
pub(crate) fn read_directory(r: &mut dyn Read, count: usize, swap: bool, available: u64) -> Result<Vec<DirectoryEntry>> {
    let len = (count as u64)
        .checked_mul(DIRECTORY_ENTRY_LEN as u64)
        .filter(|&len| len <= available)
        .ok_or_else(|| {
            Error::Format(format!("directory of {count} entries does not fit in the remaining {available} bytes"))
        })?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf
        .chunks_exact(DIRECTORY_ENTRY_LEN)
        .map(|chunk| DirectoryEntry::read_from(chunk, swap))
        .collect())
}

pub(crate) fn write_directory(w: &mut dyn Write, entries: &[DirectoryEntry], swap: bool) -> Result<()> {
    let mut buf = Vec::with_capacity(entries.len() * DIRECTORY_ENTRY_LEN);
    for entry in entries {
        entry.write_to(&mut buf, swap);
    }
    w.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header(version: FormatVersion) -> FileHeader {
        FileHeader {
            version,
            directory_offset: 4096,
            directory_capacity: 3,
            block_count: 2,
            surfel_count: 1_000_000,
            bbox: BBox::new(DVec3::new(-1.0, -2.0, -3.0), DVec3::new(1.0, 2.0, 3.0)),
            timestamp_range: Interval::new(10.0, 20.0),
            max_identifier: 77,
        }
    }

    #[test]
    fn test_header_length() {
        assert_eq!(FileHeader::len(FormatVersion::CURRENT), 1144);
        assert_eq!(FileHeader::len(FormatVersion::new(3, 0)), 1140);
        assert_eq!(DIRECTORY_ENTRY_LEN, 164);
    }

    #[test]
    fn test_header_round_trip_both_byte_orders() {
        for swap in [false, true] {
            let mut buf = Vec::new();
            header(FormatVersion::CURRENT).write_to(&mut buf, swap).unwrap();
            assert_eq!(buf.len(), 1144);
            let (read, swapped) = FileHeader::read_from(&mut buf.as_slice()).unwrap();
            assert_eq!(swapped, swap);
            assert_eq!(read, header(FormatVersion::CURRENT));
        }
    }

    #[test]
    fn test_legacy_header_uses_narrow_count() {
        let mut buf = Vec::new();
        header(FormatVersion::new(3, 0)).write_to(&mut buf, false).unwrap();
        assert_eq!(buf.len(), 1140);
        let (read, _) = FileHeader::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(read.surfel_count, 1_000_000);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        header(FormatVersion::CURRENT).write_to(&mut buf, false).unwrap();
        buf[0] = b'X';
        assert!(matches!(FileHeader::read_from(&mut buf.as_slice()), Err(Error::Format(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        header(FormatVersion::CURRENT).write_to(&mut buf, false).unwrap();
        buf[40..44].copy_from_slice(&9u32.to_ne_bytes());
        assert!(matches!(
            FileHeader::read_from(&mut buf.as_slice()),
            Err(Error::UnsupportedVersion { major: 9, .. })
        ));
    }

    #[test]
    fn test_directory_larger_than_image_is_rejected() {
        let mut bytes: &[u8] = &[0u8; DIRECTORY_ENTRY_LEN * 2];
        let err = read_directory(&mut bytes, u32::MAX as usize, false, (DIRECTORY_ENTRY_LEN * 2) as u64);
        assert!(matches!(err, Err(Error::Format(_))));
        let mut bytes: &[u8] = &[0u8; DIRECTORY_ENTRY_LEN * 2];
        assert_eq!(read_directory(&mut bytes, 2, false, (DIRECTORY_ENTRY_LEN * 2) as u64).unwrap().len(), 2);
    }

    #[test]
    fn test_block_region_checks() {
        let entry = DirectoryEntry::from_block(&SurfelBlock::shell(DVec3::ZERO, 0.0, 10), 2000, 10);
        assert!(entry.check_region(48, 2000 + 480).is_ok());
        assert!(matches!(entry.check_region(48, 2000 + 479), Err(Error::Format(_))));

        let over_capacity = DirectoryEntry { capacity: 4, ..entry.clone() };
        assert!(matches!(over_capacity.check_region(48, u64::MAX), Err(Error::Format(_))));
        let negative = DirectoryEntry { surfel_count: -1, ..entry.clone() };
        assert!(matches!(negative.check_region(48, u64::MAX), Err(Error::Format(_))));
        let wrapping = DirectoryEntry { offset: u64::MAX - 10, ..entry.clone() };
        assert!(matches!(wrapping.check_region(48, u64::MAX), Err(Error::Format(_))));
        let empty = DirectoryEntry { surfel_count: 0, offset: 0, ..entry };
        assert!(empty.check_region(48, 0).is_ok());
    }

    #[test]
    fn test_directory_entry_drops_runtime_flags() {
        let mut block = SurfelBlock::shell(DVec3::ONE, 5.0, 12);
        block.flags = BlockFlags::DIRTY | BlockFlags::HAS_NORMALS | BlockFlags::MULTIRESOLUTION;
        let entry = DirectoryEntry::from_block(&block, 2048, 12);
        let mut buf = Vec::new();
        entry.write_to(&mut buf, false);
        assert_eq!(buf.len(), DIRECTORY_ENTRY_LEN);
        let back = DirectoryEntry::read_from(&buf, false).to_block();
        assert_eq!(back.flags, BlockFlags::HAS_NORMALS | BlockFlags::MULTIRESOLUTION);
        assert_eq!(back.surfel_count, 12);
        assert_eq!(back.file_offset, 2048);
        assert!(!back.is_resident());
    }
}
