//! Binary scene stream (`.ssx`).
//!
//! Same section order as the ASCII stream. Integers are `i32` and reals
//! `f64` in host byte order; every string occupies a fixed 256-byte
//! NUL-padded slot. The stream opens with a 16-byte magic slot carrying the
//! version.

use std::io::{Read, Write};

use glam::{DVec2, DVec3};

use super::{
    AssignmentRecord, Counts, EdgeRecord, FeatureRecord, ImageRecord, LabelRecord, NodeRecord, ObjectRecord,
    SceneRecords, ScanRecord,
};
use crate::model::Rgb;
use crate::scene::{Camera, Distortion, Intrinsics, RollingShutter};
use crate::storage::codec::{ByteReader, ByteWriter};
use crate::{Error, Result};

const MAGIC_LEN: usize = 16;
const STRING_LEN: usize = 256;
const OVERHEAD_GRID: i32 = 2;

// ============================================================================
// Writing
// ============================================================================

fn put_string(w: &mut ByteWriter<'_>, text: Option<&str>) {
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => "None",
    };
    // Truncate on a char boundary, keeping at least one NUL.
    let mut end = text.len().min(STRING_LEN - 1);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    w.bytes(&text.as_bytes()[..end]);
    w.zeros(STRING_LEN - end);
}

fn put_ints(w: &mut ByteWriter<'_>, values: &[i32]) {
    values.iter().for_each(|&v| w.i32(v));
}

fn put_reals(w: &mut ByteWriter<'_>, values: &[f64]) {
    values.iter().for_each(|&v| w.f64(v));
}

fn put_camera(w: &mut ByteWriter<'_>, c: &Camera) {
    for v in [c.viewpoint, c.towards, c.up] {
        put_reals(w, &v.to_array());
    }
}

fn put_edge(w: &mut ByteWriter<'_>, e: &EdgeRecord) {
    put_ints(w, &[e.kind, e.members.len() as i32, e.operands.len() as i32, 0, 0, 0, 0]);
    put_ints(w, &e.members);
    put_reals(w, &e.operands);
}

fn put_property(w: &mut ByteWriter<'_>, p: &EdgeRecord) {
    let owner = p.members.first().copied().unwrap_or(-1);
    put_ints(w, &[p.kind, owner, p.operands.len() as i32, 0, 0, 0, 0]);
    put_reals(w, &p.operands);
}

pub(crate) fn write_records<W: Write>(r: &SceneRecords, w: &mut W) -> Result<()> {
    let mut buf = Vec::new();
    let mut out = ByteWriter::new(&mut buf, false);

    let magic = b"SSB 1.1";
    out.bytes(magic);
    out.zeros(MAGIC_LEN - magic.len());

    put_string(&mut out, r.name.as_deref());
    for count in r.counts().to_array() {
        out.i32(count as i32);
    }
    out.zeros(3 * 4);
    for row in &r.transformation {
        put_reals(&mut out, row);
    }

    for c in &r.comments {
        put_string(&mut out, Some(c));
    }

    for n in &r.nodes {
        put_string(&mut out, n.name.as_deref());
        put_ints(&mut out, &[n.parent, n.part_count, n.blocks.len() as i32]);
        put_reals(&mut out, &[n.complexity, n.resolution]);
        out.zeros(8 * 4);
        put_ints(&mut out, &n.blocks);
    }

    for o in &r.objects {
        put_string(&mut out, o.name.as_deref());
        put_ints(&mut out, &[o.identifier, o.parent, o.part_count, o.nodes.len() as i32, o.values.len() as i32]);
        out.f64(o.complexity);
        out.u32(o.flags);
        out.zeros(7 * 4);
        put_reals(&mut out, &o.values);
        put_ints(&mut out, &o.nodes);
    }

    for l in &r.labels {
        put_string(&mut out, l.name.as_deref());
        put_ints(&mut out, &[l.identifier, l.keystroke, l.parent, l.part_count]);
        put_reals(&mut out, &[l.color.r, l.color.g, l.color.b]);
        out.u32(l.flags);
        out.zeros(3 * 4);
    }

    for f in &r.features {
        put_string(&mut out, f.name.as_deref());
        put_reals(&mut out, &[f.minimum, f.maximum, f.weight]);
        out.i32(f.kind);
        out.zeros(4 * 4);
        if f.kind == OVERHEAD_GRID {
            put_string(&mut out, f.filename.as_deref());
        }
    }

    for e in &r.object_relationships {
        put_edge(&mut out, e);
    }
    for e in &r.label_relationships {
        put_edge(&mut out, e);
    }

    for a in &r.assignments {
        put_ints(&mut out, &[a.object, a.label]);
        out.f64(a.confidence);
        out.i32(a.originator);
        out.zeros(4 * 4);
    }

    for s in &r.scans {
        put_string(&mut out, s.name.as_deref());
        put_camera(&mut out, &s.camera);
        out.f64(s.timestamp);
        let i = &s.intrinsics;
        put_ints(&mut out, &[s.node, i.width, i.height]);
        put_reals(&mut out, &[i.xfocal, i.center.x, i.center.y]);
        out.u32(s.flags);
        out.f64(i.yfocal);
        out.zeros(4 * 4);
    }

    for image in &r.images {
        put_string(&mut out, image.name.as_deref());
        put_camera(&mut out, &image.camera);
        out.f64(image.timestamp);
        let i = &image.intrinsics;
        put_ints(&mut out, &[image.scan, i.width, i.height]);
        put_reals(&mut out, &[i.xfocal, i.yfocal, i.center.x, i.center.y]);
        out.u32(image.flags);
        put_ints(&mut out, &[image.distortion.code(), i32::from(image.rolling_shutter.is_some())]);
        out.zeros(3 * 4);
        if image.distortion != Distortion::None {
            let (radial, tangential) = image.distortion.coefficients();
            put_reals(&mut out, &radial);
            put_reals(&mut out, &tangential);
        }
        if let Some(rs) = &image.rolling_shutter {
            put_camera(&mut out, &rs.cameras[0]);
            put_camera(&mut out, &rs.cameras[1]);
            put_reals(&mut out, &rs.timestamps);
        }
    }

    for p in &r.object_properties {
        put_property(&mut out, p);
    }
    for p in &r.label_properties {
        put_property(&mut out, p);
    }

    w.write_all(&buf)?;
    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

/// Bounds-checked wrapper: every read first claims its bytes, so a short
/// stream is a format error rather than a panic.
struct Input<'a> {
    reader: ByteReader<'a>,
    remaining: usize,
}

impl<'a> Input<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { reader: ByteReader::new(buf, false), remaining: buf.len() }
    }

    fn claim(&mut self, n: usize) -> Result<()> {
        if n > self.remaining {
            return Err(Error::Format("unexpected end of binary scene stream".into()));
        }
        self.remaining -= n;
        Ok(())
    }

    fn i32(&mut self) -> Result<i32> {
        self.claim(4)?;
        Ok(self.reader.i32())
    }

    fn u32(&mut self) -> Result<u32> {
        self.claim(4)?;
        Ok(self.reader.u32())
    }

    fn f64(&mut self) -> Result<f64> {
        self.claim(8)?;
        Ok(self.reader.f64())
    }

    fn count(&mut self) -> Result<usize> {
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| Error::Format(format!("negative count {n}")))
    }

    fn skip_ints(&mut self, n: usize) -> Result<()> {
        self.claim(n * 4)?;
        self.reader.skip(n * 4);
        Ok(())
    }

    fn ints(&mut self, n: usize) -> Result<Vec<i32>> {
        (0..n).map(|_| self.i32()).collect()
    }

    fn reals(&mut self, n: usize) -> Result<Vec<f64>> {
        (0..n).map(|_| self.f64()).collect()
    }

    fn slot(&mut self, len: usize) -> Result<&'a [u8]> {
        self.claim(len)?;
        let raw = self.reader.bytes(len);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(&raw[..end])
    }

    fn string(&mut self) -> Result<Option<String>> {
        let raw = self.slot(STRING_LEN)?;
        let text = String::from_utf8_lossy(raw);
        Ok(match text.as_ref() {
            "" | "None" => None,
            _ => Some(text.into_owned()),
        })
    }

    fn vec3(&mut self) -> Result<DVec3> {
        Ok(DVec3::new(self.f64()?, self.f64()?, self.f64()?))
    }

    fn camera(&mut self) -> Result<Camera> {
        Ok(Camera::new(self.vec3()?, self.vec3()?, self.vec3()?))
    }

    fn edge(&mut self) -> Result<EdgeRecord> {
        let kind = self.i32()?;
        let n = self.count()?;
        let nops = self.count()?;
        self.skip_ints(4)?;
        Ok(EdgeRecord { kind, members: self.ints(n)?, operands: self.reals(nops)? })
    }

    fn property(&mut self) -> Result<EdgeRecord> {
        let kind = self.i32()?;
        let owner = self.i32()?;
        let nops = self.count()?;
        self.skip_ints(4)?;
        Ok(EdgeRecord { kind, members: vec![owner], operands: self.reals(nops)? })
    }
}

/// Whether the stream carries a transformation after the counts.
fn parse_magic(raw: &[u8]) -> Result<bool> {
    let text = String::from_utf8_lossy(raw);
    let version = text
        .strip_prefix("SSB ")
        .ok_or_else(|| Error::Format(format!("bad binary scene magic {text:?}")))?;
    match version {
        "1.0" => Ok(false),
        "1.1" => Ok(true),
        other => {
            let mut parts = other.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
            Err(Error::UnsupportedVersion { major: parts.next().unwrap_or(0), minor: parts.next().unwrap_or(0) })
        }
    }
}

pub(crate) fn read_records<R: Read>(r: &mut R) -> Result<SceneRecords> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    let mut input = Input::new(&buf);

    let has_transformation = parse_magic(input.slot(MAGIC_LEN)?)?;
    let mut records = SceneRecords { name: input.string()?, ..SceneRecords::default() };
    let mut raw = [0i32; 12];
    for v in raw.iter_mut() {
        *v = input.i32()?;
    }
    let counts = Counts::from_array(raw)?;
    input.skip_ints(3)?;

    records.transformation = super::matrix_to_rows(&glam::DMat4::IDENTITY);
    if has_transformation {
        for row in records.transformation.iter_mut() {
            for v in row.iter_mut() {
                *v = input.f64()?;
            }
        }
    }

    for _ in 0..counts.comments {
        records.comments.push(input.string()?.unwrap_or_default());
    }

    for _ in 0..counts.nodes {
        let name = input.string()?;
        let parent = input.i32()?;
        let part_count = input.i32()?;
        let nblocks = input.count()?;
        let complexity = input.f64()?;
        let resolution = input.f64()?;
        input.skip_ints(8)?;
        let blocks = input.ints(nblocks)?;
        records.nodes.push(NodeRecord { name, parent, part_count, complexity, resolution, blocks });
    }

    for _ in 0..counts.objects {
        let name = input.string()?;
        let identifier = input.i32()?;
        let parent = input.i32()?;
        let part_count = input.i32()?;
        let nnodes = input.count()?;
        let nvalues = input.count()?;
        let complexity = input.f64()?;
        let flags = input.u32()?;
        input.skip_ints(7)?;
        let values = input.reals(nvalues)?;
        let nodes = input.ints(nnodes)?;
        records.objects.push(ObjectRecord { name, identifier, parent, part_count, complexity, flags, values, nodes });
    }

    for _ in 0..counts.labels {
        let name = input.string()?;
        let identifier = input.i32()?;
        let keystroke = input.i32()?;
        let parent = input.i32()?;
        let part_count = input.i32()?;
        let color = Rgb::new(input.f64()?, input.f64()?, input.f64()?);
        let flags = input.u32()?;
        input.skip_ints(3)?;
        records.labels.push(LabelRecord { name, identifier, keystroke, parent, part_count, color, flags });
    }

    for _ in 0..counts.features {
        let name = input.string()?;
        let minimum = input.f64()?;
        let maximum = input.f64()?;
        let weight = input.f64()?;
        let kind = input.i32()?;
        input.skip_ints(4)?;
        let filename = if kind == OVERHEAD_GRID { input.string()? } else { None };
        records.features.push(FeatureRecord { name, minimum, maximum, weight, kind, filename });
    }

    for _ in 0..counts.object_relationships {
        records.object_relationships.push(input.edge()?);
    }
    for _ in 0..counts.label_relationships {
        records.label_relationships.push(input.edge()?);
    }

    for _ in 0..counts.assignments {
        let object = input.i32()?;
        let label = input.i32()?;
        let confidence = input.f64()?;
        let originator = input.i32()?;
        input.skip_ints(4)?;
        records.assignments.push(AssignmentRecord { object, label, confidence, originator });
    }

    for _ in 0..counts.scans {
        let name = input.string()?;
        let camera = input.camera()?;
        let timestamp = input.f64()?;
        let node = input.i32()?;
        let width = input.i32()?;
        let height = input.i32()?;
        let xfocal = input.f64()?;
        let center = DVec2::new(input.f64()?, input.f64()?);
        let flags = input.u32()?;
        let yfocal = input.f64()?;
        input.skip_ints(4)?;
        let intrinsics = Intrinsics { width, height, xfocal, yfocal, center };
        records.scans.push(ScanRecord { name, camera, timestamp, node, intrinsics, flags });
    }

    for _ in 0..counts.images {
        let name = input.string()?;
        let camera = input.camera()?;
        let timestamp = input.f64()?;
        let scan = input.i32()?;
        let width = input.i32()?;
        let height = input.i32()?;
        let xfocal = input.f64()?;
        let yfocal = input.f64()?;
        let center = DVec2::new(input.f64()?, input.f64()?);
        let flags = input.u32()?;
        let distortion_code = input.i32()?;
        let rolling = input.i32()? != 0;
        input.skip_ints(3)?;
        let distortion = if distortion_code != 0 {
            let radial = [input.f64()?, input.f64()?, input.f64()?];
            let tangential = [input.f64()?, input.f64()?];
            Distortion::from_code(distortion_code, radial, tangential)?
        } else {
            Distortion::None
        };
        let rolling_shutter = if rolling {
            let cameras = [input.camera()?, input.camera()?];
            let timestamps = [input.f64()?, input.f64()?];
            Some(RollingShutter { cameras, timestamps })
        } else {
            None
        };
        let intrinsics = Intrinsics { width, height, xfocal, yfocal, center };
        records.images.push(ImageRecord { name, camera, timestamp, scan, intrinsics, flags, distortion, rolling_shutter });
    }

    for _ in 0..counts.object_properties {
        records.object_properties.push(input.property()?);
    }
    for _ in 0..counts.label_properties {
        records.label_properties.push(input.property()?);
    }

    Ok(records)
}
