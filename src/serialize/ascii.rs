//! ASCII scene stream (`.ssa`).
//!
//! Whitespace-separated tokens, one entity per line, each line led by a
//! section tag (`N`, `O`, `L`, `F`, `OR`, `LR`, `A`, `S`, `I`, `OP`, `LP`).
//! Free text is escaped so it stays a single token. Reserved trailing
//! fields are written as zeros and skipped on read.
//!
//! Tokens are split on ASCII whitespace only, so any other character
//! (including Unicode spaces) is carried verbatim. The escaping is lossy:
//! `^`, `&` and `+` in the original text read back as tab, newline and
//! space, and empty text or the literal `None` read back as missing.

use std::io::{Read, Write};

use glam::{DVec2, DVec3};

use super::{
    AssignmentRecord, Counts, EdgeRecord, FeatureRecord, ImageRecord, LabelRecord, NodeRecord, ObjectRecord,
    SceneRecords, ScanRecord,
};
use crate::model::Rgb;
use crate::scene::{Camera, Distortion, Intrinsics, RollingShutter};
use crate::{Error, Result};

const MAGIC: &str = "SSA";
const VERSION: &str = "1.1";
const OVERHEAD_GRID: i32 = 2;
const POINTSET: i32 = 1;

/// Make free text a single token: tab becomes `^`, newline `&` and space
/// `+`. Missing or empty text is written `None`.
///
/// Carriage return and form feed have no escape and would split the token,
/// so text containing them is a [`Error::Format`].
pub fn escape(text: Option<&str>) -> Result<String> {
    match text {
        Some(t) if !t.is_empty() => t
            .chars()
            .map(|c| match c {
                '\t' => Ok('^'),
                '\n' => Ok('&'),
                ' ' => Ok('+'),
                '\r' | '\x0c' => Err(Error::Format(format!("{t:?} has a character with no ASCII escape"))),
                other => Ok(other),
            })
            .collect(),
        _ => Ok("None".to_string()),
    }
}

/// Inverse of [`escape`]; `None` reads back as missing.
pub fn unescape(token: &str) -> Option<String> {
    if token == "None" {
        return None;
    }
    Some(
        token
            .chars()
            .map(|c| match c {
                '^' => '\t',
                '&' => '\n',
                '+' => ' ',
                other => other,
            })
            .collect(),
    )
}

// ============================================================================
// Writing
// ============================================================================

fn write_list<W: Write, T: std::fmt::Display>(w: &mut W, values: &[T]) -> Result<()> {
    for v in values {
        write!(w, "{v} ")?;
    }
    writeln!(w)?;
    Ok(())
}

fn write_vec3<W: Write>(w: &mut W, v: DVec3) -> Result<()> {
    write!(w, " {} {} {}", v.x, v.y, v.z)?;
    Ok(())
}

fn write_camera<W: Write>(w: &mut W, c: &Camera) -> Result<()> {
    write_vec3(w, c.viewpoint)?;
    write_vec3(w, c.towards)?;
    write_vec3(w, c.up)
}

fn write_edge<W: Write>(w: &mut W, tag: &str, e: &EdgeRecord) -> Result<()> {
    write!(w, "{tag} {} {} {} 0 0 0 0", e.kind, e.members.len(), e.operands.len())?;
    for m in &e.members {
        write!(w, " {m}")?;
    }
    writeln!(w)?;
    for op in &e.operands {
        write!(w, " {op}")?;
    }
    writeln!(w)?;
    writeln!(w)?;
    Ok(())
}

fn write_property<W: Write>(w: &mut W, tag: &str, p: &EdgeRecord) -> Result<()> {
    let owner = p.members.first().copied().unwrap_or(-1);
    writeln!(w, "{tag} {} {owner} {} 0 0 0 0", p.kind, p.operands.len())?;
    for op in &p.operands {
        write!(w, " {op}")?;
    }
    writeln!(w)?;
    writeln!(w)?;
    Ok(())
}

pub(crate) fn write_records<W: Write>(r: &SceneRecords, w: &mut W) -> Result<()> {
    writeln!(w, "{MAGIC} {VERSION}")?;

    write!(w, "{}", escape(r.name.as_deref())?)?;
    for count in r.counts().to_array() {
        write!(w, " {count}")?;
    }
    writeln!(w, " 0 0 0")?;

    write!(w, "T")?;
    for row in &r.transformation {
        for v in row {
            write!(w, " {v}")?;
        }
    }
    writeln!(w)?;

    for c in &r.comments {
        writeln!(w, "C {}", escape(Some(c))?)?;
    }

    for n in &r.nodes {
        write!(w, "N {} {} {} {} 0 {} {}", escape(n.name.as_deref())?, n.parent, n.part_count, n.blocks.len(), n.complexity, n.resolution)?;
        writeln!(w, " 0 0 0 0 0 0 0 0")?;
        write_list(w, &n.blocks)?;
    }

    for o in &r.objects {
        write!(
            w,
            "O {} {} {} {} {} {} {} {}",
            escape(o.name.as_deref())?,
            o.identifier,
            o.parent,
            o.part_count,
            o.nodes.len(),
            o.values.len(),
            o.complexity,
            o.flags
        )?;
        writeln!(w, " 0 0 0 0 0 0 0")?;
        write_list(w, &o.values)?;
        write_list(w, &o.nodes)?;
    }

    for l in &r.labels {
        writeln!(
            w,
            "L {} {} {} 0 {} {} {} {} {} {} 0 0 0",
            escape(l.name.as_deref())?,
            l.identifier,
            l.keystroke,
            l.parent,
            l.part_count,
            l.color.r,
            l.color.g,
            l.color.b,
            l.flags
        )?;
    }

    for f in &r.features {
        writeln!(w, "F {} {} {} {} {} 1 0", escape(f.name.as_deref())?, f.minimum, f.maximum, f.weight, f.kind)?;
        if f.kind == OVERHEAD_GRID {
            writeln!(w, "{}", escape(f.filename.as_deref())?)?;
        }
    }

    for e in &r.object_relationships {
        write_edge(w, "OR", e)?;
    }
    for e in &r.label_relationships {
        write_edge(w, "LR", e)?;
    }

    for a in &r.assignments {
        writeln!(w, "A {} {} {} {} 0 0 0 0", a.object, a.label, a.confidence, a.originator)?;
    }

    for s in &r.scans {
        write!(w, "S {}", escape(s.name.as_deref())?)?;
        write_camera(w, &s.camera)?;
        let i = &s.intrinsics;
        writeln!(
            w,
            " {} {} {} {} {} {} {} {} {} 0",
            s.timestamp, s.node, i.width, i.height, i.xfocal, i.center.x, i.center.y, s.flags, i.yfocal
        )?;
    }

    for image in &r.images {
        write!(w, "I {}", escape(image.name.as_deref())?)?;
        write_camera(w, &image.camera)?;
        let i = &image.intrinsics;
        write!(
            w,
            " {} {} {} {} {} {} {} {} {} {} {} 0 0",
            image.timestamp,
            image.scan,
            i.width,
            i.height,
            i.xfocal,
            i.yfocal,
            i.center.x,
            i.center.y,
            image.flags,
            image.distortion.code(),
            u8::from(image.rolling_shutter.is_some())
        )?;
        if image.distortion != Distortion::None {
            let (radial, tangential) = image.distortion.coefficients();
            for v in radial.iter().chain(tangential.iter()) {
                write!(w, " {v}")?;
            }
        }
        if let Some(rs) = &image.rolling_shutter {
            write_camera(w, &rs.cameras[0])?;
            write_camera(w, &rs.cameras[1])?;
            write!(w, " {} {}", rs.timestamps[0], rs.timestamps[1])?;
        }
        writeln!(w)?;
    }

    for p in &r.object_properties {
        write_property(w, "OP", p)?;
    }
    for p in &r.label_properties {
        write_property(w, "LP", p)?;
    }
    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

struct Tokens<'a> {
    iter: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Result<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| Error::Format("unexpected end of ASCII scene stream".into()))
    }

    fn parse<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next()?;
        token
            .parse()
            .map_err(|_| Error::Format(format!("expected {what}, found {token:?}")))
    }

    fn i32(&mut self) -> Result<i32> {
        self.parse("integer")
    }

    fn u32(&mut self) -> Result<u32> {
        self.parse("unsigned integer")
    }

    fn f64(&mut self) -> Result<f64> {
        self.parse("number")
    }

    fn count(&mut self) -> Result<usize> {
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| Error::Format(format!("negative count {n}")))
    }

    fn text(&mut self) -> Result<Option<String>> {
        Ok(unescape(self.next()?))
    }

    fn vec3(&mut self) -> Result<DVec3> {
        Ok(DVec3::new(self.f64()?, self.f64()?, self.f64()?))
    }

    fn camera(&mut self) -> Result<Camera> {
        Ok(Camera::new(self.vec3()?, self.vec3()?, self.vec3()?))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.next()?;
        }
        Ok(())
    }

    fn tag(&mut self, expected: &str, index: usize) -> Result<()> {
        let token = self.next()?;
        if token != expected {
            return Err(Error::Format(format!("expected {expected} record {index}, found {token:?}")));
        }
        Ok(())
    }
}

fn parse_version(version: &str) -> Result<bool> {
    match version {
        "1.0" => Ok(false),
        "1.1" => Ok(true),
        other => {
            let mut parts = other.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
            Err(Error::UnsupportedVersion { major: parts.next().unwrap_or(0), minor: parts.next().unwrap_or(0) })
        }
    }
}

fn read_edge(t: &mut Tokens<'_>, tag: &str, index: usize) -> Result<EdgeRecord> {
    t.tag(tag, index)?;
    let kind = t.i32()?;
    let n = t.count()?;
    let nops = t.count()?;
    t.skip(4)?;
    let members = (0..n).map(|_| t.i32()).collect::<Result<Vec<_>>>()?;
    let operands = (0..nops).map(|_| t.f64()).collect::<Result<Vec<_>>>()?;
    Ok(EdgeRecord { kind, members, operands })
}

fn read_property(t: &mut Tokens<'_>, tag: &str, index: usize) -> Result<EdgeRecord> {
    t.tag(tag, index)?;
    let kind = t.i32()?;
    let owner = t.i32()?;
    let nops = t.count()?;
    t.skip(4)?;
    let operands = (0..nops).map(|_| t.f64()).collect::<Result<Vec<_>>>()?;
    Ok(EdgeRecord { kind, members: vec![owner], operands })
}

pub(crate) fn read_records<R: Read>(r: &mut R) -> Result<SceneRecords> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    let mut t = Tokens { iter: text.split_ascii_whitespace() };

    let magic = t.next()?;
    if magic != MAGIC {
        return Err(Error::Format(format!("bad ASCII scene magic {magic:?}")));
    }
    let has_transformation = parse_version(t.next()?)?;

    let mut records = SceneRecords { name: t.text()?, ..SceneRecords::default() };
    let mut raw = [0i32; 12];
    for v in raw.iter_mut() {
        *v = t.i32()?;
    }
    let counts = Counts::from_array(raw)?;
    t.skip(3)?;

    records.transformation = super::matrix_to_rows(&glam::DMat4::IDENTITY);
    if has_transformation {
        t.tag("T", 0)?;
        for row in records.transformation.iter_mut() {
            for v in row.iter_mut() {
                *v = t.f64()?;
            }
        }
    }

    for i in 0..counts.comments {
        t.tag("C", i)?;
        records.comments.push(t.text()?.unwrap_or_default());
    }

    for i in 0..counts.nodes {
        t.tag("N", i)?;
        let name = t.text()?;
        let parent = t.i32()?;
        let part_count = t.i32()?;
        let nblocks = t.count()?;
        t.skip(1)?;
        let complexity = t.f64()?;
        let resolution = t.f64()?;
        t.skip(8)?;
        let blocks = (0..nblocks).map(|_| t.i32()).collect::<Result<Vec<_>>>()?;
        records.nodes.push(NodeRecord { name, parent, part_count, complexity, resolution, blocks });
    }

    for i in 0..counts.objects {
        t.tag("O", i)?;
        let name = t.text()?;
        let identifier = t.i32()?;
        let parent = t.i32()?;
        let part_count = t.i32()?;
        let nnodes = t.count()?;
        let nvalues = t.count()?;
        let complexity = t.f64()?;
        let flags = t.u32()?;
        t.skip(7)?;
        let values = (0..nvalues).map(|_| t.f64()).collect::<Result<Vec<_>>>()?;
        let nodes = (0..nnodes).map(|_| t.i32()).collect::<Result<Vec<_>>>()?;
        records.objects.push(ObjectRecord { name, identifier, parent, part_count, complexity, flags, values, nodes });
    }

    for i in 0..counts.labels {
        t.tag("L", i)?;
        let name = t.text()?;
        let identifier = t.i32()?;
        let keystroke = t.i32()?;
        t.skip(1)?;
        let parent = t.i32()?;
        let part_count = t.i32()?;
        let color = Rgb::new(t.f64()?, t.f64()?, t.f64()?);
        let flags = t.u32()?;
        t.skip(3)?;
        records.labels.push(LabelRecord { name, identifier, keystroke, parent, part_count, color, flags });
    }

    for i in 0..counts.features {
        t.tag("F", i)?;
        let name = t.text()?;
        let minimum = t.f64()?;
        let maximum = t.f64()?;
        let mut weight = t.f64()?;
        let mut kind = t.i32()?;
        let format = t.i32()?;
        t.skip(1)?;
        if format == 0 {
            weight = 1.0;
            kind = POINTSET;
        }
        let filename = if kind == OVERHEAD_GRID { t.text()? } else { None };
        records.features.push(FeatureRecord { name, minimum, maximum, weight, kind, filename });
    }

    for i in 0..counts.object_relationships {
        records.object_relationships.push(read_edge(&mut t, "OR", i)?);
    }
    for i in 0..counts.label_relationships {
        records.label_relationships.push(read_edge(&mut t, "LR", i)?);
    }

    for i in 0..counts.assignments {
        t.tag("A", i)?;
        let object = t.i32()?;
        let label = t.i32()?;
        let confidence = t.f64()?;
        let originator = t.i32()?;
        t.skip(4)?;
        records.assignments.push(AssignmentRecord { object, label, confidence, originator });
    }

    for i in 0..counts.scans {
        t.tag("S", i)?;
        let name = t.text()?;
        let camera = t.camera()?;
        let timestamp = t.f64()?;
        let node = t.i32()?;
        let width = t.i32()?;
        let height = t.i32()?;
        let xfocal = t.f64()?;
        let center = DVec2::new(t.f64()?, t.f64()?);
        let flags = t.u32()?;
        let yfocal = t.f64()?;
        t.skip(1)?;
        let intrinsics = Intrinsics { width, height, xfocal, yfocal, center };
        records.scans.push(ScanRecord { name, camera, timestamp, node, intrinsics, flags });
    }

    for i in 0..counts.images {
        t.tag("I", i)?;
        let name = t.text()?;
        let camera = t.camera()?;
        let timestamp = t.f64()?;
        let scan = t.i32()?;
        let width = t.i32()?;
        let height = t.i32()?;
        let xfocal = t.f64()?;
        let yfocal = t.f64()?;
        let center = DVec2::new(t.f64()?, t.f64()?);
        let flags = t.u32()?;
        let distortion_code = t.i32()?;
        let rolling = t.i32()? != 0;
        t.skip(2)?;
        let distortion = if distortion_code != 0 {
            let radial = [t.f64()?, t.f64()?, t.f64()?];
            let tangential = [t.f64()?, t.f64()?];
            Distortion::from_code(distortion_code, radial, tangential)?
        } else {
            Distortion::None
        };
        let rolling_shutter = if rolling {
            let cameras = [t.camera()?, t.camera()?];
            let timestamps = [t.f64()?, t.f64()?];
            Some(RollingShutter { cameras, timestamps })
        } else {
            None
        };
        let intrinsics = Intrinsics { width, height, xfocal, yfocal, center };
        records.images.push(ImageRecord { name, camera, timestamp, scan, intrinsics, flags, distortion, rolling_shutter });
    }

    for i in 0..counts.object_properties {
        records.object_properties.push(read_property(&mut t, "OP", i)?);
    }
    for i in 0..counts.label_properties {
        records.label_properties.push(read_property(&mut t, "LP", i)?);
    }

    Ok(records)
}
