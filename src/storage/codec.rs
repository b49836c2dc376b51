//! Versioned surfel record codecs.
//!
//! One strategy per on-disk layout. All strategies decode into the current
//! [`Surfel`] representation and encode from it, dropping fields the older
//! layout cannot carry.
//!
//! | Version | Bytes | Layout |
//! |---------|-------|--------|
//! | 6       | 48    | pos f32×3, ts f32, normal i16×3, tangent i16×3, radius u16×2, depth u16, elevation u16, id u32, attribute u32, rgb, flags |
//! | 5       | 44    | v6 minus depth/elevation; elevation packed in `attribute >> 16` |
//! | 4       | 40    | v5 minus attribute |
//! | 3       | 24    | pos f32×3, normal i16×3, radius u16, rgb, flags |
//! | ≤ 2     | 16    | pos f32×3, rgb, flags |

use crate::model::{Surfel, SurfelFlags};
use crate::{Error, Result};

use super::FormatVersion;

/// Encode/decode of one record layout.
pub trait SurfelCodec: Send + Sync {
    fn record_size(&self) -> usize;

    /// Decode the record at the start of `bytes`. `swap` is set when the
    /// file's byte order differs from the host's. Fails with
    /// [`Error::Format`] when fewer than [`record_size`](Self::record_size)
    /// bytes are given.
    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel>;

    /// Append one record in the file's byte order.
    fn encode(&self, surfel: &Surfel, swap: bool, out: &mut Vec<u8>);

    /// Decode consecutive records. A trailing partial record is an error.
    fn decode_all(&self, bytes: &[u8], swap: bool) -> Result<Vec<Surfel>> {
        if bytes.len() % self.record_size() != 0 {
            return Err(Error::Format(format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                self.record_size()
            )));
        }
        bytes
            .chunks_exact(self.record_size())
            .map(|chunk| self.decode(chunk, swap))
            .collect()
    }

    fn encode_all(&self, surfels: &[Surfel], swap: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(surfels.len() * self.record_size());
        for s in surfels {
            self.encode(s, swap, &mut out);
        }
        out
    }
}

/// Strategy for `version`. Versions below 3 share the 16-byte layout.
pub fn codec_for(version: FormatVersion) -> &'static dyn SurfelCodec {
    match version.major {
        6.. => &CodecV6,
        5 => &CodecV5,
        4 => &CodecV4,
        3 => &CodecV3,
        _ => &CodecV2,
    }
}

/// Reader over the first `size` bytes of `bytes`.
fn record_reader(bytes: &[u8], size: usize, swap: bool) -> Result<ByteReader<'_>> {
    match bytes.get(..size) {
        Some(record) => Ok(ByteReader::new(record, swap)),
        None => Err(Error::Format(format!("surfel record needs {size} bytes, got {}", bytes.len()))),
    }
}

// ============================================================================
// Byte cursors
// ============================================================================

/// Little cursor over a fixed buffer with optional byte swapping.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    swap: bool,
}

macro_rules! read_scalar {
    ($name:ident, $t:ty) => {
        pub(crate) fn $name(&mut self) -> $t {
            const N: usize = std::mem::size_of::<$t>();
            let mut raw = [0u8; N];
            raw.copy_from_slice(&self.buf[self.pos..self.pos + N]);
            self.pos += N;
            if self.swap {
                raw.reverse();
            }
            <$t>::from_ne_bytes(raw)
        }
    };
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], swap: bool) -> Self {
        Self { buf, pos: 0, swap }
    }

    pub(crate) fn set_swap(&mut self, swap: bool) {
        self.swap = swap;
    }

    pub(crate) fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    pub(crate) fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    read_scalar!(i16, i16);
    read_scalar!(u16, u16);
    read_scalar!(i32, i32);
    read_scalar!(u32, u32);
    read_scalar!(i64, i64);
    read_scalar!(u64, u64);
    read_scalar!(f32, f32);
    read_scalar!(f64, f64);
}

/// Appending counterpart of [`ByteReader`].
pub(crate) struct ByteWriter<'a> {
    out: &'a mut Vec<u8>,
    swap: bool,
}

macro_rules! write_scalar {
    ($name:ident, $t:ty) => {
        pub(crate) fn $name(&mut self, v: $t) {
            let mut raw = v.to_ne_bytes();
            if self.swap {
                raw.reverse();
            }
            self.out.extend_from_slice(&raw);
        }
    };
}

impl<'a> ByteWriter<'a> {
    pub(crate) fn new(out: &'a mut Vec<u8>, swap: bool) -> Self {
        Self { out, swap }
    }

    pub(crate) fn zeros(&mut self, n: usize) {
        self.out.resize(self.out.len() + n, 0);
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b);
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    write_scalar!(i16, i16);
    write_scalar!(u16, u16);
    write_scalar!(i32, i32);
    write_scalar!(u32, u32);
    write_scalar!(i64, i64);
    write_scalar!(u64, u64);
    write_scalar!(f32, f32);
    write_scalar!(f64, f64);
}

// ============================================================================
// Field groups shared between layouts
// ============================================================================

fn read_position(r: &mut ByteReader<'_>) -> [f32; 3] {
    [r.f32(), r.f32(), r.f32()]
}

fn read_vector(r: &mut ByteReader<'_>) -> [i16; 3] {
    [r.i16(), r.i16(), r.i16()]
}

fn read_color_flags(r: &mut ByteReader<'_>, s: &mut Surfel) {
    s.color = [r.u8(), r.u8(), r.u8()];
    s.flags = SurfelFlags::from_bits_retain(r.u8());
}

fn write_position(w: &mut ByteWriter<'_>, s: &Surfel) {
    s.position.iter().for_each(|&c| w.f32(c));
}

fn write_vector(w: &mut ByteWriter<'_>, v: &[i16; 3]) {
    v.iter().for_each(|&c| w.i16(c));
}

fn write_color_flags(w: &mut ByteWriter<'_>, s: &Surfel) {
    s.color.iter().for_each(|&c| w.u8(c));
    w.u8(s.flags.bits());
}

/// Position, timestamp, normal, tangent and both radii: the common prefix of
/// layouts 4 through 6.
fn read_oriented_prefix(r: &mut ByteReader<'_>) -> Surfel {
    Surfel {
        position: read_position(r),
        timestamp: r.f32(),
        normal: read_vector(r),
        tangent: read_vector(r),
        radius: [r.u16(), r.u16()],
        ..Surfel::default()
    }
}

fn write_oriented_prefix(w: &mut ByteWriter<'_>, s: &Surfel) {
    write_position(w, s);
    w.f32(s.timestamp);
    write_vector(w, &s.normal);
    write_vector(w, &s.tangent);
    w.u16(s.radius[0]);
    w.u16(s.radius[1]);
}

// ============================================================================
// Strategies
// ============================================================================

/// Current layout, 48 bytes.
pub struct CodecV6;

impl SurfelCodec for CodecV6 {
    fn record_size(&self) -> usize {
        48
    }

    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel> {
        let mut r = record_reader(bytes, self.record_size(), swap)?;
        let mut s = read_oriented_prefix(&mut r);
        s.depth = r.u16();
        s.elevation = r.u16();
        s.identifier = r.u32();
        s.attribute = r.u32();
        read_color_flags(&mut r, &mut s);
        Ok(s)
    }

    fn encode(&self, s: &Surfel, swap: bool, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out, swap);
        write_oriented_prefix(&mut w, s);
        w.u16(s.depth);
        w.u16(s.elevation);
        w.u32(s.identifier);
        w.u32(s.attribute);
        write_color_flags(&mut w, s);
    }
}

/// 44 bytes; elevation rides in the high half of the attribute.
pub struct CodecV5;

impl SurfelCodec for CodecV5 {
    fn record_size(&self) -> usize {
        44
    }

    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel> {
        let mut r = record_reader(bytes, self.record_size(), swap)?;
        let mut s = read_oriented_prefix(&mut r);
        s.identifier = r.u32();
        let attribute = r.u32();
        let packed = (attribute >> 16) as u16;
        if packed != 0 {
            s.elevation = packed;
            s.attribute = attribute & 0xFFFF;
        } else {
            s.attribute = attribute;
        }
        read_color_flags(&mut r, &mut s);
        Ok(s)
    }

    fn encode(&self, s: &Surfel, swap: bool, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out, swap);
        write_oriented_prefix(&mut w, s);
        w.u32(s.identifier);
        let attribute = if s.elevation != 0 {
            (s.attribute & 0xFFFF) | ((s.elevation as u32) << 16)
        } else {
            s.attribute
        };
        w.u32(attribute);
        write_color_flags(&mut w, s);
    }
}

/// 40 bytes.
pub struct CodecV4;

impl SurfelCodec for CodecV4 {
    fn record_size(&self) -> usize {
        40
    }

    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel> {
        let mut r = record_reader(bytes, self.record_size(), swap)?;
        let mut s = read_oriented_prefix(&mut r);
        s.identifier = r.u32();
        read_color_flags(&mut r, &mut s);
        Ok(s)
    }

    fn encode(&self, s: &Surfel, swap: bool, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out, swap);
        write_oriented_prefix(&mut w, s);
        w.u32(s.identifier);
        write_color_flags(&mut w, s);
    }
}

/// 24 bytes, isotropic radius.
pub struct CodecV3;

impl SurfelCodec for CodecV3 {
    fn record_size(&self) -> usize {
        24
    }

    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel> {
        let mut r = record_reader(bytes, self.record_size(), swap)?;
        let mut s = Surfel {
            position: read_position(&mut r),
            normal: read_vector(&mut r),
            ..Surfel::default()
        };
        let radius = r.u16();
        s.radius = [radius, radius];
        read_color_flags(&mut r, &mut s);
        Ok(s)
    }

    fn encode(&self, s: &Surfel, swap: bool, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out, swap);
        write_position(&mut w, s);
        write_vector(&mut w, &s.normal);
        w.u16(s.radius[0]);
        write_color_flags(&mut w, s);
    }
}

/// 16 bytes: position and color only.
pub struct CodecV2;

impl SurfelCodec for CodecV2 {
    fn record_size(&self) -> usize {
        16
    }

    fn decode(&self, bytes: &[u8], swap: bool) -> Result<Surfel> {
        let mut r = record_reader(bytes, self.record_size(), swap)?;
        let mut s = Surfel {
            position: read_position(&mut r),
            ..Surfel::default()
        };
        read_color_flags(&mut r, &mut s);
        Ok(s)
    }

    fn encode(&self, s: &Surfel, swap: bool, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out, swap);
        write_position(&mut w, s);
        write_color_flags(&mut w, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use pretty_assertions::assert_eq;

    fn sample() -> Surfel {
        Surfel::new(Vec3::new(1.5, -2.0, 0.25))
            .with_normal(Vec3::Z)
            .with_tangent(Vec3::X)
            .with_radii(0.05, 0.1)
            .with_timestamp(3.5)
            .with_depth(7.0)
            .with_elevation(-2.5)
            .with_identifier(42)
            .with_attribute(0x1234)
            .with_color([10, 20, 30])
            .with_flags(SurfelFlags::ACTIVE | SurfelFlags::AERIAL)
    }

    #[test]
    fn test_record_sizes_match_encoded_length() {
        for major in 2..=6 {
            let codec = codec_for(FormatVersion::new(major, 0));
            let mut out = Vec::new();
            codec.encode(&sample(), false, &mut out);
            assert_eq!(out.len(), codec.record_size(), "v{major}");
        }
    }

    #[test]
    fn test_v6_preserves_every_field() {
        let codec = codec_for(FormatVersion::CURRENT);
        let bytes = codec.encode_all(&[sample()], false);
        assert_eq!(codec.decode(&bytes, false).unwrap(), sample());
    }

    #[test]
    fn test_v5_packs_elevation_into_attribute() {
        let s = sample();
        let bytes = CodecV5.encode_all(&[s], false);
        let raw_attribute = u32::from_ne_bytes(bytes[36..40].try_into().unwrap());
        assert_eq!(raw_attribute >> 16, s.elevation as u32);
        assert_eq!(raw_attribute & 0xFFFF, 0x1234);

        let decoded = CodecV5.decode(&bytes, false).unwrap();
        assert_eq!(decoded.elevation(), Some(-2.5));
        assert_eq!(decoded.attribute, 0x1234);
        assert_eq!(decoded.depth, 0);
    }

    #[test]
    fn test_v3_duplicates_radius() {
        let bytes = CodecV3.encode_all(&[sample()], false);
        let decoded = CodecV3.decode(&bytes, false).unwrap();
        assert_eq!(decoded.radius, [sample().radius[0]; 2]);
        assert_eq!(decoded.normal, sample().normal);
        assert_eq!(decoded.timestamp, 0.0);
    }

    #[test]
    fn test_swapped_decode_matches_native() {
        let native = CodecV6.encode_all(&[sample()], false);
        let swapped = CodecV6.encode_all(&[sample()], true);
        assert_ne!(native, swapped);
        assert_eq!(CodecV6.decode(&swapped, true).unwrap(), sample());
    }

    #[test]
    fn test_short_input_is_a_format_error() {
        let bytes = CodecV6.encode_all(&[sample()], false);
        for major in 2..=6 {
            let codec = codec_for(FormatVersion::new(major, 0));
            let short = &bytes[..codec.record_size() - 1];
            assert!(matches!(codec.decode(short, false), Err(Error::Format(_))), "v{major}");
        }
        assert!(matches!(CodecV6.decode_all(&bytes[..47], false), Err(Error::Format(_))));
        assert_eq!(CodecV6.decode_all(&[], false).unwrap(), Vec::<Surfel>::new());
    }
}
