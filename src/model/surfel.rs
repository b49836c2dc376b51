//! The surfel record: one oriented, colored point sample.
//!
//! Fields are stored in their quantized on-disk representation so a block's
//! record array can be encoded without conversion. Accessors expose the
//! decoded floating-point view.

use bitflags::bitflags;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Quantization of unit vectors into `i16`.
pub const NORMAL_SCALE: f32 = 32767.0;
/// Quantization of radii into `u16` (units per meter).
pub const RADIUS_SCALE: f32 = 8192.0;
/// Quantization of depth into `u16` (units per meter).
pub const DEPTH_SCALE: f32 = 100.0;
/// Elevation is stored as `ELEVATION_SCALE * e + ELEVATION_OFFSET`; 0 means unset.
pub const ELEVATION_SCALE: f32 = 400.0;
pub const ELEVATION_OFFSET: f32 = 32768.0;

bitflags! {
    /// Per-surfel flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SurfelFlags: u8 {
        const ACTIVE = 0x01;
        const MARKED = 0x02;
        const AERIAL = 0x04;
        const SILHOUETTE_BOUNDARY = 0x10;
        const SHADOW_BOUNDARY = 0x20;
        const BORDER_BOUNDARY = 0x40;
    }
}

/// Encode an elevation in meters into its 16-bit packed form.
pub fn encode_elevation(elevation: f32) -> u16 {
    let enc = (ELEVATION_SCALE * elevation + ELEVATION_OFFSET).round();
    // 0 is reserved for "unset"
    enc.clamp(1.0, u16::MAX as f32) as u16
}

/// Decode a packed elevation; `None` when unset.
pub fn decode_elevation(enc: u16) -> Option<f32> {
    if enc == 0 {
        return None;
    }
    Some((enc as f32 - ELEVATION_OFFSET) / ELEVATION_SCALE)
}

fn quantize_unit(v: Vec3) -> [i16; 3] {
    let q = |c: f32| (c.clamp(-1.0, 1.0) * NORMAL_SCALE).round() as i16;
    [q(v.x), q(v.y), q(v.z)]
}

fn quantize_radius(r: f32) -> u16 {
    (r.max(0.0) * RADIUS_SCALE).round().min(u16::MAX as f32) as u16
}

/// A single surfel. Positions are relative to the owning block's origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Surfel {
    pub position: [f32; 3],
    pub normal: [i16; 3],
    pub tangent: [i16; 3],
    pub radius: [u16; 2],
    pub depth: u16,
    pub elevation: u16,
    pub timestamp: f32,
    pub identifier: u32,
    pub attribute: u32,
    pub color: [u8; 3],
    pub flags: SurfelFlags,
}

impl Surfel {
    pub fn new(position: Vec3) -> Self {
        Self {
            position: position.to_array(),
            ..Self::default()
        }
    }

    pub fn with_normal(mut self, normal: Vec3) -> Self {
        self.set_normal(normal);
        self
    }

    pub fn with_tangent(mut self, tangent: Vec3) -> Self {
        self.tangent = quantize_unit(tangent);
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        let r = quantize_radius(radius);
        self.radius = [r, r];
        self
    }

    pub fn with_radii(mut self, r0: f32, r1: f32) -> Self {
        self.radius = [quantize_radius(r0), quantize_radius(r1)];
        self
    }

    pub fn with_color(mut self, color: [u8; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_identifier(mut self, identifier: u32) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_attribute(mut self, attribute: u32) -> Self {
        self.attribute = attribute;
        self
    }

    pub fn with_depth(mut self, depth: f32) -> Self {
        self.set_depth(depth);
        self
    }

    pub fn with_elevation(mut self, elevation: f32) -> Self {
        self.elevation = encode_elevation(elevation);
        self
    }

    pub fn with_flags(mut self, flags: SurfelFlags) -> Self {
        self.flags = flags;
        self
    }

    // --- decoded accessors ---

    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn normal(&self) -> Vec3 {
        Vec3::new(
            self.normal[0] as f32 / NORMAL_SCALE,
            self.normal[1] as f32 / NORMAL_SCALE,
            self.normal[2] as f32 / NORMAL_SCALE,
        )
    }

    pub fn tangent(&self) -> Vec3 {
        Vec3::new(
            self.tangent[0] as f32 / NORMAL_SCALE,
            self.tangent[1] as f32 / NORMAL_SCALE,
            self.tangent[2] as f32 / NORMAL_SCALE,
        )
    }

    pub fn radius(&self, axis: usize) -> f32 {
        self.radius[axis.min(1)] as f32 / RADIUS_SCALE
    }

    pub fn depth(&self) -> f32 {
        self.depth as f32 / DEPTH_SCALE
    }

    pub fn elevation(&self) -> Option<f32> {
        decode_elevation(self.elevation)
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position.to_array();
    }

    pub fn set_normal(&mut self, normal: Vec3) {
        self.normal = quantize_unit(normal);
    }

    pub fn set_tangent(&mut self, tangent: Vec3) {
        self.tangent = quantize_unit(tangent);
    }

    pub fn set_depth(&mut self, depth: f32) {
        self.depth = (depth.max(0.0) * DEPTH_SCALE).round().min(u16::MAX as f32) as u16;
    }

    pub fn set_elevation(&mut self, elevation: Option<f32>) {
        self.elevation = elevation.map_or(0, encode_elevation);
    }

    pub fn set_flag(&mut self, flag: SurfelFlags, on: bool) {
        self.flags.set(flag, on);
    }

    // --- predicates ---

    pub fn is_active(&self) -> bool {
        self.flags.contains(SurfelFlags::ACTIVE)
    }

    pub fn is_marked(&self) -> bool {
        self.flags.contains(SurfelFlags::MARKED)
    }

    pub fn is_aerial(&self) -> bool {
        self.flags.contains(SurfelFlags::AERIAL)
    }

    pub fn is_terrestrial(&self) -> bool {
        !self.is_aerial()
    }

    pub fn is_oriented(&self) -> bool {
        self.normal != [0; 3]
    }

    pub fn has_tangent(&self) -> bool {
        self.tangent != [0; 3]
    }

    pub fn is_isotropic(&self) -> bool {
        self.radius[0] == self.radius[1]
    }

    pub fn is_on_boundary(&self) -> bool {
        self.flags.intersects(
            SurfelFlags::SILHOUETTE_BOUNDARY | SurfelFlags::SHADOW_BOUNDARY | SurfelFlags::BORDER_BOUNDARY,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_packing() {
        assert_eq!(encode_elevation(0.0), 32768);
        assert_eq!(encode_elevation(1.5), 33368);
        assert_eq!(decode_elevation(33368), Some(1.5));
        assert_eq!(decode_elevation(0), None);
    }

    #[test]
    fn test_normal_quantization() {
        let s = Surfel::new(Vec3::ZERO).with_normal(Vec3::Z);
        assert_eq!(s.normal, [0, 0, 32767]);
        assert!(s.is_oriented());
        assert!((s.normal() - Vec3::Z).length() < 1e-4);
    }

    #[test]
    fn test_flags_and_predicates() {
        let mut s = Surfel::new(Vec3::ONE).with_radii(0.1, 0.2);
        assert!(s.is_terrestrial());
        assert!(!s.is_isotropic());
        s.set_flag(SurfelFlags::AERIAL, true);
        s.set_flag(SurfelFlags::SHADOW_BOUNDARY, true);
        assert!(s.is_aerial());
        assert!(s.is_on_boundary());
        assert_eq!(s.flags.bits(), 0x24);
    }

    #[test]
    fn test_depth_round_trip() {
        let s = Surfel::new(Vec3::ZERO).with_depth(12.34);
        assert!((s.depth() - 12.34).abs() < 0.01);
    }
}
