//! Bounding volumes, intervals and colors shared across the store.

use glam::{DMat4, DVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in world coordinates.
///
/// The empty box has `min = +MAX` and `max = -MAX` so that any union with a
/// real point or box yields that point or box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for BBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BBox {
    pub const EMPTY: BBox = BBox {
        min: DVec3::splat(f64::MAX),
        max: DVec3::splat(-f64::MAX),
    };

    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn from_point(p: DVec3) -> Self {
        Self { min: p, max: p }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn union(&mut self, other: &BBox) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn union_point(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn centroid(&self) -> DVec3 {
        if self.is_empty() {
            return DVec3::ZERO;
        }
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> DVec3 {
        if self.is_empty() {
            return DVec3::ZERO;
        }
        self.max - self.min
    }

    pub fn diagonal_radius(&self) -> f64 {
        self.extent().length() * 0.5
    }

    /// Area of the footprint in the XY plane.
    pub fn xy_area(&self) -> f64 {
        let e = self.extent();
        e.x * e.y
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn contains(&self, other: &BBox) -> bool {
        !other.is_empty() && self.contains_point(other.min) && self.contains_point(other.max)
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    /// Box enclosing the eight transformed corners.
    pub fn transformed(&self, m: &DMat4) -> BBox {
        if self.is_empty() {
            return *self;
        }
        let mut out = BBox::EMPTY;
        for i in 0..8 {
            let corner = DVec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.union_point(m.transform_point3(corner));
        }
        out
    }

    pub(crate) fn to_array(self) -> [f64; 6] {
        [self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z]
    }

    pub(crate) fn from_array(v: [f64; 6]) -> Self {
        Self {
            min: DVec3::new(v[0], v[1], v[2]),
            max: DVec3::new(v[3], v[4], v[5]),
        }
    }
}

/// Closed scalar range. Empty when `min > max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Default for Interval {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Interval {
    pub const EMPTY: Interval = Interval { min: f64::MAX, max: -f64::MAX };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn union(&mut self, other: &Interval) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn union_value(&mut self, v: f64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        !self.is_empty() && !other.is_empty() && self.min <= other.max && other.min <= self.max
    }

    pub fn translated(&self, delta: f64) -> Interval {
        if self.is_empty() {
            return *self;
        }
        Interval::new(self.min + delta, self.max + delta)
    }
}

/// Display color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0.0, g: 0.0, b: 0.0 };

    pub fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_box_union() {
        let mut b = BBox::EMPTY;
        assert!(b.is_empty());
        b.union(&BBox::new(DVec3::ZERO, DVec3::ONE));
        b.union(&BBox::EMPTY);
        assert_eq!(b, BBox::new(DVec3::ZERO, DVec3::ONE));
        assert_eq!(b.centroid(), DVec3::splat(0.5));
    }

    #[test]
    fn test_box_transformed_by_translation() {
        let b = BBox::new(DVec3::ZERO, DVec3::ONE);
        let t = DMat4::from_translation(DVec3::new(10.0, 0.0, -1.0));
        let moved = b.transformed(&t);
        assert_eq!(moved.min, DVec3::new(10.0, 0.0, -1.0));
        assert_eq!(moved.max, DVec3::new(11.0, 1.0, 0.0));
    }

    #[test]
    fn test_interval_union_and_translate() {
        let mut i = Interval::EMPTY;
        i.union_value(2.0);
        i.union_value(-1.0);
        assert_eq!(i, Interval::new(-1.0, 2.0));
        assert_eq!(i.translated(1.0), Interval::new(0.0, 3.0));
        assert!(Interval::EMPTY.translated(5.0).is_empty());
    }
}
