//! Scans and images: posed cameras attached to the scene.
//!
//! Camera frame convention: `x` points right, `y` up, and the camera looks
//! down `-z`. Image coordinates grow right and up from the lower-left
//! corner.

use glam::{DMat4, DVec2, DVec3};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ImageId, NodeId, ScanId};
use crate::{Error, Result};

use super::SurfelScene;

/// Pose as viewpoint plus viewing direction and up vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub viewpoint: DVec3,
    pub towards: DVec3,
    pub up: DVec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self { viewpoint: DVec3::ZERO, towards: DVec3::NEG_Z, up: DVec3::Y }
    }
}

impl Camera {
    pub fn new(viewpoint: DVec3, towards: DVec3, up: DVec3) -> Self {
        Self { viewpoint, towards, up }
    }

    /// Orthonormal `(right, up, towards)` frame. `up` is corrected to be
    /// perpendicular to `towards`.
    pub fn basis(&self) -> (DVec3, DVec3, DVec3) {
        let towards = self.towards.normalize_or_zero();
        let right = towards.cross(self.up).normalize_or_zero();
        let up = right.cross(towards);
        (right, up, towards)
    }

    pub fn right(&self) -> DVec3 {
        self.basis().0
    }

    pub fn world_to_camera(&self, p: DVec3) -> DVec3 {
        let (right, up, towards) = self.basis();
        let d = p - self.viewpoint;
        DVec3::new(d.dot(right), d.dot(up), -d.dot(towards))
    }

    pub fn transformed(&self, m: &DMat4) -> Camera {
        Camera {
            viewpoint: m.transform_point3(self.viewpoint),
            towards: m.transform_vector3(self.towards).normalize_or_zero(),
            up: m.transform_vector3(self.up).normalize_or_zero(),
        }
    }

    /// Linear blend of two poses.
    pub fn lerp(&self, other: &Camera, t: f64) -> Camera {
        Camera {
            viewpoint: self.viewpoint.lerp(other.viewpoint, t),
            towards: self.towards.lerp(other.towards, t).normalize_or_zero(),
            up: self.up.lerp(other.up, t).normalize_or_zero(),
        }
    }
}

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: i32,
    pub height: i32,
    pub xfocal: f64,
    pub yfocal: f64,
    pub center: DVec2,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self { width: 0, height: 0, xfocal: 0.0, yfocal: 0.0, center: DVec2::ZERO }
    }
}

impl Intrinsics {
    /// Square pixels, principal point at the image center.
    pub fn new(width: i32, height: i32, focal: f64) -> Self {
        Self {
            width,
            height,
            xfocal: focal,
            yfocal: focal,
            center: DVec2::new(width as f64 / 2.0, height as f64 / 2.0),
        }
    }

    pub fn with_yfocal(mut self, yfocal: f64) -> Self {
        self.yfocal = yfocal;
        self
    }

    pub fn with_center(mut self, center: DVec2) -> Self {
        self.center = center;
        self
    }

    /// Fill unset values the way stored files leave them: a zero center
    /// coordinate means the middle of the image, a non-positive `yfocal`
    /// means square pixels.
    pub(crate) fn normalized(mut self) -> Self {
        if self.center.x == 0.0 {
            self.center.x = self.width as f64 / 2.0;
        }
        if self.center.y == 0.0 {
            self.center.y = self.height as f64 / 2.0;
        }
        if self.yfocal <= 0.0 {
            self.yfocal = self.xfocal;
        }
        self
    }

    pub fn contains(&self, ix: i32, iy: i32) -> bool {
        ix >= 0 && iy >= 0 && ix < self.width && iy < self.height
    }
}

/// Lens model applied to normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Distortion {
    #[default]
    None,
    Perspective { radial: [f64; 3], tangential: [f64; 2] },
    Fisheye { radial: [f64; 3], tangential: [f64; 2] },
}

impl Distortion {
    pub fn code(&self) -> i32 {
        match self {
            Distortion::None => 0,
            Distortion::Perspective { .. } => 1,
            Distortion::Fisheye { .. } => 2,
        }
    }

    pub fn from_code(code: i32, radial: [f64; 3], tangential: [f64; 2]) -> Result<Self> {
        match code {
            0 => Ok(Distortion::None),
            1 => Ok(Distortion::Perspective { radial, tangential }),
            2 => Ok(Distortion::Fisheye { radial, tangential }),
            other => Err(Error::Format(format!("unknown distortion type {other}"))),
        }
    }

    pub fn coefficients(&self) -> ([f64; 3], [f64; 2]) {
        match *self {
            Distortion::None => ([0.0; 3], [0.0; 2]),
            Distortion::Perspective { radial, tangential } | Distortion::Fisheye { radial, tangential } => {
                (radial, tangential)
            }
        }
    }

    pub fn apply(&self, p: DVec2) -> DVec2 {
        match *self {
            Distortion::None => p,
            Distortion::Perspective { radial: [k1, k2, k3], tangential: [p1, p2] } => {
                let r2 = p.length_squared();
                let f = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
                DVec2::new(
                    p.x * f + 2.0 * p1 * p.x * p.y + p2 * (r2 + 2.0 * p.x * p.x),
                    p.y * f + p1 * (r2 + 2.0 * p.y * p.y) + 2.0 * p2 * p.x * p.y,
                )
            }
            Distortion::Fisheye { radial: [k1, k2, k3], .. } => {
                let r = p.length();
                if r == 0.0 {
                    return p;
                }
                let theta = r.atan();
                let t2 = theta * theta;
                let theta_d = theta * (1.0 + t2 * (k1 + t2 * (k2 + t2 * k3)));
                p * (theta_d / r)
            }
        }
    }
}

/// Two poses bracketing a rolling-shutter exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollingShutter {
    pub cameras: [Camera; 2],
    pub timestamps: [f64; 2],
}

impl RollingShutter {
    /// Pose at `timestamp`, clamped to the exposure interval.
    pub fn camera_at(&self, timestamp: f64) -> Camera {
        let [t0, t1] = self.timestamps;
        let t = if t1 > t0 { ((timestamp - t0) / (t1 - t0)).clamp(0.0, 1.0) } else { 0.0 };
        self.cameras[0].lerp(&self.cameras[1], t)
    }

    fn transformed(&self, m: &DMat4) -> Self {
        Self { cameras: [self.cameras[0].transformed(m), self.cameras[1].transformed(m)], timestamps: self.timestamps }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageChannel {
    Red,
    Green,
    Blue,
    Depth,
    Category,
    Instance,
    User,
}

/// Dense per-pixel values, row-major from the bottom row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGrid {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl ChannelGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, values: vec![0.0; width * height] }
    }

    pub fn from_values(width: usize, height: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != width * height {
            return Err(Error::ConstraintViolation(format!(
                "{} values for a {width}x{height} grid",
                values.len()
            )));
        }
        Ok(Self { width, height, values })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, ix: i32, iy: i32) -> Option<f32> {
        if ix < 0 || iy < 0 || ix as usize >= self.width || iy as usize >= self.height {
            return None;
        }
        self.values.get(iy as usize * self.width + ix as usize).copied()
    }

    pub fn set(&mut self, ix: usize, iy: usize, value: f32) -> Result<()> {
        if ix >= self.width || iy >= self.height {
            return Err(Error::ConstraintViolation(format!(
                "pixel ({ix}, {iy}) outside {}x{}",
                self.width, self.height
            )));
        }
        self.values[iy * self.width + ix] = value;
        Ok(())
    }
}

fn project(camera: &Camera, intrinsics: &Intrinsics, distortion: &Distortion, p: DVec3) -> Option<DVec2> {
    let c = camera.world_to_camera(p);
    if c.z >= 0.0 {
        return None;
    }
    let normalized = distortion.apply(DVec2::new(c.x / -c.z, c.y / -c.z));
    Some(DVec2::new(
        intrinsics.center.x + intrinsics.xfocal * normalized.x,
        intrinsics.center.y + intrinsics.yfocal * normalized.y,
    ))
}

/// A capture position, optionally linked to the tree node holding its
/// surfels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SurfelScan {
    pub name: Option<String>,
    pub camera: Camera,
    pub timestamp: f64,
    pub intrinsics: Intrinsics,
    pub flags: u32,
    pub(crate) node: Option<NodeId>,
    pub(crate) images: Vec<ImageId>,
}

impl SurfelScan {
    pub fn new(name: impl Into<String>, camera: Camera, timestamp: f64) -> Self {
        Self { name: Some(name.into()), camera, timestamp, ..Self::default() }
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn images(&self) -> &[ImageId] {
        &self.images
    }

    pub fn project(&self, p: DVec3) -> Option<DVec2> {
        project(&self.camera, &self.intrinsics, &Distortion::None, p)
    }
}

/// A posed photograph, optionally taken from a scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SurfelImage {
    pub name: Option<String>,
    pub camera: Camera,
    pub timestamp: f64,
    pub intrinsics: Intrinsics,
    pub flags: u32,
    pub distortion: Distortion,
    pub rolling_shutter: Option<RollingShutter>,
    pub(crate) scan: Option<ScanId>,
    channels: HashMap<ImageChannel, ChannelGrid>,
}

impl SurfelImage {
    pub fn new(name: impl Into<String>, camera: Camera, intrinsics: Intrinsics) -> Self {
        Self { name: Some(name.into()), camera, intrinsics, ..Self::default() }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn with_rolling_shutter(mut self, rolling_shutter: RollingShutter) -> Self {
        self.rolling_shutter = Some(rolling_shutter);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scan(&self) -> Option<ScanId> {
        self.scan
    }

    /// Image position of a world point, `None` behind the camera.
    pub fn project(&self, p: DVec3) -> Option<DVec2> {
        project(&self.camera, &self.intrinsics, &self.distortion, p)
    }

    pub fn channel(&self, channel: ImageChannel) -> Option<&ChannelGrid> {
        self.channels.get(&channel)
    }

    pub fn set_channel(&mut self, channel: ImageChannel, grid: ChannelGrid) {
        self.channels.insert(channel, grid);
    }

    pub fn remove_channel(&mut self, channel: ImageChannel) -> Option<ChannelGrid> {
        self.channels.remove(&channel)
    }

    pub fn pixel_value(&self, channel: ImageChannel, ix: i32, iy: i32) -> Option<f32> {
        self.channels.get(&channel)?.get(ix, iy)
    }

    /// Channel value at the pixel a world point projects to.
    pub fn value_at(&self, channel: ImageChannel, p: DVec3) -> Option<f32> {
        let q = self.project(p)?;
        self.pixel_value(channel, (q.x + 0.5) as i32, (q.y + 0.5) as i32)
    }

    pub(crate) fn transform(&mut self, m: &DMat4) {
        self.camera = self.camera.transformed(m);
        self.rolling_shutter = self.rolling_shutter.map(|r| r.transformed(m));
    }

    pub(crate) fn unlinked(mut self) -> Self {
        self.scan = None;
        self
    }
}

impl SurfelScene {
    // ------------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------------

    pub fn scan_count(&self) -> usize {
        self.scans.len()
    }

    pub fn scan(&self, id: ScanId) -> Result<&SurfelScan> {
        self.scans.try_get(id)
    }

    pub fn scan_mut(&mut self, id: ScanId) -> Result<&mut SurfelScan> {
        self.dirty = true;
        self.scans.try_get_mut(id)
    }

    pub fn scan_at(&self, index: usize) -> Option<ScanId> {
        self.scans.handle_at(index)
    }

    pub fn scan_index(&self, id: ScanId) -> Option<usize> {
        self.scans.index_of(id)
    }

    pub fn scans(&self) -> impl Iterator<Item = (ScanId, &SurfelScan)> + '_ {
        self.scans.iter()
    }

    pub fn find_scan_by_name(&self, name: &str) -> Option<ScanId> {
        self.scans.iter().find(|(_, s)| s.name() == Some(name)).map(|(id, _)| id)
    }

    pub fn insert_scan(&mut self, mut scan: SurfelScan) -> ScanId {
        scan.node = None;
        scan.images.clear();
        self.dirty = true;
        self.scans.insert(scan)
    }

    /// Link a scan to the node holding its surfels, replacing any previous
    /// link on either side.
    pub fn set_scan_node(&mut self, scan: ScanId, node: Option<NodeId>) -> Result<()> {
        self.scans.try_get(scan)?;
        if let Some(node) = node
            && let Some(other) = self.tree.node(node)?.scan()
            && other != scan
        {
            return Err(Error::ConstraintViolation(format!("{node} is already linked to {other}")));
        }
        if let Some(old) = self.scans.try_get(scan)?.node {
            self.tree.set_node_scan(old, None)?;
        }
        if let Some(node) = node {
            self.tree.set_node_scan(node, Some(scan))?;
        }
        self.scans.try_get_mut(scan)?.node = node;
        self.dirty = true;
        Ok(())
    }

    /// Remove a scan. Its node and images are unlinked, not removed.
    pub fn remove_scan(&mut self, id: ScanId) -> Result<SurfelScan> {
        let scan = self.scans.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(node) = scan.node {
            self.tree.set_node_scan(node, None)?;
        }
        for &image in &scan.images {
            if let Some(i) = self.images.get_mut(image) {
                i.scan = None;
            }
        }
        self.dirty = true;
        debug!(scan = %id, "removed scan");
        Ok(scan)
    }

    // ------------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------------

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, id: ImageId) -> Result<&SurfelImage> {
        self.images.try_get(id)
    }

    pub fn image_mut(&mut self, id: ImageId) -> Result<&mut SurfelImage> {
        self.dirty = true;
        self.images.try_get_mut(id)
    }

    pub fn image_at(&self, index: usize) -> Option<ImageId> {
        self.images.handle_at(index)
    }

    pub fn image_index(&self, id: ImageId) -> Option<usize> {
        self.images.index_of(id)
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageId, &SurfelImage)> + '_ {
        self.images.iter()
    }

    pub fn find_image_by_name(&self, name: &str) -> Option<ImageId> {
        self.images.iter().find(|(_, i)| i.name() == Some(name)).map(|(id, _)| id)
    }

    pub fn insert_image(&mut self, image: SurfelImage) -> ImageId {
        self.dirty = true;
        self.images.insert(image.unlinked())
    }

    pub fn set_image_scan(&mut self, image: ImageId, scan: Option<ScanId>) -> Result<()> {
        self.images.try_get(image)?;
        if let Some(scan) = scan {
            self.scans.try_get(scan)?;
        }
        if let Some(old) = self.images.try_get(image)?.scan
            && let Some(s) = self.scans.get_mut(old)
        {
            s.images.retain(|&i| i != image);
        }
        if let Some(scan) = scan {
            self.scans.try_get_mut(scan)?.images.push(image);
        }
        self.images.try_get_mut(image)?.scan = scan;
        self.dirty = true;
        Ok(())
    }

    pub fn remove_image(&mut self, id: ImageId) -> Result<SurfelImage> {
        let image = self.images.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(scan) = image.scan
            && let Some(s) = self.scans.get_mut(scan)
        {
            s.images.retain(|&i| i != id);
        }
        self.dirty = true;
        Ok(image)
    }

    /// The image that sees `p` closest to its center and from nearest by.
    ///
    /// Each image scores `(1 - dx)(1 - dy) / d²` where `dx`, `dy` are the
    /// pixel's normalized offsets from the image center and `d` is the
    /// distance to the viewpoint. Points behind a camera or outside its
    /// frame do not count.
    pub fn find_image_by_best_view(&self, p: DVec3) -> Option<ImageId> {
        let mut best: Option<(ImageId, f64)> = None;
        for (id, image) in self.images.iter() {
            let Some(q) = image.project(p) else { continue };
            let ix = (q.x + 0.5).floor() as i32;
            let iy = (q.y + 0.5).floor() as i32;
            if !image.intrinsics.contains(ix, iy) {
                continue;
            }
            let half_w = image.intrinsics.width as f64 / 2.0;
            let half_h = image.intrinsics.height as f64 / 2.0;
            let dx = (ix as f64 - half_w).abs() / half_w;
            let dy = (iy as f64 - half_h).abs() / half_h;
            let d2 = (p - image.camera.viewpoint).length_squared();
            if d2 == 0.0 {
                continue;
            }
            let score = (1.0 - dx) * (1.0 - dy) / d2;
            if score > 0.0 && best.is_none_or(|(_, s)| score > s) {
                best = Some((id, score));
            }
        }
        best.map(|(id, _)| id)
    }
}
