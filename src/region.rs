//! Region catalog and spatial join.
//!
//! Cameras carry named polygonal regions. A person is placed in a region when
//! the *footprint* of its bounding box (a thin strip along the bottom edge,
//! approximating ground contact) intersects the region polygon. Using the
//! whole box would count a head leaning over a region boundary as presence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GeometryError;

/// Default share of the bbox height used as the footprint.
pub const DEFAULT_FOOTPRINT_RATIO: f64 = 0.0425;

// -------------------- Points and boxes --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl From<Point> for (i32, i32) {
    fn from(p: Point) -> Self {
        (p.x, p.y)
    }
}

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    /// Build a detection box. Requires `x1 < x2` and `y1 < y2`.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Self, GeometryError> {
        let bbox = Self { x1, y1, x2, y2 };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.x1 < self.x2 && self.y1 < self.y2 {
            Ok(())
        } else {
            Err(self.degenerate())
        }
    }

    /// Rounds detector float coordinates to whole pixels. Non-finite values
    /// and values outside the `i32` range are rejected.
    pub fn from_f32(coords: [f32; 4]) -> Result<Self, GeometryError> {
        let [x1, y1, x2, y2] = coords.map(pixel);
        Self::new(x1?, y1?, x2?, y2?)
    }

    pub fn width(&self) -> i64 {
        i64::from(self.x2) - i64::from(self.x1)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.y2) - i64::from(self.y1)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }

    /// True when `inner` lies entirely within this box (edges inclusive).
    pub fn encloses(&self, inner: &BBox) -> bool {
        inner.x1 >= self.x1 && inner.x2 <= self.x2 && inner.y1 >= self.y1 && inner.y2 <= self.y2
    }

    fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ]
    }

    // Zero-area boxes are allowed here: a footprint may collapse to a line.
    fn is_ordered(&self) -> bool {
        self.x1 <= self.x2 && self.y1 <= self.y2
    }

    fn degenerate(&self) -> GeometryError {
        GeometryError::DegenerateBox {
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
        }
    }
}

fn pixel(value: f32) -> Result<i32, GeometryError> {
    let rounded = f64::from(value).round();
    if rounded.is_finite() && rounded >= f64::from(i32::MIN) && rounded <= f64::from(i32::MAX) {
        Ok(rounded as i32)
    } else {
        Err(GeometryError::CoordinateOutOfRange(value.to_string()))
    }
}

impl std::str::FromStr for BBox {
    type Err = String;

    /// Parses `x1,y1,x2,y2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coords = s
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid coordinate in '{}': {}", s, e))?;
        match coords.as_slice() {
            [x1, y1, x2, y2] => Self::new(*x1, *y1, *x2, *y2).map_err(|e| e.to_string()),
            _ => Err(format!("expected x1,y1,x2,y2, got '{}'", s)),
        }
    }
}

/// Bottom strip of `bbox` used for region membership.
///
/// `crop_height = floor((y2 - y1) * percentage)`; the result is
/// `(x1, y2 - crop_height, x2, y2)`. A crop height of zero yields a
/// zero-height strip at `y2`, which still intersects regions touching that line.
pub fn footprint(bbox: &BBox, percentage: f64) -> BBox {
    let crop_height = (bbox.height() as f64 * percentage).floor() as i64;
    // Never above the box itself, so the result stays within `i32`.
    let top = (i64::from(bbox.y2) - crop_height).clamp(i64::from(bbox.y1), i64::from(bbox.y2));
    BBox {
        x1: bbox.x1,
        y1: top as i32,
        x2: bbox.x2,
        y2: bbox.y2,
    }
}

// -------------------- Polygons --------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Result<Self, GeometryError> {
        if points.len() < 3 {
            return Err(GeometryError::TooFewPoints(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    /// Point-in-polygon, boundary inclusive.
    pub fn contains(&self, p: Point) -> bool {
        if self.edges().any(|(a, b)| on_segment(a, b, p)) {
            return true;
        }
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                // p.x < x-intercept of the edge at p.y, compared exactly.
                let lhs = (i128::from(p.x) - i128::from(a.x)) * (i128::from(b.y) - i128::from(a.y));
                let rhs = (i128::from(p.y) - i128::from(a.y)) * (i128::from(b.x) - i128::from(a.x));
                let left_of_edge = if b.y > a.y { lhs < rhs } else { lhs > rhs };
                if left_of_edge {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Area intersection with the closed rectangle of `bbox`.
    pub fn intersects(&self, bbox: &BBox) -> bool {
        if self.points.iter().any(|p| bbox.contains(*p)) {
            return true;
        }
        let corners = bbox.corners();
        if corners.iter().any(|c| self.contains(*c)) {
            return true;
        }
        let rect_edges = [
            (corners[0], corners[1]),
            (corners[1], corners[2]),
            (corners[2], corners[3]),
            (corners[3], corners[0]),
        ];
        self.edges().any(|(a, b)| {
            rect_edges
                .iter()
                .any(|(c, d)| segments_intersect(a, b, *c, *d))
        })
    }
}

impl TryFrom<Vec<Point>> for Polygon {
    type Error = GeometryError;

    fn try_from(points: Vec<Point>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

// Coordinates span the full `i32` range, so products need 128 bits.
fn cross(o: Point, a: Point, b: Point) -> i128 {
    let d = |u: i32, v: i32| i128::from(u) - i128::from(v);
    d(a.x, o.x) * d(b.y, o.y) - d(a.y, o.y) * d(b.x, o.x)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    cross(a, b, p) == 0
        && p.x >= a.x.min(b.x)
        && p.x <= a.x.max(b.x)
        && p.y >= a.y.min(b.y)
        && p.y <= a.y.max(b.y)
}

fn segments_intersect(a: Point, b: Point, c: Point, d: Point) -> bool {
    let d1 = cross(c, d, a).signum();
    let d2 = cross(c, d, b).signum();
    let d3 = cross(a, b, c).signum();
    let d4 = cross(a, b, d).signum();
    if d1 * d2 < 0 && d3 * d4 < 0 {
        return true;
    }
    on_segment(c, d, a) || on_segment(c, d, b) || on_segment(a, b, c) || on_segment(a, b, d)
}

// -------------------- Regions and cameras --------------------

/// Named area of one camera's view. `polygon == None` means the whole frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub polygon: Option<Polygon>,
}

impl Region {
    pub fn new(name: impl Into<String>, polygon: Option<Polygon>) -> Self {
        Self {
            name: name.into(),
            polygon,
        }
    }
}

/// Names of the regions whose polygon intersects `bbox`, in input order.
///
/// Polygon-less regions never match here. A box with inverted corners
/// matches nothing.
pub fn overlapping_regions(bbox: &BBox, regions: &[Region]) -> Vec<String> {
    if !bbox.is_ordered() {
        log::debug!("ignoring malformed box for region overlap: {}", bbox.degenerate());
        return Vec::new();
    }
    regions
        .iter()
        .filter(|region| {
            region
                .polygon
                .as_ref()
                .is_some_and(|polygon| polygon.intersects(bbox))
        })
        .map(|region| region.name.clone())
        .collect()
}

/// One physical camera. Immutable after load.
#[derive(Clone, Debug)]
pub struct Camera {
    pub name: String,
    pub regions: Vec<Region>,
    /// Regions subscribed to presence notifications.
    pub rois: Vec<String>,
    /// Debounce window for this camera's regions.
    pub timeout: Duration,
    /// Match polygon-less regions for every person on this camera.
    pub whole_frame_matches: bool,
}

impl Camera {
    pub fn new(name: impl Into<String>, regions: Vec<Region>, rois: Vec<String>) -> Self {
        Self {
            name: name.into(),
            regions,
            rois,
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            whole_frame_matches: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_whole_frame_matches(mut self, enabled: bool) -> Self {
        self.whole_frame_matches = enabled;
        self
    }

    /// Regions overlapped by the footprint of a person box.
    pub fn regions_for(&self, bbox: &BBox, footprint_ratio: f64) -> Vec<String> {
        let foot = footprint(bbox, footprint_ratio);
        if !self.whole_frame_matches {
            return overlapping_regions(&foot, &self.regions);
        }
        let matched = overlapping_regions(&foot, &self.regions);
        self.regions
            .iter()
            .filter(|region| region.polygon.is_none() || matched.contains(&region.name))
            .map(|region| region.name.clone())
            .collect()
    }

    pub fn is_subscribed(&self, region: &str) -> bool {
        self.rois.iter().any(|roi| roi == region)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.name == name)
    }
}

/// Read-only camera lookup shared by every worker.
#[derive(Clone, Debug, Default)]
pub struct CameraCatalog {
    cameras: HashMap<String, Arc<Camera>>,
    order: Vec<String>,
}

impl CameraCatalog {
    pub fn new(cameras: Vec<Camera>) -> Self {
        let mut catalog = Self::default();
        for camera in cameras {
            catalog.order.push(camera.name.clone());
            catalog
                .cameras
                .insert(camera.name.clone(), Arc::new(camera));
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<Arc<Camera>> {
        self.cameras.get(name).cloned()
    }

    /// Cameras in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Camera>> {
        self.order.iter().filter_map(|name| self.cameras.get(name))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
