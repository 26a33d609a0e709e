//! Text detection: per-pixel text probability maps and the word boxes we
//! extract from them.

use std::collections::{BTreeMap, HashMap};

use geo::{
    Area, BoundingRect, Coord, EuclideanLength, MinimumRotatedRect, MultiPoint, Point, Polygon,
};
use geo_clipper::{Clipper, EndType, JoinType};
use image::{GrayImage, ImageBuffer, Luma, RgbImage, imageops};
use imageproc::region_labelling::{Connectivity, connected_components};

use super::{document::Geometry, strategy::DetectorArch};
use crate::prelude::*;

/// Per-pixel text probability, at the page's native resolution.
pub type SegmentationMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A text detector.
///
/// Implementations must be usable from several threads, but we only ever call
/// them one page at a time.
pub trait TextDetector: Send + Sync + 'static {
    /// Which architecture is this?
    fn arch(&self) -> DetectorArch;

    /// Compute a text probability map for `page`, with exactly the same width
    /// and height as `page`.
    fn segmentation_map(&self, page: &RgbImage) -> Result<SegmentationMap>;
}

/// Tuning knobs for turning a probability map into boxes.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionParams {
    /// Pixels above this probability count as text.
    pub bin_thresh: f32,
    /// Components whose mean probability falls below this are dropped.
    pub box_thresh: f32,
    /// Components with fewer pixels than this are dropped.
    pub min_component_px: usize,
    /// How far to grow each box, as `area * unclip_ratio / perimeter`.
    /// Detectors are trained on shrunken text regions, so this undoes that.
    pub unclip_ratio: f32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            bin_thresh: 0.3,
            box_thresh: 0.1,
            min_component_px: 3,
            unclip_ratio: 1.5,
        }
    }
}

/// One detected text region.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedBox {
    /// Mean probability over the region's pixels.
    pub score: f32,
    /// Relative page geometry.
    pub geometry: Geometry,
}

/// Resample a probability map to `width` x `height` using linear
/// interpolation.
pub fn resample_map(map: &SegmentationMap, width: u32, height: u32) -> SegmentationMap {
    if map.dimensions() == (width, height) {
        return map.clone();
    }
    imageops::resize(map, width, height, imageops::FilterType::Triangle)
}

/// Find text regions in a probability map.
///
/// Pixels above `bin_thresh` are grouped into 8-connected regions. With
/// `straight` set, every region becomes an upright box. Otherwise each region
/// gets its minimum-area rotated rectangle.
pub fn extract_boxes(
    map: &SegmentationMap,
    params: &DetectionParams,
    straight: bool,
) -> Vec<DetectedBox> {
    let (width, height) = map.dimensions();
    if width == 0 || height == 0 {
        return vec![];
    }

    let binary = GrayImage::from_fn(width, height, |x, y| {
        Luma([if map.get_pixel(x, y)[0] > params.bin_thresh { 255 } else { 0 }])
    });
    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    // Components in the order we first meet them, scanning row by row.
    let mut components: Vec<Component> = vec![];
    let mut by_label = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let idx = *by_label.entry(label).or_insert_with(|| {
            components.push(Component::default());
            components.len() - 1
        });
        components[idx].add(x, y, map.get_pixel(x, y)[0]);
    }

    let mut boxes = vec![];
    for component in &components {
        if component.pixels < params.min_component_px {
            continue;
        }
        let score = component.score();
        if score < params.box_thresh {
            continue;
        }
        let outline = component.outline();
        let geometry = if straight {
            straight_box(&outline, width, height, params.unclip_ratio)
        } else {
            rotated_box(&outline, width, height, params.unclip_ratio)
        };
        if let Some(geometry) = geometry {
            boxes.push(DetectedBox { score, geometry });
        }
    }
    debug!(count = boxes.len(), "Extracted text boxes");
    boxes
}

/// One connected region of text pixels.
#[derive(Default)]
struct Component {
    pixels: usize,
    prob_sum: f32,
    /// Leftmost and rightmost pixel in each row.
    rows: BTreeMap<u32, (u32, u32)>,
}

impl Component {
    fn add(&mut self, x: u32, y: u32, prob: f32) {
        self.pixels += 1;
        self.prob_sum += prob;
        self.rows
            .entry(y)
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(x);
                *hi = (*hi).max(x);
            })
            .or_insert((x, x));
    }

    /// Mean probability over the region's pixels.
    fn score(&self) -> f32 {
        self.prob_sum / self.pixels.max(1) as f32
    }

    /// Pixel-edge corners at the ends of each row. Their convex hull is the
    /// hull of the whole region.
    fn outline(&self) -> MultiPoint<f64> {
        self.rows
            .iter()
            .flat_map(|(&y, &(lo, hi))| {
                let (x0, x1) = (f64::from(lo), f64::from(hi) + 1.0);
                let (y0, y1) = (f64::from(y), f64::from(y) + 1.0);
                [
                    Point::new(x0, y0),
                    Point::new(x0, y1),
                    Point::new(x1, y0),
                    Point::new(x1, y1),
                ]
            })
            .collect()
    }
}

/// Grow a polygon outward by `area * unclip_ratio / perimeter`.
fn unclip(polygon: &Polygon<f64>, unclip_ratio: f32) -> Polygon<f64> {
    let perimeter = polygon.exterior().euclidean_length();
    if perimeter <= 0.0 {
        return polygon.clone();
    }
    let distance = polygon.unsigned_area() * f64::from(unclip_ratio) / perimeter;
    if distance <= 0.0 {
        return polygon.clone();
    }
    polygon
        .offset(
            distance,
            JoinType::Round(0.25),
            EndType::ClosedPolygon,
            CLIPPER_SCALE,
        )
        .0
        .into_iter()
        .next()
        .unwrap_or_else(|| polygon.clone())
}

/// Clipper works on integers, so coordinates are scaled by this first.
const CLIPPER_SCALE: f64 = 100.0;

/// Upright box around a region, grown and converted to relative coords.
fn straight_box(
    outline: &MultiPoint<f64>,
    width: u32,
    height: u32,
    unclip_ratio: f32,
) -> Option<Geometry> {
    let rect = outline.bounding_rect()?;
    let grown = unclip(&rect.to_polygon(), unclip_ratio).bounding_rect()?;
    let (wf, hf) = (f64::from(width), f64::from(height));
    Some(Geometry::Straight {
        xmin: (grown.min().x / wf).clamp(0.0, 1.0) as f32,
        ymin: (grown.min().y / hf).clamp(0.0, 1.0) as f32,
        xmax: (grown.max().x / wf).clamp(0.0, 1.0) as f32,
        ymax: (grown.max().y / hf).clamp(0.0, 1.0) as f32,
    })
}

/// Minimum-area rotated rectangle around a region, grown and converted to
/// relative coords.
fn rotated_box(
    outline: &MultiPoint<f64>,
    width: u32,
    height: u32,
    unclip_ratio: f32,
) -> Option<Geometry> {
    let rect = outline.minimum_rotated_rect()?;
    let rect = unclip(&rect, unclip_ratio).minimum_rotated_rect()?;
    let corners = rect.exterior().coords().take(4).copied().collect::<Vec<_>>();
    if corners.len() < 4 {
        return None;
    }
    Some(Geometry::Rotated {
        corners: oriented_corners(&corners, width, height),
    })
}

/// Put a rectangle's corners in reading order: top left of the text first,
/// then clockwise, with the long side running left to right.
fn oriented_corners(rect: &[Coord<f64>], width: u32, height: u32) -> [[f32; 2]; 4] {
    let cx = rect.iter().map(|c| c.x).sum::<f64>() / rect.len() as f64;
    let cy = rect.iter().map(|c| c.y).sum::<f64>() / rect.len() as f64;

    let edge = |a: Coord<f64>, b: Coord<f64>| (b.x - a.x, b.y - a.y);
    let (e0, e1) = (edge(rect[0], rect[1]), edge(rect[1], rect[2]));
    let (mut ux, mut uy) = if e0.0.hypot(e0.1) >= e1.0.hypot(e1.1) {
        e0
    } else {
        e1
    };
    let len = ux.hypot(uy);
    if len <= f64::EPSILON {
        (ux, uy) = (1.0, 0.0);
    } else {
        (ux, uy) = (ux / len, uy / len);
    }
    if ux < 0.0 {
        (ux, uy) = (-ux, -uy);
    }
    let (vx, vy) = (-uy, ux);

    let (mut u0, mut u1, mut v0, mut v1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for c in rect {
        let (dx, dy) = (c.x - cx, c.y - cy);
        let u = dx * ux + dy * uy;
        let v = dx * vx + dy * vy;
        u0 = u0.min(u);
        u1 = u1.max(u);
        v0 = v0.min(v);
        v1 = v1.max(v);
    }

    let (wf, hf) = (f64::from(width), f64::from(height));
    let corner = |u: f64, v: f64| {
        [
            ((cx + u * ux + v * vx) / wf).clamp(0.0, 1.0) as f32,
            ((cy + u * uy + v * vy) / hf).clamp(0.0, 1.0) as f32,
        ]
    };
    [corner(u0, v0), corner(u1, v0), corner(u1, v1), corner(u0, v1)]
}
