//! Structured OCR output: pages made of blocks, lines and words.
//!
//! All geometry is relative to the page, with `(0, 0)` at the top left and
//! `(1, 1)` at the bottom right.

use image::{Rgb, RgbImage};
use schemars::JsonSchema;

use crate::prelude::*;

/// A point in relative page coordinates.
pub type Point = [f32; 2];

/// Where a piece of text sits on the page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Geometry {
    /// An upright box.
    Straight {
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    },
    /// A rotated rectangle, corners clockwise from the top left of the text.
    Rotated { corners: [Point; 4] },
}

impl Geometry {
    /// The smallest upright box containing this geometry, as
    /// `(xmin, ymin, xmax, ymax)`.
    pub fn envelope(&self) -> (f32, f32, f32, f32) {
        match self {
            Geometry::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            } => (*xmin, *ymin, *xmax, *ymax),
            Geometry::Rotated { corners } => corners.iter().fold(
                (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
                |(xmin, ymin, xmax, ymax), [x, y]| {
                    (xmin.min(*x), ymin.min(*y), xmax.max(*x), ymax.max(*y))
                },
            ),
        }
    }

    /// Vertical centre of the envelope.
    pub fn y_center(&self) -> f32 {
        let (_, ymin, _, ymax) = self.envelope();
        (ymin + ymax) / 2.0
    }

    /// Height of the envelope.
    pub fn height(&self) -> f32 {
        let (_, ymin, _, ymax) = self.envelope();
        ymax - ymin
    }

    /// Merge several geometries into one upright envelope.
    pub fn union<'a>(geometries: impl IntoIterator<Item = &'a Geometry>) -> Geometry {
        let (xmin, ymin, xmax, ymax) = geometries.into_iter().map(Geometry::envelope).fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(ax0, ay0, ax1, ay1), (x0, y0, x1, y1)| {
                (ax0.min(x0), ay0.min(y0), ax1.max(x1), ay1.max(y1))
            },
        );
        if xmin > xmax {
            return Geometry::Straight {
                xmin: 0.0,
                ymin: 0.0,
                xmax: 0.0,
                ymax: 0.0,
            };
        }
        Geometry::Straight {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }
}

/// A recognized word.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Word {
    /// The text, exactly as decoded.
    pub value: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f32,
    /// Where the word is.
    pub geometry: Geometry,
}

/// Words on one line, left to right.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Line {
    pub words: Vec<Word>,
    pub geometry: Geometry,
}

/// Lines in one block, top to bottom.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Block {
    pub lines: Vec<Line>,
    pub geometry: Geometry,
}

/// Everything recognized on one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RecognizedPage {
    /// Zero-based page index within the document.
    pub page_idx: usize,
    /// Page size in pixels, as `(height, width)`.
    pub dimensions: (u32, u32),
    pub blocks: Vec<Block>,
}

impl RecognizedPage {
    /// Iterate over every word in reading order.
    pub fn words(&self) -> impl Iterator<Item = &Word> {
        self.blocks
            .iter()
            .flat_map(|block| block.lines.iter())
            .flat_map(|line| line.words.iter())
    }

    /// Render a rough reconstruction of the page: a white sheet with one box
    /// per word, darker where recognition was more confident.
    ///
    /// This is for eyeballing detector output. It carries no text.
    pub fn synthesize(&self) -> RgbImage {
        let (height, width) = self.dimensions;
        let mut image = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        if width == 0 || height == 0 {
            return image;
        }
        for word in self.words() {
            let (xmin, ymin, xmax, ymax) = word.geometry.envelope();
            let to_px = |v: f32, max: u32| ((v.clamp(0.0, 1.0) * max as f32) as u32).min(max - 1);
            let (x0, x1) = (to_px(xmin, width), to_px(xmax, width));
            let (y0, y1) = (to_px(ymin, height), to_px(ymax, height));
            let shade = 255 - (word.confidence.clamp(0.0, 1.0) * 200.0) as u8;
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let border = x == x0 || x == x1 || y == y0 || y == y1;
                    let pixel = if border {
                        Rgb([0, 0, 0])
                    } else {
                        Rgb([shade, shade, 255])
                    };
                    image.put_pixel(x, y, pixel);
                }
            }
        }
        image
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a straight word for tests.
    pub(crate) fn word(value: &str, xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Word {
        Word {
            value: value.to_owned(),
            confidence: 0.9,
            geometry: Geometry::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            },
        }
    }

    #[test]
    fn rotated_envelope_covers_corners() {
        let geometry = Geometry::Rotated {
            corners: [[0.2, 0.1], [0.6, 0.3], [0.5, 0.5], [0.1, 0.3]],
        };
        assert_eq!(geometry.envelope(), (0.1, 0.1, 0.6, 0.5));
        assert!((geometry.y_center() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn union_of_nothing_is_empty() {
        let empty: Vec<Geometry> = vec![];
        assert_eq!(Geometry::union(&empty).envelope(), (0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn synthesize_matches_page_size_and_marks_words() {
        let page = RecognizedPage {
            page_idx: 0,
            dimensions: (100, 200),
            blocks: vec![Block {
                lines: vec![Line {
                    words: vec![word("hi", 0.1, 0.1, 0.3, 0.2)],
                    geometry: Geometry::union(&[]),
                }],
                geometry: Geometry::union(&[]),
            }],
        };
        let image = page.synthesize();
        assert_eq!(image.dimensions(), (200, 100));
        assert_eq!(image.get_pixel(20, 10), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(150, 80), &Rgb([255, 255, 255]));
    }
}
