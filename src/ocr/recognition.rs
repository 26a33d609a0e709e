//! Text recognition: turning word crops into strings.

use image::{Rgb, RgbImage, imageops};

use super::{document::Geometry, strategy::RecognizerArch};
use crate::prelude::*;

/// The character set our recognizer was trained on: Latin letters, digits,
/// ASCII punctuation, plus French accents and a few currency symbols.
pub const DEFAULT_VOCAB: &str = concat!(
    "0123456789",
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~",
    "°",
    "àâéèêëîïôùûüçÀÂÉÈÊËÎÏÔÙÛÜÇ",
    "£€¥¢฿",
);

/// A recognized string and how sure we are about it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedText {
    pub value: String,
    pub confidence: f32,
}

/// A text recognizer.
pub trait TextRecognizer: Send + Sync + 'static {
    /// Which architecture is this?
    fn arch(&self) -> RecognizerArch;

    /// Recognize one word per crop, returning results in the same order.
    fn recognize(&self, crops: &[RgbImage]) -> Result<Vec<RecognizedText>>;
}

/// Cut a word out of a page.
///
/// Rotated regions are sampled along their own axes, so the result is always
/// upright text.
pub fn crop_word(page: &RgbImage, geometry: &Geometry) -> RgbImage {
    let (width, height) = page.dimensions();
    let (wf, hf) = (width as f32, height as f32);
    match geometry {
        Geometry::Straight {
            xmin,
            ymin,
            xmax,
            ymax,
        } => {
            let x0 = ((xmin * wf).floor().max(0.0) as u32).min(width.saturating_sub(1));
            let y0 = ((ymin * hf).floor().max(0.0) as u32).min(height.saturating_sub(1));
            let x1 = ((xmax * wf).ceil() as u32).clamp(x0 + 1, width.max(1));
            let y1 = ((ymax * hf).ceil() as u32).clamp(y0 + 1, height.max(1));
            imageops::crop_imm(page, x0, y0, x1 - x0, y1 - y0).to_image()
        }
        Geometry::Rotated { corners } => {
            let px = |[x, y]: [f32; 2]| (x * wf, y * hf);
            let (tl, tr, bl) = (px(corners[0]), px(corners[1]), px(corners[3]));
            let (ux, uy) = (tr.0 - tl.0, tr.1 - tl.1);
            let (vx, vy) = (bl.0 - tl.0, bl.1 - tl.1);
            let out_w = (ux.hypot(uy).round() as u32).max(1);
            let out_h = (vx.hypot(vy).round() as u32).max(1);
            RgbImage::from_fn(out_w, out_h, |x, y| {
                let s = (x as f32 + 0.5) / out_w as f32;
                let t = (y as f32 + 0.5) / out_h as f32;
                sample_bilinear(page, tl.0 + s * ux + t * vx, tl.1 + s * uy + t * vy)
            })
        }
    }
}

/// Bilinear sample at pixel coordinates, white outside the page.
fn sample_bilinear(page: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = page.dimensions();
    let (x, y) = (x - 0.5, y - 0.5);
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let get = |xi: f32, yi: f32| -> [f32; 3] {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            [255.0; 3]
        } else {
            let Rgb(p) = *page.get_pixel(xi as u32, yi as u32);
            [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])]
        }
    };
    let (a, b) = (get(x0, y0), get(x0 + 1.0, y0));
    let (c, d) = (get(x0, y0 + 1.0), get(x0 + 1.0, y0 + 1.0));
    let mut out = [0u8; 3];
    for i in 0..3 {
        let top = a[i] * (1.0 - fx) + b[i] * fx;
        let bottom = c[i] * (1.0 - fx) + d[i] * fx;
        out[i] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Greedy CTC decoding of one sequence of logits.
///
/// `logits` is `seq_len` rows of `vocab.len() + 1` scores, with the blank as
/// the last class. Confidence is the lowest per-step probability of the chosen
/// class, so one smudged character drags the whole word down.
pub fn ctc_greedy_decode(logits: &[f32], seq_len: usize, vocab: &[char]) -> RecognizedText {
    let classes = vocab.len() + 1;
    let blank = vocab.len();
    let mut value = String::new();
    let mut confidence = 1.0f32;
    let mut previous = None;
    for step in logits.chunks_exact(classes).take(seq_len) {
        let max_logit = step.iter().copied().fold(f32::MIN, f32::max);
        let denom: f32 = step.iter().map(|l| (l - max_logit).exp()).sum();
        let (best, best_logit) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, l)| if l > acc.1 { (i, l) } else { acc });
        confidence = confidence.min((best_logit - max_logit).exp() / denom);
        if best != blank && previous != Some(best) {
            value.push(vocab[best]);
        }
        previous = Some(best);
    }
    if seq_len == 0 {
        confidence = 0.0;
    }
    RecognizedText { value, confidence }
}
