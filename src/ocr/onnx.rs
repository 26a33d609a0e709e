//! ONNX Runtime implementations of our detectors and recognizers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use image::{RgbImage, imageops};
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};

use super::{
    detection::{SegmentationMap, TextDetector, resample_map},
    predictor::ModelProvider,
    recognition::{RecognizedText, TextRecognizer, ctc_greedy_decode},
    strategy::{DetectorArch, RecognizerArch},
};
use crate::{
    config::{DetectionConfig, ModelsConfig, RecognitionConfig},
    prelude::*,
};

/// Per-channel normalization used when the detectors were trained.
const DETECTION_MEAN: [f32; 3] = [0.798, 0.785, 0.772];
const DETECTION_STD: [f32; 3] = [0.264, 0.2749, 0.287];

/// Per-channel normalization used when the recognizer was trained.
const RECOGNITION_MEAN: [f32; 3] = [0.694, 0.695, 0.693];
const RECOGNITION_STD: [f32; 3] = [0.299, 0.296, 0.301];

/// Load an ONNX model.
fn load_session(path: &Path) -> Result<Session> {
    info!("Loading ONNX model from {}", path.display());
    Session::builder()
        .context("Failed to create ONNX session builder")?
        .with_intra_threads(num_cpus::get())
        .context("Failed to set thread count")?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load ONNX model from {}", path.display()))
}

/// Run a session on one NCHW tensor, returning the first output's shape and
/// data.
fn run_session(
    session: &Mutex<Session>,
    input: &Array4<f32>,
) -> Result<(Vec<usize>, Vec<f32>)> {
    let tensor =
        TensorRef::from_array_view(input.view()).context("Failed to create input tensor")?;
    let mut session = session
        .lock()
        .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
    let outputs = session
        .run(ort::inputs![tensor])
        .context("ONNX inference failed")?;
    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .context("Failed to extract output tensor")?;
    let shape = shape.iter().map(|&d| d as usize).collect();
    Ok((shape, data.to_vec()))
}

/// Where a page landed inside a square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Placement {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Resize `page` to fit a `size` x `size` square, keeping its aspect ratio,
/// and centre it.
fn place_in_square(page: &RgbImage, size: u32) -> (RgbImage, Placement) {
    let (w, h) = page.dimensions();
    let scale = size as f32 / w.max(h).max(1) as f32;
    let width = ((w as f32 * scale).round() as u32).clamp(1, size);
    let height = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(page, width, height, imageops::FilterType::Triangle);
    let placement = Placement {
        x: (size - width) / 2,
        y: (size - height) / 2,
        width,
        height,
    };
    (resized, placement)
}

/// Write a normalized image into `tensor[batch]` at `(x, y)`. Everything else
/// in the tensor should already hold normalized black.
fn write_normalized(
    tensor: &mut Array4<f32>,
    batch: usize,
    image: &RgbImage,
    (x0, y0): (u32, u32),
    mean: &[f32; 3],
    std: &[f32; 3],
) {
    for (x, y, pixel) in image.enumerate_pixels() {
        let (tx, ty) = ((x + x0) as usize, (y + y0) as usize);
        for c in 0..3 {
            tensor[[batch, c, ty, tx]] = (f32::from(pixel[c]) / 255.0 - mean[c]) / std[c];
        }
    }
}

/// A tensor filled with normalized black, which is what padding looks like
/// to the model.
fn padded_tensor(
    batch: usize,
    height: u32,
    width: u32,
    mean: &[f32; 3],
    std: &[f32; 3],
) -> Array4<f32> {
    let mut tensor = Array4::zeros((batch, 3, height as usize, width as usize));
    for c in 0..3 {
        tensor
            .slice_mut(ndarray::s![.., c, .., ..])
            .fill(-mean[c] / std[c]);
    }
    tensor
}

/// A segmentation detector exported to ONNX.
pub struct OnnxDetector {
    arch: DetectorArch,
    session: Mutex<Session>,
    config: DetectionConfig,
}

impl OnnxDetector {
    pub fn load(arch: DetectorArch, path: &Path, config: DetectionConfig) -> Result<Self> {
        Ok(Self {
            arch,
            session: Mutex::new(load_session(path)?),
            config,
        })
    }
}

impl TextDetector for OnnxDetector {
    fn arch(&self) -> DetectorArch {
        self.arch
    }

    #[instrument(level = "debug", skip_all, fields(arch = %self.arch))]
    fn segmentation_map(&self, page: &RgbImage) -> Result<SegmentationMap> {
        let (width, height) = page.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot detect text on an empty page"));
        }
        let size = self.config.input_size;
        let (resized, placement) = place_in_square(page, size);
        let mut input = padded_tensor(1, size, size, &DETECTION_MEAN, &DETECTION_STD);
        write_normalized(
            &mut input,
            0,
            &resized,
            (placement.x, placement.y),
            &DETECTION_MEAN,
            &DETECTION_STD,
        );

        let (shape, data) = run_session(&self.session, &input)?;
        let map = output_to_map(&shape, &data, size, placement, self.config.logits)?;
        Ok(resample_map(&map, width, height))
    }
}

/// Cut the unpadded part out of a detector's `[1, 1, H, W]` output.
fn output_to_map(
    shape: &[usize],
    data: &[f32],
    input_size: u32,
    placement: Placement,
    logits: bool,
) -> Result<SegmentationMap> {
    let (out_h, out_w) = match shape {
        [1, 1, h, w] | [1, h, w] => (*h, *w),
        _ => return Err(anyhow!("unexpected detection output shape {:?}", shape)),
    };
    if out_h == 0 || out_w == 0 || data.len() != out_h * out_w {
        return Err(anyhow!("unexpected detection output shape {:?}", shape));
    }
    // The output may be smaller than the input, so scale the placement.
    let sx = out_w as f32 / input_size as f32;
    let sy = out_h as f32 / input_size as f32;
    let x0 = ((placement.x as f32 * sx) as usize).min(out_w - 1);
    let y0 = ((placement.y as f32 * sy) as usize).min(out_h - 1);
    let w = ((placement.width as f32 * sx).round() as usize).clamp(1, out_w - x0);
    let h = ((placement.height as f32 * sy).round() as usize).clamp(1, out_h - y0);
    let map = SegmentationMap::from_fn(w as u32, h as u32, |x, y| {
        let v = data[(y0 + y as usize) * out_w + x0 + x as usize];
        let p = if logits { 1.0 / (1.0 + (-v).exp()) } else { v };
        image::Luma([p])
    });
    Ok(map)
}

/// A CTC recognizer exported to ONNX.
pub struct OnnxRecognizer {
    arch: RecognizerArch,
    session: Mutex<Session>,
    config: RecognitionConfig,
    vocab: Vec<char>,
}

impl OnnxRecognizer {
    pub fn load(arch: RecognizerArch, path: &Path, config: RecognitionConfig) -> Result<Self> {
        let vocab = config.vocab_chars();
        Ok(Self {
            arch,
            session: Mutex::new(load_session(path)?),
            config,
            vocab,
        })
    }

    fn recognize_batch(&self, crops: &[RgbImage]) -> Result<Vec<RecognizedText>> {
        let (h, w) = (self.config.input_height, self.config.input_width);
        let mut input =
            padded_tensor(crops.len(), h, w, &RECOGNITION_MEAN, &RECOGNITION_STD);
        for (i, crop) in crops.iter().enumerate() {
            let resized = fit_crop(crop, w, h);
            write_normalized(
                &mut input,
                i,
                &resized,
                (0, 0),
                &RECOGNITION_MEAN,
                &RECOGNITION_STD,
            );
        }

        let (shape, data) = run_session(&self.session, &input)?;
        decode_recognition_output(&shape, &data, crops.len(), &self.vocab)
    }
}

/// Decode a `[batch, seq_len, classes]` logits tensor, one result per crop.
fn decode_recognition_output(
    shape: &[usize],
    data: &[f32],
    crops: usize,
    vocab: &[char],
) -> Result<Vec<RecognizedText>> {
    let &[batch, seq_len, classes] = shape else {
        return Err(anyhow!("unexpected recognition output shape {:?}", shape));
    };
    if batch != crops || classes != vocab.len() + 1 || seq_len == 0 {
        return Err(anyhow!(
            "recognition output shape {:?} does not match {} crops and {} characters",
            shape,
            crops,
            vocab.len()
        ));
    }
    if data.len() != batch * seq_len * classes {
        return Err(anyhow!(
            "recognition output has {} values, expected {} for shape {:?}",
            data.len(),
            batch * seq_len * classes,
            shape
        ));
    }
    Ok(data
        .chunks_exact(seq_len * classes)
        .map(|logits| ctc_greedy_decode(logits, seq_len, vocab))
        .collect())
}

/// Shrink or grow a word crop to fit `width` x `height`, keeping its aspect
/// ratio. The result is anchored at the top left.
fn fit_crop(crop: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (w, h) = crop.dimensions();
    let scale = (width as f32 / w.max(1) as f32).min(height as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, width);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, height);
    imageops::resize(crop, new_w, new_h, imageops::FilterType::Triangle)
}

impl TextRecognizer for OnnxRecognizer {
    fn arch(&self) -> RecognizerArch {
        self.arch
    }

    #[instrument(level = "debug", skip_all, fields(arch = %self.arch, crops = crops.len()))]
    fn recognize(&self, crops: &[RgbImage]) -> Result<Vec<RecognizedText>> {
        let mut results = Vec::with_capacity(crops.len());
        for batch in crops.chunks(self.config.batch_size.max(1)) {
            results.extend(self.recognize_batch(batch)?);
        }
        Ok(results)
    }
}

/// Loads ONNX models on first use and keeps them for the life of the process.
pub struct OnnxModels {
    models: ModelsConfig,
    detection: DetectionConfig,
    recognition: RecognitionConfig,
    detectors: Mutex<HashMap<DetectorArch, Arc<dyn TextDetector>>>,
    recognizers: Mutex<HashMap<RecognizerArch, Arc<dyn TextRecognizer>>>,
}

impl OnnxModels {
    pub fn new(
        models: ModelsConfig,
        detection: DetectionConfig,
        recognition: RecognitionConfig,
    ) -> Self {
        Self {
            models,
            detection,
            recognition,
            detectors: Mutex::new(HashMap::new()),
            recognizers: Mutex::new(HashMap::new()),
        }
    }
}

impl ModelProvider for OnnxModels {
    fn detector(&self, arch: DetectorArch) -> Result<Arc<dyn TextDetector>> {
        let mut detectors = self
            .detectors
            .lock()
            .map_err(|_| anyhow!("detector cache lock poisoned"))?;
        if let Some(detector) = detectors.get(&arch) {
            return Ok(detector.clone());
        }
        let path = self.models.path_for(arch.name());
        let detector: Arc<dyn TextDetector> =
            Arc::new(OnnxDetector::load(arch, &path, self.detection.clone())?);
        detectors.insert(arch, detector.clone());
        Ok(detector)
    }

    fn recognizer(&self, arch: RecognizerArch) -> Result<Arc<dyn TextRecognizer>> {
        let mut recognizers = self
            .recognizers
            .lock()
            .map_err(|_| anyhow!("recognizer cache lock poisoned"))?;
        if let Some(recognizer) = recognizers.get(&arch) {
            return Ok(recognizer.clone());
        }
        let path = self.models.path_for(arch.name());
        let recognizer: Arc<dyn TextRecognizer> =
            Arc::new(OnnxRecognizer::load(arch, &path, self.recognition.clone())?);
        recognizers.insert(arch, recognizer.clone());
        Ok(recognizer)
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn placement_centres_and_preserves_aspect() {
        let page = RgbImage::new(200, 100);
        let (resized, placement) = place_in_square(&page, 64);
        assert_eq!(resized.dimensions(), (64, 32));
        assert_eq!(
            placement,
            Placement {
                x: 0,
                y: 16,
                width: 64,
                height: 32,
            }
        );
    }

    #[test]
    fn padding_is_normalized_black() {
        let mut tensor = padded_tensor(1, 4, 4, &DETECTION_MEAN, &DETECTION_STD);
        let white = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        write_normalized(
            &mut tensor,
            0,
            &white,
            (1, 1),
            &DETECTION_MEAN,
            &DETECTION_STD,
        );
        let black = -DETECTION_MEAN[0] / DETECTION_STD[0];
        let white = (1.0 - DETECTION_MEAN[0]) / DETECTION_STD[0];
        assert!((tensor[[0, 0, 0, 0]] - black).abs() < 1e-6);
        assert!((tensor[[0, 0, 1, 1]] - white).abs() < 1e-6);
        assert!((tensor[[0, 0, 3, 3]] - black).abs() < 1e-6);
    }

    #[test]
    fn output_map_drops_padding() {
        // A 4x4 output where only the middle two rows are page.
        let data = vec![
            0.0, 0.0, 0.0, 0.0, //
            0.1, 0.2, 0.3, 0.4, //
            0.5, 0.6, 0.7, 0.8, //
            0.0, 0.0, 0.0, 0.0,
        ];
        let placement = Placement {
            x: 0,
            y: 1,
            width: 4,
            height: 2,
        };
        let map = output_to_map(&[1, 1, 4, 4], &data, 4, placement, false).unwrap();
        assert_eq!(map.dimensions(), (4, 2));
        assert_eq!(map.get_pixel(0, 0)[0], 0.1);
        assert_eq!(map.get_pixel(3, 1)[0], 0.8);
    }

    #[test]
    fn logits_are_squashed() {
        let placement = Placement {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        };
        let map = output_to_map(&[1, 1, 1, 1], &[0.0], 1, placement, true).unwrap();
        assert!((map.get_pixel(0, 0)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn bad_output_shapes_are_errors() {
        let placement = Placement {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        };
        assert!(output_to_map(&[2, 2], &[0.0; 4], 2, placement, false).is_err());
        assert!(output_to_map(&[1, 1, 2, 2], &[0.0; 3], 2, placement, false).is_err());
    }

    #[test]
    fn recognition_output_is_checked_before_decoding() {
        let vocab = ['a', 'b'];
        // Empty sequences, truncated data and the wrong class count.
        assert!(decode_recognition_output(&[2, 0, 3], &[], 2, &vocab).is_err());
        assert!(decode_recognition_output(&[1, 2, 3], &[0.0; 5], 1, &vocab).is_err());
        assert!(decode_recognition_output(&[1, 2, 4], &[0.0; 8], 1, &vocab).is_err());
        assert!(decode_recognition_output(&[1, 2, 3], &[0.0; 6], 2, &vocab).is_err());

        // "a" then blank.
        let logits = [5.0, 0.0, 0.0, 0.0, 0.0, 5.0];
        let texts = decode_recognition_output(&[1, 2, 3], &logits, 1, &vocab).unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].value, "a");
    }

    #[test]
    fn crops_fit_recognizer_input() {
        let wide = RgbImage::new(400, 20);
        assert_eq!(fit_crop(&wide, 128, 32).dimensions(), (128, 6));
        let tall = RgbImage::new(10, 100);
        assert_eq!(fit_crop(&tall, 128, 32).dimensions(), (3, 32));
    }

    #[test]
    #[ignore = "needs ONNX model files in ./models"]
    fn loads_real_models() {
        let models = OnnxModels::new(
            ModelsConfig::default(),
            DetectionConfig::default(),
            RecognitionConfig::default(),
        );
        let detector = models.detector(DetectorArch::DbResnet50).unwrap();
        let page = RgbImage::from_pixel(600, 800, Rgb([255, 255, 255]));
        let map = detector.segmentation_map(&page).unwrap();
        assert_eq!(map.dimensions(), (600, 800));
        let again = models.detector(DetectorArch::DbResnet50).unwrap();
        assert!(Arc::ptr_eq(&detector, &again));
    }
}
