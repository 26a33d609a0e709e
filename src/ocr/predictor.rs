//! Per-page OCR: detection, then recognition, then layout.

use std::sync::Arc;

use image::RgbImage;

use super::{
    detection::{DetectionParams, SegmentationMap, TextDetector, extract_boxes},
    document::{RecognizedPage, Word},
    layout::{LayoutParams, build_page},
    recognition::{TextRecognizer, crop_word},
    strategy::{DetectorArch, RecognizerArch, Strategy},
};
use crate::prelude::*;

/// Somewhere to get models from.
pub trait ModelProvider: Send + Sync + 'static {
    fn detector(&self, arch: DetectorArch) -> Result<Arc<dyn TextDetector>>;
    fn recognizer(&self, arch: RecognizerArch) -> Result<Arc<dyn TextRecognizer>>;
}

/// Everything we learned about one page.
pub struct PagePrediction {
    /// Text probability at the page's own resolution.
    pub segmentation_map: SegmentationMap,
    pub page: RecognizedPage,
}

/// The models and settings chosen for one document.
#[derive(Clone)]
pub struct OcrPredictor {
    strategy: Strategy,
    detector: Arc<dyn TextDetector>,
    recognizer: Arc<dyn TextRecognizer>,
    detection: DetectionParams,
    layout: LayoutParams,
}

impl OcrPredictor {
    pub fn new(
        models: &dyn ModelProvider,
        strategy: Strategy,
        detection: DetectionParams,
        layout: LayoutParams,
    ) -> Result<Self> {
        let detector = models
            .detector(strategy.detector)
            .with_context(|| format!("could not load detector {}", strategy.detector))?;
        let recognizer = models
            .recognizer(strategy.recognizer)
            .with_context(|| format!("could not load recognizer {}", strategy.recognizer))?;
        debug!(
            detector = %detector.arch(),
            recognizer = %recognizer.arch(),
            "Models ready"
        );
        Ok(Self {
            strategy,
            detector,
            recognizer,
            detection,
            layout,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Run OCR on one page. This is slow, so call it from a blocking thread.
    #[instrument(level = "debug", skip(self, image), fields(strategy = %self.strategy))]
    pub fn predict_page(&self, page_idx: usize, image: &RgbImage) -> Result<PagePrediction> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("page {} has no pixels", page_idx));
        }

        let segmentation_map = self.detector.segmentation_map(image)?;
        if segmentation_map.dimensions() != (width, height) {
            return Err(anyhow!(
                "detector returned a {:?} map for a {:?} page",
                segmentation_map.dimensions(),
                (width, height)
            ));
        }

        let boxes = extract_boxes(
            &segmentation_map,
            &self.detection,
            self.strategy.assume_straight_pages,
        );
        debug!(boxes = boxes.len(), "Detected text regions");

        let crops = boxes
            .iter()
            .map(|b| crop_word(image, &b.geometry))
            .collect::<Vec<_>>();
        let texts = if crops.is_empty() {
            vec![]
        } else {
            self.recognizer.recognize(&crops)?
        };
        if texts.len() != boxes.len() {
            return Err(anyhow!(
                "recognizer returned {} results for {} words",
                texts.len(),
                boxes.len()
            ));
        }

        let words = boxes
            .into_iter()
            .zip(texts)
            .map(|(b, text)| Word {
                value: text.value,
                confidence: text.confidence,
                geometry: b.geometry,
            })
            .collect();
        let page = build_page(page_idx, (height, width), words, &self.layout);
        Ok(PagePrediction {
            segmentation_map,
            page,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{Luma, Rgb};

    use super::*;
    use crate::ocr::recognition::RecognizedText;

    /// A detector that marks every dark pixel as text.
    pub(crate) struct DarkPixelDetector {
        pub arch: DetectorArch,
    }

    impl TextDetector for DarkPixelDetector {
        fn arch(&self) -> DetectorArch {
            self.arch
        }

        fn segmentation_map(&self, page: &RgbImage) -> Result<SegmentationMap> {
            Ok(SegmentationMap::from_fn(page.width(), page.height(), |x, y| {
                let Rgb([r, g, b]) = *page.get_pixel(x, y);
                Luma([if r < 128 && g < 128 && b < 128 { 1.0 } else { 0.0 }])
            }))
        }
    }

    /// A detector that always fails.
    pub(crate) struct BrokenDetector;

    impl TextDetector for BrokenDetector {
        fn arch(&self) -> DetectorArch {
            DetectorArch::DbResnet50
        }

        fn segmentation_map(&self, _page: &RgbImage) -> Result<SegmentationMap> {
            Err(anyhow!("bad input tensor"))
        }
    }

    /// A recognizer that names each crop after the order it saw it in.
    #[derive(Default)]
    pub(crate) struct CountingRecognizer {
        pub seen: AtomicUsize,
    }

    impl TextRecognizer for CountingRecognizer {
        fn arch(&self) -> RecognizerArch {
            RecognizerArch::CrnnMobilenetV3Small
        }

        fn recognize(&self, crops: &[RgbImage]) -> Result<Vec<RecognizedText>> {
            Ok(crops
                .iter()
                .map(|_| RecognizedText {
                    value: format!("w{}", self.seen.fetch_add(1, Ordering::SeqCst)),
                    confidence: 0.9,
                })
                .collect())
        }
    }

    /// Hands out fixed models and counts how often it was asked.
    pub(crate) struct FakeModels {
        pub detector: Arc<dyn TextDetector>,
        pub recognizer: Arc<dyn TextRecognizer>,
        pub detector_requests: AtomicUsize,
    }

    impl FakeModels {
        pub(crate) fn new(detector: Arc<dyn TextDetector>) -> Self {
            Self {
                detector,
                recognizer: Arc::new(CountingRecognizer::default()),
                detector_requests: AtomicUsize::new(0),
            }
        }
    }

    impl ModelProvider for FakeModels {
        fn detector(&self, _arch: DetectorArch) -> Result<Arc<dyn TextDetector>> {
            self.detector_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.detector.clone())
        }

        fn recognizer(&self, _arch: RecognizerArch) -> Result<Arc<dyn TextRecognizer>> {
            Ok(self.recognizer.clone())
        }
    }

    /// A white page with a black rectangle for each `(x, y, w, h)`.
    pub(crate) fn page_with_words(
        width: u32,
        height: u32,
        words: &[(u32, u32, u32, u32)],
    ) -> RgbImage {
        let mut page = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        for &(x, y, w, h) in words {
            for yy in y..y + h {
                for xx in x..x + w {
                    page.put_pixel(xx, yy, Rgb([0, 0, 0]));
                }
            }
        }
        page
    }

    fn predictor(models: &FakeModels, height: u32) -> OcrPredictor {
        OcrPredictor::new(
            models,
            Strategy::for_first_page_height(height),
            DetectionParams::default(),
            LayoutParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn words_come_back_in_reading_order() {
        let models = FakeModels::new(Arc::new(DarkPixelDetector {
            arch: DetectorArch::DbResnet50,
        }));
        let predictor = predictor(&models, 1200);
        // Two words on the second line, one on the first.
        let image = page_with_words(
            400,
            1200,
            &[(110, 400, 60, 20), (40, 400, 60, 20), (40, 100, 60, 20)],
        );
        let prediction = predictor.predict_page(0, &image).unwrap();
        assert_eq!(prediction.segmentation_map.dimensions(), (400, 1200));
        let page = prediction.page;
        assert_eq!(page.dimensions, (1200, 400));
        let lines = page
            .blocks
            .iter()
            .flat_map(|b| &b.lines)
            .map(|l| l.words.len())
            .collect::<Vec<_>>();
        assert_eq!(lines, vec![1, 2]);

        // The first line's word is the topmost box.
        let first = &page.words().next().unwrap().geometry;
        let (_, ymin, _, _) = first.envelope();
        assert!(ymin < 0.15);
    }

    #[test]
    fn blank_pages_have_no_words() {
        let models = FakeModels::new(Arc::new(DarkPixelDetector {
            arch: DetectorArch::LinknetResnet18Rotation,
        }));
        let predictor = predictor(&models, 800);
        let image = page_with_words(300, 800, &[]);
        let prediction = predictor.predict_page(3, &image).unwrap();
        assert_eq!(prediction.page.page_idx, 3);
        assert!(prediction.page.blocks.is_empty());
    }

    #[test]
    fn rotated_strategy_still_finds_words() {
        let models = FakeModels::new(Arc::new(DarkPixelDetector {
            arch: DetectorArch::LinknetResnet18Rotation,
        }));
        let predictor = predictor(&models, 600);
        assert!(!predictor.strategy().assume_straight_pages);
        let image = page_with_words(400, 600, &[(50, 50, 120, 30)]);
        let prediction = predictor.predict_page(0, &image).unwrap();
        assert_eq!(prediction.page.words().count(), 1);
    }

    #[test]
    fn detector_errors_are_returned() {
        let models = FakeModels::new(Arc::new(BrokenDetector));
        let predictor = predictor(&models, 1200);
        let image = page_with_words(10, 10, &[]);
        assert!(predictor.predict_page(0, &image).is_err());
    }

    #[test]
    fn wrong_sized_maps_are_rejected() {
        struct TinyMapDetector;
        impl TextDetector for TinyMapDetector {
            fn arch(&self) -> DetectorArch {
                DetectorArch::DbResnet50
            }
            fn segmentation_map(&self, _page: &RgbImage) -> Result<SegmentationMap> {
                Ok(SegmentationMap::new(2, 2))
            }
        }
        let models = FakeModels::new(Arc::new(TinyMapDetector));
        let predictor = predictor(&models, 1200);
        let image = page_with_words(20, 20, &[]);
        assert!(predictor.predict_page(0, &image).is_err());
    }

    #[test]
    fn recognizer_count_mismatch_is_an_error() {
        struct SilentRecognizer;
        impl TextRecognizer for SilentRecognizer {
            fn arch(&self) -> RecognizerArch {
                RecognizerArch::CrnnMobilenetV3Small
            }
            fn recognize(&self, _crops: &[RgbImage]) -> Result<Vec<RecognizedText>> {
                Ok(vec![])
            }
        }
        let mut models = FakeModels::new(Arc::new(DarkPixelDetector {
            arch: DetectorArch::DbResnet50,
        }));
        models.recognizer = Arc::new(SilentRecognizer);
        let predictor = predictor(&models, 1200);
        let image = page_with_words(100, 100, &[(10, 10, 30, 10)]);
        assert!(predictor.predict_page(0, &image).is_err());
    }
}
