//! Choosing detection and recognition models from a document's first page.

use std::fmt;

use schemars::JsonSchema;

use crate::prelude::*;

/// Pages taller than this many pixels get the large-page detector.
pub const LARGE_PAGE_HEIGHT_THRESHOLD: u32 = 1000;

/// Text detector architectures.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectorArch {
    /// DBNet on a ResNet-50 backbone. Tuned for large, upright scans.
    DbResnet50,
    /// LinkNet on a ResNet-18 backbone, trained on rotated pages.
    LinknetResnet18Rotation,
}

impl DetectorArch {
    /// Every detector we know about.
    pub const ALL: [DetectorArch; 2] =
        [DetectorArch::DbResnet50, DetectorArch::LinknetResnet18Rotation];

    /// The architecture name, which is also the model's file stem.
    pub fn name(self) -> &'static str {
        match self {
            DetectorArch::DbResnet50 => "db_resnet50",
            DetectorArch::LinknetResnet18Rotation => "linknet_resnet18_rotation",
        }
    }

    /// Does this detector find text at arbitrary angles?
    pub fn is_rotation_tolerant(self) -> bool {
        self == DetectorArch::LinknetResnet18Rotation
    }
}

impl fmt::Display for DetectorArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Text recognizer architectures.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecognizerArch {
    /// CRNN on a MobileNetV3-Small backbone, decoded with CTC.
    CrnnMobilenetV3Small,
}

impl RecognizerArch {
    /// The architecture name, which is also the model's file stem.
    pub fn name(self) -> &'static str {
        match self {
            RecognizerArch::CrnnMobilenetV3Small => "crnn_mobilenet_v3_small",
        }
    }
}

impl fmt::Display for RecognizerArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The models used for every page of one document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Strategy {
    /// Which detector to run.
    pub detector: DetectorArch,
    /// Which recognizer to run.
    pub recognizer: RecognizerArch,
    /// Treat text as upright, producing axis-aligned word boxes.
    pub assume_straight_pages: bool,
}

impl Strategy {
    /// Pick a strategy from the height of a document's first page.
    ///
    /// The same strategy is then used for every page of the document, even if
    /// later pages have a different size.
    pub fn for_first_page_height(height: u32) -> Self {
        let detector = if height > LARGE_PAGE_HEIGHT_THRESHOLD {
            DetectorArch::DbResnet50
        } else {
            DetectorArch::LinknetResnet18Rotation
        };
        Self {
            detector,
            recognizer: RecognizerArch::CrnnMobilenetV3Small,
            assume_straight_pages: !detector.is_rotation_tolerant(),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} + {} (straight pages: {})",
            self.detector, self.recognizer, self.assume_straight_pages
        )
    }
}
