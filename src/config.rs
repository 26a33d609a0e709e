//! Pipeline configuration, read from an optional TOML file.
//!
//! Every key has a default, so an empty file (or no file) is a valid
//! configuration. Unknown keys are errors, since a typo in a threshold name
//! would otherwise be silently ignored.

use std::collections::BTreeMap;

use toml_span::{DeserError, de_helpers::TableHelper, value::ValueInner};

use crate::{
    ocr::{
        detection::DetectionParams,
        layout::LayoutParams,
        recognition::DEFAULT_VOCAB,
        strategy::{DetectorArch, RecognizerArch},
    },
    prelude::*,
    rate_limit::RateLimit,
    store::{ChunkLayout, column_number},
    toml_utils::{custom_deser_error, describe_deser_error, from_toml_str},
};

/// Everything tunable about the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineConfig {
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub layout: LayoutParams,
    pub store: StoreConfig,
}

impl PipelineConfig {
    /// Load configuration from `path`, or use the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let source = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&path.display().to_string(), &source)
    }

    /// Parse and validate a TOML configuration. `name` is used in error
    /// messages.
    pub fn from_toml(name: &str, source: &str) -> Result<Self> {
        let config = from_toml_str::<PipelineConfig>(source)
            .map_err(|err| anyhow!("{}", describe_deser_error(name, source, &err)))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", name))?;
        Ok(config)
    }

    /// Check the values that would otherwise fail deep inside the pipeline.
    fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(anyhow!("{} must be between 0 and 1, got {}", name, v))
            }
        };
        unit("detection.bin_thresh", self.detection.params.bin_thresh)?;
        unit("detection.box_thresh", self.detection.params.box_thresh)?;
        unit("layout.paragraph_break", self.layout.paragraph_break)?;
        if self.detection.params.unclip_ratio < 0.0 {
            return Err(anyhow!("detection.unclip_ratio must not be negative"));
        }
        if self.detection.input_size == 0 {
            return Err(anyhow!("detection.input_size must be positive"));
        }
        if self.recognition.input_height == 0 || self.recognition.input_width == 0 {
            return Err(anyhow!("recognition input size must be positive"));
        }
        if self.recognition.batch_size == 0 {
            return Err(anyhow!("recognition.batch_size must be positive"));
        }
        if self.recognition.vocab.is_empty() {
            return Err(anyhow!("recognition.vocab must not be empty"));
        }
        if self.store.layout.max_chunk_chars == 0 {
            return Err(anyhow!("store.max_chunk_chars must be positive"));
        }
        if self.store.layout.base_column == 0 {
            return Err(anyhow!("store.base_column is 1-based and must be positive"));
        }
        Ok(())
    }
}

impl<'de> toml_span::Deserialize<'de> for PipelineConfig {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let models = th.optional("models").unwrap_or_default();
        let detection = th.optional("detection").unwrap_or_default();
        let recognition = th.optional("recognition").unwrap_or_default();
        let layout = th
            .optional::<LayoutSection>("layout")
            .map(|s| s.0)
            .unwrap_or_default();
        let store = th.optional("store").unwrap_or_default();
        th.finalize(None)?;
        Ok(Self {
            models,
            detection,
            recognition,
            layout,
            store,
        })
    }
}

/// Where to find model files.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelsConfig {
    /// Directory holding `<architecture>.onnx` files.
    pub dir: PathBuf,
    /// Per-architecture paths that replace the default location.
    pub overrides: BTreeMap<String, PathBuf>,
}

impl ModelsConfig {
    /// The model file for an architecture name.
    pub fn path_for(&self, arch_name: &str) -> PathBuf {
        self.overrides
            .get(arch_name)
            .cloned()
            .unwrap_or_else(|| self.dir.join(format!("{}.onnx", arch_name)))
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            overrides: BTreeMap::new(),
        }
    }
}

impl<'de> toml_span::Deserialize<'de> for ModelsConfig {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let mut config = Self::default();
        if let Some(dir) = th.optional::<String>("dir") {
            config.dir = PathBuf::from(dir);
        }
        let arch_names = DetectorArch::ALL
            .iter()
            .map(|arch| arch.name())
            .chain([RecognizerArch::CrnnMobilenetV3Small.name()]);
        for name in arch_names {
            if let Some(path) = th.optional::<String>(name) {
                config.overrides.insert(name.to_owned(), PathBuf::from(path));
            }
        }
        th.finalize(None)?;
        Ok(config)
    }
}

/// Detection settings.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionConfig {
    /// Side of the square model input, in pixels.
    pub input_size: u32,
    /// Does the model output raw logits instead of probabilities?
    pub logits: bool,
    pub params: DetectionParams,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 1024,
            logits: false,
            params: DetectionParams::default(),
        }
    }
}

impl<'de> toml_span::Deserialize<'de> for DetectionConfig {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let mut config = Self::default();
        if let Some(v) = th.optional("input_size") {
            config.input_size = v;
        }
        if let Some(v) = th.optional("logits") {
            config.logits = v;
        }
        if let Some(v) = th.optional::<f64>("bin_thresh") {
            config.params.bin_thresh = v as f32;
        }
        if let Some(v) = th.optional::<f64>("box_thresh") {
            config.params.box_thresh = v as f32;
        }
        if let Some(v) = th.optional("min_component_px") {
            config.params.min_component_px = v;
        }
        if let Some(v) = th.optional::<f64>("unclip_ratio") {
            config.params.unclip_ratio = v as f32;
        }
        th.finalize(None)?;
        Ok(config)
    }
}

/// Recognition settings.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionConfig {
    pub input_height: u32,
    pub input_width: u32,
    /// How many word crops to send to the model at once.
    pub batch_size: usize,
    /// Characters the model can output, in class order.
    pub vocab: String,
}

impl RecognitionConfig {
    pub fn vocab_chars(&self) -> Vec<char> {
        self.vocab.chars().collect()
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            input_height: 32,
            input_width: 128,
            batch_size: 64,
            vocab: DEFAULT_VOCAB.to_owned(),
        }
    }
}

impl<'de> toml_span::Deserialize<'de> for RecognitionConfig {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let mut config = Self::default();
        if let Some(v) = th.optional("input_height") {
            config.input_height = v;
        }
        if let Some(v) = th.optional("input_width") {
            config.input_width = v;
        }
        if let Some(v) = th.optional("batch_size") {
            config.batch_size = v;
        }
        if let Some(v) = th.optional("vocab") {
            config.vocab = v;
        }
        th.finalize(None)?;
        Ok(config)
    }
}

/// `[layout]`, which maps straight onto [`LayoutParams`].
struct LayoutSection(LayoutParams);

impl<'de> toml_span::Deserialize<'de> for LayoutSection {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let mut params = LayoutParams::default();
        if let Some(v) = th.optional("resolve_blocks") {
            params.resolve_blocks = v;
        }
        if let Some(v) = th.optional::<f64>("paragraph_break") {
            params.paragraph_break = v as f32;
        }
        th.finalize(None)?;
        Ok(Self(params))
    }
}

/// Store settings shared by every backend.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub layout: ChunkLayout,
    pub write_rate_limit: RateLimit,
    pub transient_retries: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            layout: ChunkLayout::default(),
            write_rate_limit: RateLimit::default(),
            transient_retries: 5,
        }
    }
}

impl<'de> toml_span::Deserialize<'de> for StoreConfig {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let mut config = Self::default();
        if let Some(v) = th.optional("max_chunk_chars") {
            config.layout.max_chunk_chars = v;
        }
        if let Some(ColumnSpec(v)) = th.optional("base_column") {
            config.layout.base_column = v;
        }
        if let Some(v) = th.optional("write_rate_limit") {
            config.write_rate_limit = v;
        }
        if let Some(v) = th.optional("transient_retries") {
            config.transient_retries = v;
        }
        th.finalize(None)?;
        Ok(config)
    }
}

/// A spreadsheet column, written either as a 1-based number or as letters.
struct ColumnSpec(u32);

impl<'de> toml_span::Deserialize<'de> for ColumnSpec {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let span = value.span;
        match value.take() {
            ValueInner::Integer(n) => u32::try_from(n)
                .map(ColumnSpec)
                .map_err(|_| custom_deser_error(span, format!("bad column number {}", n))),
            ValueInner::String(letters) => column_number(&letters)
                .map(ColumnSpec)
                .map_err(|err| custom_deser_error(span, format!("{:#}", err))),
            _ => Err(custom_deser_error(
                span,
                "expected a column number or letters like \"AL\"",
            )),
        }
    }
}

impl<'de> toml_span::Deserialize<'de> for RateLimit {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let span = value.span;
        let text = <String as toml_span::Deserialize>::deserialize(value)?;
        text.parse::<RateLimit>()
            .map_err(|err| custom_deser_error(span, format!("{:#}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitPeriod;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PipelineConfig::from_toml("empty.toml", "").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.store.layout.max_chunk_chars, 20_000);
        assert_eq!(config.store.layout.base_column, 38);
        assert_eq!(config.detection.input_size, 1024);
        assert_eq!(
            config.models.path_for("db_resnet50"),
            Path::new("models/db_resnet50.onnx")
        );
    }

    #[test]
    fn reads_every_section() {
        let source = r#"
[models]
dir = "/opt/ocr"
linknet_resnet18_rotation = "/tmp/linknet.onnx"

[detection]
input_size = 512
bin_thresh = 0.25
logits = true

[recognition]
batch_size = 8
vocab = "abc"

[layout]
resolve_blocks = true

[store]
max_chunk_chars = 100
base_column = 2
write_rate_limit = "5/s"
transient_retries = 0
"#;
        let config = PipelineConfig::from_toml("full.toml", source).unwrap();
        assert_eq!(
            config.models.path_for("db_resnet50"),
            Path::new("/opt/ocr/db_resnet50.onnx")
        );
        assert_eq!(
            config.models.path_for("linknet_resnet18_rotation"),
            Path::new("/tmp/linknet.onnx")
        );
        assert_eq!(config.detection.input_size, 512);
        assert!(config.detection.logits);
        assert!((config.detection.params.bin_thresh - 0.25).abs() < 1e-6);
        assert_eq!(config.recognition.batch_size, 8);
        assert_eq!(config.recognition.vocab_chars(), vec!['a', 'b', 'c']);
        assert!(config.layout.resolve_blocks);
        assert_eq!(config.store.layout.max_chunk_chars, 100);
        assert_eq!(config.store.layout.base_column, 2);
        assert_eq!(
            config.store.write_rate_limit,
            RateLimit::new(5, RateLimitPeriod::Second)
        );
        assert_eq!(config.store.transient_retries, 0);
    }

    #[test]
    fn unknown_keys_are_rejected_with_location() {
        let source = "[detection]\nbin_threshold = 0.3\n";
        let err = PipelineConfig::from_toml("bad.toml", source).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("bad.toml:2:"), "{msg}");
    }

    #[test]
    fn bad_rate_limits_are_rejected() {
        let source = "[store]\nwrite_rate_limit = \"0/m\"\n";
        assert!(PipelineConfig::from_toml("bad.toml", source).is_err());
    }

    #[test]
    fn base_column_accepts_letters() {
        let config =
            PipelineConfig::from_toml("letters.toml", "[store]\nbase_column = \"AM\"\n")
                .unwrap();
        assert_eq!(config.store.layout.base_column, 39);
        assert!(
            PipelineConfig::from_toml("bad.toml", "[store]\nbase_column = \"A1\"\n").is_err()
        );
        assert!(PipelineConfig::from_toml("neg.toml", "[store]\nbase_column = -3\n").is_err());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let source = "[store]\nmax_chunk_chars = 0\n";
        let err = PipelineConfig::from_toml("bad.toml", source).unwrap_err();
        assert!(format!("{:#}", err).contains("max_chunk_chars"));
    }
}
