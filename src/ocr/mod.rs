//! The document OCR pipeline.
//!
//! Each document goes through the same stages, one page at a time:
//!
//! 1. Rasterize pages ([`PageIter`]).
//! 2. Pick models from the first page's height ([`Strategy`]).
//! 3. Detect and recognize words on each page ([`OcrPredictor`]).
//! 4. Join every word into one string ([`TextAggregator`]).
//! 5. Write that string into spreadsheet cells ([`ChunkedCellWriter`]).
//!
//! Any failure ends the current document and is recorded in its
//! [`OcrReport`]. It never stops the batch.

use std::sync::Arc;

use futures::StreamExt as _;

use self::{
    aggregate::TextAggregator,
    error::DocumentError,
    predictor::{ModelProvider, OcrPredictor, PagePrediction},
    report::{DocumentStatus, OcrInput, OcrReport},
    strategy::Strategy,
};
use crate::{
    async_utils::blocking_iter_streams::{
        BlockingIterStream, spawn_blocking_propagating_panics,
    },
    config::PipelineConfig,
    page_iter::{Page, PageIter, PageIterOptions},
    prelude::*,
    store::{ChunkedCellWriter, WriteOutcome},
    ui::{ProgressConfig, Ui},
};

pub mod aggregate;
pub mod detection;
pub mod document;
pub mod error;
pub mod layout;
pub mod onnx;
pub mod predictor;
pub mod recognition;
pub mod report;
pub mod strategy;

/// Optional local copies of what we produce.
#[derive(Clone, Debug, Default)]
pub struct OutputDirs {
    /// Synthesized page images, for straight-page documents only.
    pub preview_dir: Option<PathBuf>,
    /// Extracted text, one file per document.
    pub text_dir: Option<PathBuf>,
}

/// Everything needed to process documents, shared across the batch.
pub struct DocumentPipeline {
    ui: Ui,
    models: Arc<dyn ModelProvider>,
    writer: ChunkedCellWriter,
    config: PipelineConfig,
    page_iter_opts: PageIterOptions,
    output_dirs: OutputDirs,
}

impl DocumentPipeline {
    pub fn new(
        ui: Ui,
        models: Arc<dyn ModelProvider>,
        writer: ChunkedCellWriter,
        config: PipelineConfig,
        page_iter_opts: PageIterOptions,
        output_dirs: OutputDirs,
    ) -> Self {
        Self {
            ui,
            models,
            writer,
            config,
            page_iter_opts,
            output_dirs,
        }
    }

    /// OCR one document and store its text. This never fails. Errors end up
    /// in the report.
    #[instrument(level = "info", skip_all, fields(id = %input.id))]
    pub async fn process_document(&self, input: &OcrInput) -> OcrReport {
        let mut report = OcrReport::new(input);
        match self.try_process_document(input, &mut report).await {
            Ok(()) => {
                debug!(status = ?report.status, "Document finished");
            }
            Err(err) => {
                error!(
                    id = %input.id,
                    error_kind = ?err.kind(),
                    page_idx = ?err.page_idx(),
                    segment_idx = ?err.segment_idx(),
                    "Document failed: {}",
                    err
                );
                report.status = DocumentStatus::Failed;
                report.error_kind = Some(err.kind());
                report.page_idx = err.page_idx();
                report.segment_idx = err.segment_idx();
                if let DocumentError::StoreWrite { written, .. } = &err {
                    report.chunks_written = *written;
                }
                // Put the failure first, ahead of any warnings.
                report
                    .errors
                    .insert(0, format!("{:#}", anyhow::Error::new(err)));
            }
        }
        report
    }

    async fn try_process_document(
        &self,
        input: &OcrInput,
        report: &mut OcrReport,
    ) -> Result<(), DocumentError> {
        let text = self.extract_text(input, report).await?;
        report.text_chars = text.chars().count();
        self.save_text(input, &text, report).await;

        match self.writer.write(&input.id, &text).await? {
            WriteOutcome::Written { row, chunks } => {
                info!(row, chunks, "Stored text");
                report.chunks_written = chunks;
                report.status = DocumentStatus::Ok;
            }
            WriteOutcome::Empty => {
                info!("No text found, nothing stored");
                report.status = DocumentStatus::Empty;
            }
        }
        Ok(())
    }

    /// Run OCR on every page, in order, and join the results.
    async fn extract_text(
        &self,
        input: &OcrInput,
        report: &mut OcrReport,
    ) -> Result<String, DocumentError> {
        let page_iter =
            PageIter::from_path(&input.path, &self.page_iter_opts, input.password())
                .await
                .map_err(|error| DocumentError::DocumentOpen { error })?;
        report.errors.extend(page_iter.warnings().iter().cloned());
        if let Some(warning) = page_iter.incomplete_warning() {
            warn!("{}", warning);
            report.errors.push(warning);
        }

        let page_count = page_iter
            .total_pages()
            .min(self.page_iter_opts.max_pages.unwrap_or(usize::MAX));
        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📃",
                msg: "OCRing pages",
                done_msg: "OCRed pages",
            },
            page_count as u64,
        );

        let mut pages = BlockingIterStream::new(page_iter);
        let mut document_predictor: Option<OcrPredictor> = None;
        let mut aggregator = TextAggregator::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|error| DocumentError::DocumentOpen { error })?;
            let page_idx = page.index;

            // The first page decides the models for the whole document.
            let predictor = match &document_predictor {
                Some(predictor) => predictor.clone(),
                None => {
                    let strategy = Strategy::for_first_page_height(page.image.height());
                    info!(%strategy, "Selected OCR strategy");
                    report.strategy = Some(strategy);
                    let loaded = OcrPredictor::new(
                        self.models.as_ref(),
                        strategy,
                        self.config.detection.params.clone(),
                        self.config.layout.clone(),
                    )
                    .map_err(|error| DocumentError::ModelInference { page_idx, error })?;
                    document_predictor = Some(loaded.clone());
                    loaded
                }
            };

            let preview_path = self.preview_path(input, &predictor, page_idx);
            let prediction = spawn_blocking_propagating_panics(move || {
                predict_page(&predictor, page, preview_path.as_deref())
            })
            .await
            .map_err(|error| DocumentError::ModelInference { page_idx, error })?;
            let (prediction, preview_warning) = prediction;
            report.errors.extend(preview_warning);

            debug!(
                page_idx,
                words = prediction.page.words().count(),
                "Recognized page"
            );
            aggregator.push_page(&prediction.page);
            report.page_count += 1;
            pb.inc(1);
        }
        pb.finish_and_clear();

        debug!(words = aggregator.word_count(), "Aggregated document text");
        Ok(aggregator.finish())
    }

    /// Where to save a page preview, if we're saving one.
    fn preview_path(
        &self,
        input: &OcrInput,
        predictor: &OcrPredictor,
        page_idx: usize,
    ) -> Option<PathBuf> {
        let dir = self.output_dirs.preview_dir.as_ref()?;
        if !predictor.strategy().assume_straight_pages {
            return None;
        }
        Some(dir.join(format!("{}_p{:04}.png", sanitize_file_stem(&input.id), page_idx)))
    }

    /// Save a local copy of the text, if asked. Failures here are warnings,
    /// because the store is the real destination.
    async fn save_text(&self, input: &OcrInput, text: &str, report: &mut OcrReport) {
        let Some(dir) = &self.output_dirs.text_dir else {
            return;
        };
        let path = dir.join(format!("{}.txt", sanitize_file_stem(&input.id)));
        if let Err(err) = tokio::fs::write(&path, text).await {
            let msg = format!("could not save text to {}: {}", path.display(), err);
            warn!("{}", msg);
            report.errors.push(msg);
        }
    }
}

/// Predict one page and optionally save its preview. Returns the prediction
/// and any preview warning.
fn predict_page(
    predictor: &OcrPredictor,
    page: Page,
    preview_path: Option<&Path>,
) -> Result<(PagePrediction, Option<String>)> {
    let prediction = predictor
        .predict_page(page.index, &page.image)
        .with_context(|| format!("could not OCR page {}", page.index))?;
    let map = prediction.segmentation_map.as_raw();
    debug!(
        page_idx = page.index,
        mean_text_prob = map.iter().sum::<f32>() / map.len().max(1) as f32,
        "Segmentation map ready"
    );
    let warning = preview_path.and_then(|path| {
        prediction
            .page
            .synthesize()
            .save(path)
            .err()
            .map(|err| format!("could not save preview {}: {}", path.display(), err))
    });
    if let Some(warning) = &warning {
        warn!("{}", warning);
    }
    Ok((prediction, warning))
}

/// Turn a row key (often a URL) into something safe to use as a file name.
pub fn sanitize_file_stem(id: &str) -> String {
    let stem = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect::<String>();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        "document".to_owned()
    } else {
        stem.to_owned()
    }
}
