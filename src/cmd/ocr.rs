//! The `ocr` subcommand.

use std::sync::Arc;

use clap::{Args, ValueEnum};
use futures::StreamExt as _;

use super::StreamOpts;
use crate::{
    config::PipelineConfig,
    ocr::{
        DocumentPipeline, OutputDirs,
        onnx::OnnxModels,
        report::{OcrInput, OcrReport},
    },
    page_iter::PageIterOptions,
    prelude::*,
    store::{
        CellStore, ChunkedCellWriter,
        csv_store::CsvStore,
        sheets::{SheetsOpts, SheetsStore},
    },
    ui::{ProgressConfig, Ui},
};

/// Where extracted text goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// A Google Sheets worksheet.
    Sheets,
    /// A local CSV file, with no header row.
    Csv,
}

/// Options for the store.
#[derive(Debug, Clone, Args)]
pub struct StoreOpts {
    /// Which kind of store to write to.
    #[clap(long = "store", value_enum, default_value = "sheets")]
    pub kind: StoreKind,

    /// The spreadsheet ID, from its URL.
    #[clap(long)]
    pub spreadsheet_id: Option<String>,

    /// The worksheet (tab) name.
    #[clap(long, default_value = "Sheet1")]
    pub worksheet: String,

    /// The CSV file to use with `--store csv`.
    #[clap(long)]
    pub csv_path: Option<PathBuf>,
}

impl StoreOpts {
    /// Open the store described by these options.
    fn open(&self, config: &PipelineConfig) -> Result<Arc<dyn CellStore>> {
        match self.kind {
            StoreKind::Sheets => {
                let spreadsheet_id = self
                    .spreadsheet_id
                    .clone()
                    .ok_or_else(|| anyhow!("--spreadsheet-id is required for Sheets"))?;
                let store = SheetsStore::from_env(SheetsOpts {
                    spreadsheet_id,
                    worksheet: self.worksheet.clone(),
                    rate_limit: config.store.write_rate_limit.clone(),
                    transient_retries: config.store.transient_retries,
                })?;
                Ok(Arc::new(store))
            }
            StoreKind::Csv => {
                let path = self
                    .csv_path
                    .clone()
                    .ok_or_else(|| anyhow!("--csv-path is required for CSV stores"))?;
                Ok(Arc::new(CsvStore::new(path)))
            }
        }
    }
}

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Input JSONL or CSV file, with `id` and `path` fields. Defaults to
    /// standard input.
    pub input_path: Option<PathBuf>,

    /// Output location for JSONL reports. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Pipeline configuration (TOML).
    #[clap(long = "config")]
    pub config_path: Option<PathBuf>,

    #[command(flatten)]
    pub store_opts: StoreOpts,

    #[command(flatten)]
    pub page_iter_opts: PageIterOptions,

    #[command(flatten)]
    pub stream_opts: StreamOpts,

    /// Save reconstructed page images here, for documents OCRed as straight
    /// pages.
    #[clap(long)]
    pub preview_dir: Option<PathBuf>,

    /// Also save each document's text here, as `<id>.txt`.
    #[clap(long)]
    pub text_dir: Option<PathBuf>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let config = PipelineConfig::load(opts.config_path.as_deref()).await?;
    debug!(?config, "Loaded pipeline configuration");

    for dir in [&opts.preview_dir, &opts.text_dir].into_iter().flatten() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    let store = opts.store_opts.open(&config)?;
    let writer = ChunkedCellWriter::new(store, config.store.layout);
    let models = Arc::new(OnnxModels::new(
        config.models.clone(),
        config.detection.clone(),
        config.recognition.clone(),
    ));
    let pipeline = Arc::new(DocumentPipeline::new(
        ui.clone(),
        models,
        writer,
        config,
        opts.page_iter_opts.clone(),
        OutputDirs {
            preview_dir: opts.preview_dir.clone(),
            text_dir: opts.text_dir.clone(),
        },
    ));

    // Open up our input stream and parse into records.
    let input = OcrInput::read_stream(ui.clone(), opts.input_path.as_deref()).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);

    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        input.size_hint(),
    );

    // `then` polls one document at a time, in input order.
    let reports = input
        .then(move |input| {
            let pipeline = pipeline.clone();
            async move {
                let input = input?;
                Ok::<_, anyhow::Error>(pipeline.process_document(&input).await)
            }
        })
        .boxed();
    let reports = pb.wrap_stream(reports).boxed();

    let counters = OcrReport::write_stream(opts.output_path.as_deref(), reports).await?;
    counters.finish(&ui, opts.stream_opts.allowed_failure_rate)
}
