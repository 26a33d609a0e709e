//! Input and report records, plus batch counters.

use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use schemars::JsonSchema;

use super::{error::ErrorKind, strategy::Strategy};
use crate::{
    async_utils::{
        BoxedStream,
        io::{read_jsonl_or_csv, write_output},
    },
    prelude::*,
    ui::Ui,
};

/// One document to OCR.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct OcrInput {
    /// The row key. Text is written to the row with a cell equal to this.
    pub id: String,

    /// Local path to a PDF or image.
    pub path: PathBuf,

    /// The password to decrypt the PDF, if any.
    #[serde(default)]
    pub password: Option<String>,
}

impl OcrInput {
    /// Read inputs from a JSONL or CSV file, or standard input.
    pub async fn read_stream(
        ui: Ui,
        path: Option<&Path>,
    ) -> Result<BoxedStream<Result<OcrInput>>> {
        let values = read_jsonl_or_csv(ui, path).await?;
        Ok(values
            .map(|value| {
                let value = value?;
                serde_json::from_value::<OcrInput>(value.clone()).with_context(|| {
                    format!("could not parse input record {}", value)
                })
            })
            .boxed())
    }

    /// The password, treating blank CSV cells as no password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

/// How a document turned out.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Text was found and every chunk was written.
    Ok,
    /// No text was found, so nothing was written.
    Empty,
    /// Something went wrong. See `error_kind`.
    Failed,
}

/// What happened to one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OcrReport {
    /// The row key from the input.
    pub id: String,

    /// The input path.
    pub path: PathBuf,

    pub status: DocumentStatus,

    /// The models used, once we've seen the first page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Pages we ran OCR on.
    pub page_count: usize,

    /// Characters of extracted text, including word separators.
    pub text_chars: usize,

    /// Cells written. On a failed write, this many cells were written before
    /// the failure.
    pub chunks_written: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// The page that failed OCR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_idx: Option<usize>,

    /// The chunk that failed to write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_idx: Option<usize>,

    /// Errors and warnings, most important first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl OcrReport {
    /// An empty report for `input`, to be filled in as we go.
    pub fn new(input: &OcrInput) -> Self {
        Self {
            id: input.id.clone(),
            path: input.path.clone(),
            status: DocumentStatus::Ok,
            strategy: None,
            page_count: 0,
            text_chars: 0,
            chunks_written: 0,
            error_kind: None,
            page_idx: None,
            segment_idx: None,
            errors: vec![],
        }
    }

    /// Write reports as JSONL, returning counts once the stream is done.
    pub async fn write_stream(
        path: Option<&Path>,
        stream: BoxedStream<Result<OcrReport>>,
    ) -> Result<ReportCounters> {
        let counters = Arc::new(Mutex::new(ReportCounters::default()));
        let counters_clone = counters.clone();
        let output = stream
            .map(move |report| {
                let report = report?;
                if let Ok(mut counters) = counters_clone.lock() {
                    counters.update(&report);
                }
                serde_json::to_value(&report).context("could not serialize report")
            })
            .boxed();
        write_output(path, output).await?;
        let counters = counters
            .lock()
            .map_err(|_| anyhow!("report counters lock poisoned"))?
            .clone();
        Ok(counters)
    }
}

/// Totals over a batch of reports.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportCounters {
    pub ok: usize,
    pub empty: usize,
    pub failed: usize,
    /// Warnings attached to documents that didn't fail.
    pub warnings: usize,
}

impl ReportCounters {
    pub fn update(&mut self, report: &OcrReport) {
        match report.status {
            DocumentStatus::Ok => self.ok += 1,
            DocumentStatus::Empty => self.empty += 1,
            DocumentStatus::Failed => self.failed += 1,
        }
        if report.status != DocumentStatus::Failed {
            self.warnings += report.errors.len();
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.empty + self.failed
    }

    /// Tell the user how it went, and fail if too many documents failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        info!(
            ok = self.ok,
            empty = self.empty,
            failed = self.failed,
            "Processed {} documents",
            self.total()
        );
        ui.display_message(
            "📊",
            &format!(
                "{} ok, {} without text, {} failed",
                self.ok, self.empty, self.failed
            ),
        );
        if self.warnings > 0 {
            ui.display_message("⚠️", &format!("{} warnings recorded", self.warnings));
        }

        let total = self.total();
        if total == 0 {
            return Ok(());
        }
        let failure_rate = self.failed as f32 / total as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                self.failed,
                total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}
