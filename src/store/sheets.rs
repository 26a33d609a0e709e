//! Google Sheets, via the v4 REST API.

use std::env;

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use reqwest::{Client, Url};

use super::{CellStore, column_letters};
use crate::{
    prelude::*,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

/// Where to find the API unless `SHEETS_API_BASE` says otherwise.
const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";

/// Options for connecting to a worksheet.
#[derive(Clone, Debug)]
pub struct SheetsOpts {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub rate_limit: RateLimit,
    /// How many times to retry a request that failed in a way that might
    /// clear up.
    pub transient_retries: u8,
}

/// A worksheet in a Google spreadsheet.
pub struct SheetsStore {
    client: Client,
    api_base: Url,
    access_token: String,
    opts: SheetsOpts,
    rate_limiter: RateLimiter,
}

impl SheetsStore {
    /// Connect using `GOOGLE_SHEETS_ACCESS_TOKEN` and, optionally,
    /// `SHEETS_API_BASE`.
    pub fn from_env(opts: SheetsOpts) -> Result<Self> {
        let access_token = env::var("GOOGLE_SHEETS_ACCESS_TOKEN")
            .context("GOOGLE_SHEETS_ACCESS_TOKEN environment variable is not set")?;
        let api_base =
            env::var("SHEETS_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());
        Self::new(&api_base, access_token, opts)
    }

    pub fn new(api_base: &str, access_token: String, opts: SheetsOpts) -> Result<Self> {
        let api_base = Url::parse(api_base)
            .with_context(|| format!("invalid Sheets API base URL: {:?}", api_base))?;
        let rate_limiter = opts.rate_limit.to_rate_limiter();
        Ok(Self {
            client: Client::new(),
            api_base,
            access_token,
            opts,
            rate_limiter,
        })
    }

    /// The URL for reading or writing `range`.
    fn values_url(&self, range: &str) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Sheets API base URL cannot have a path"))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                &self.opts.spreadsheet_id,
                "values",
                range,
            ]);
        Ok(url)
    }

    /// Run `attempt`, retrying transient failures with exponential backoff.
    ///
    /// Each retry repeats the same request, so callers that issue requests in
    /// order keep that order.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RetryResult<(), (), T, anyhow::Error>>,
    {
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: self.opts.transient_retries.into(),
            jitter_ratio: 0.2,
        };
        let result = attempt()
            .await
            .retry_with_async(|_| attempt())
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "{what} succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "{what} FAILED after exhausting all {} retrying attempts with error {fatal_error:?}",
                    retry_errors_list.len(),
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp {
                retry_errors,
                fatal_error,
                ..
            }
            | ResolvedResult::Unrecoverable {
                retry_errors,
                fatal_error,
                ..
            } => Err(fatal_error.context(format!(
                "{} failed after {} retries",
                what,
                retry_errors.len()
            ))),
        }
    }

    async fn get_values_once(
        &self,
        url: &Url,
    ) -> RetryResult<(), (), Vec<Vec<Value>>, anyhow::Error> {
        self.rate_limiter.acquire_one().await;
        let response = try_potentially_transient!(
            self.client
                .get(url.clone())
                .bearer_auth(&self.access_token)
                .query(&[("majorDimension", "ROWS")])
                .send()
                .await
        );
        let response = try_potentially_transient!(response.error_for_status());
        let body = try_fatal!(
            response
                .json::<ValueRange>()
                .await
                .context("could not parse Sheets values response")
        );
        retry_result_ok(body.values)
    }

    async fn update_once(
        &self,
        url: &Url,
        body: &ValueRange,
    ) -> RetryResult<(), (), (), anyhow::Error> {
        self.rate_limiter.acquire_one().await;
        let response = try_potentially_transient!(
            self.client
                .put(url.clone())
                .bearer_auth(&self.access_token)
                .query(&[("valueInputOption", "RAW")])
                .json(body)
                .send()
                .await
        );
        try_potentially_transient!(response.error_for_status());
        retry_result_ok(())
    }
}

#[async_trait]
impl CellStore for SheetsStore {
    #[instrument(level = "debug", skip(self))]
    async fn find_rows(&self, key: &str) -> Result<Vec<u32>> {
        let url = self.values_url(&quote_worksheet(&self.opts.worksheet))?;
        let rows = self
            .with_retries("values.get", || self.get_values_once(&url))
            .await?;
        Ok(matching_rows(&rows, key))
    }

    #[instrument(level = "debug", skip(self, value))]
    async fn write_cell(&self, row: u32, column: u32, value: &str) -> Result<()> {
        let range = a1_cell(&self.opts.worksheet, row, column);
        let url = self.values_url(&range)?;
        let body = ValueRange {
            range: Some(range),
            major_dimension: Some("ROWS".to_owned()),
            values: vec![vec![Value::String(value.to_owned())]],
        };
        self.with_retries("values.update", || self.update_once(&url, &body))
            .await
    }
}

/// The body of a `values.get` response or `values.update` request.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    major_dimension: Option<String>,
    /// Missing entirely when the range is empty.
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Quote a worksheet name for use in A1 notation.
fn quote_worksheet(worksheet: &str) -> String {
    format!("'{}'", worksheet.replace('\'', "''"))
}

/// A1 address of one cell, like `'Sheet 1'!AL7`.
fn a1_cell(worksheet: &str, row: u32, column: u32) -> String {
    format!("{}!{}{}", quote_worksheet(worksheet), column_letters(column), row)
}

/// 1-based numbers of rows with a cell exactly equal to `key`.
fn matching_rows(rows: &[Vec<Value>], key: &str) -> Vec<u32> {
    rows.iter()
        .enumerate()
        .filter(|(_, cells)| cells.iter().any(|cell| cell.as_str() == Some(key)))
        .map(|(idx, _)| idx as u32 + 1)
        .collect()
}
