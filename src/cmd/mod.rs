//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{async_utils::BoxedStream, prelude::*};

pub mod ocr;
pub mod schema;

/// Common options for subcommands that process a list of documents.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    take_first: Option<usize>,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt as _;

    use super::*;

    #[tokio::test]
    async fn take_first_limits_input() -> Result<()> {
        let opts = StreamOpts {
            take_first: Some(2),
            allowed_failure_rate: 0.0,
        };
        let input = futures::stream::iter((0..5).map(Ok)).boxed();
        let taken = opts
            .apply_stream_input_opts(input)
            .try_collect::<Vec<i32>>()
            .await?;
        assert_eq!(taken, vec![0, 1]);
        Ok(())
    }
}
