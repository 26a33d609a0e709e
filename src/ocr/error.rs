//! Per-document failures.

use std::{error, fmt};

use schemars::JsonSchema;

use crate::prelude::*;

/// Why a document could not be processed.
///
/// Any of these ends work on the current document, but never on the rest of
/// the batch.
#[derive(Debug)]
pub enum DocumentError {
    /// The file was missing, unreadable, encrypted, or not a document we can
    /// rasterize.
    DocumentOpen { error: anyhow::Error },

    /// Detection or recognition failed on a page.
    ModelInference {
        page_idx: usize,
        error: anyhow::Error,
    },

    /// We couldn't search the store for the row, so nothing was written.
    StoreLookup {
        row_key: String,
        error: anyhow::Error,
    },

    /// No row in the store has this key.
    RowNotFound { row_key: String },

    /// Writing a chunk failed. Chunks before `segment_idx` are already in the
    /// store, and nothing after it was attempted.
    StoreWrite {
        segment_idx: usize,
        written: usize,
        error: anyhow::Error,
    },
}

impl DocumentError {
    /// A short, serializable summary of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::DocumentOpen { .. } => ErrorKind::DocumentOpen,
            DocumentError::ModelInference { .. } => ErrorKind::ModelInference,
            DocumentError::StoreLookup { .. } => ErrorKind::StoreLookup,
            DocumentError::RowNotFound { .. } => ErrorKind::RowNotFound,
            DocumentError::StoreWrite { .. } => ErrorKind::StoreWrite,
        }
    }

    /// The page we were on, if it matters.
    pub fn page_idx(&self) -> Option<usize> {
        match self {
            DocumentError::ModelInference { page_idx, .. } => Some(*page_idx),
            _ => None,
        }
    }

    /// The chunk we were writing, if it matters.
    pub fn segment_idx(&self) -> Option<usize> {
        match self {
            DocumentError::StoreWrite { segment_idx, .. } => Some(*segment_idx),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::DocumentOpen { .. } => write!(f, "could not open document"),
            DocumentError::ModelInference { page_idx, .. } => {
                write!(f, "OCR failed on page {}", page_idx)
            }
            DocumentError::StoreLookup { row_key, .. } => {
                write!(f, "could not look up row {:?}", row_key)
            }
            DocumentError::RowNotFound { row_key } => {
                write!(f, "no row found with key {:?}", row_key)
            }
            DocumentError::StoreWrite {
                segment_idx,
                written,
                ..
            } => write!(
                f,
                "could not write chunk {} ({} earlier chunks were written)",
                segment_idx, written
            ),
        }
    }
}

impl error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            DocumentError::DocumentOpen { error }
            | DocumentError::ModelInference { error, .. }
            | DocumentError::StoreLookup { error, .. }
            | DocumentError::StoreWrite { error, .. } => Some(error.as_ref()),
            DocumentError::RowNotFound { .. } => None,
        }
    }
}

/// The kind of a [`DocumentError`], as it appears in reports.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DocumentOpen,
    ModelInference,
    StoreLookup,
    RowNotFound,
    StoreWrite,
}
