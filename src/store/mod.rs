//! Writing long text into a spreadsheet-like store, one bounded cell at a
//! time.

use std::sync::Arc;

use crate::{ocr::error::DocumentError, prelude::*};

pub mod csv_store;
pub mod sheets;

/// Largest number of characters we put in one cell. Google Sheets caps cells
/// at 50,000 characters, and we stay well under that.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 20_000;

/// The first column we write to, "AL". Columns "A" through "AK" belong to
/// whoever maintains the sheet.
pub const DEFAULT_BASE_COLUMN: u32 = 38;

/// A tabular store addressed by 1-based row and column numbers.
#[async_trait]
pub trait CellStore: Send + Sync + 'static {
    /// Find every row containing a cell exactly equal to `key`, in the
    /// store's own enumeration order.
    async fn find_rows(&self, key: &str) -> Result<Vec<u32>>;

    /// Overwrite a single cell.
    async fn write_cell(&self, row: u32, column: u32, value: &str) -> Result<()>;
}

/// Where chunks go and how big they may be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    pub max_chunk_chars: usize,
    pub base_column: u32,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            base_column: DEFAULT_BASE_COLUMN,
        }
    }
}

/// Split `text` into chunks of at most `max_chars` characters (Unicode scalar
/// values, never bytes). Every chunk but the last is exactly `max_chars`
/// long.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<&str> {
    assert!(max_chars > 0, "chunk size must be positive");
    let mut chunks = vec![];
    let mut rest = text;
    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// Convert a 1-based column number to spreadsheet letters (1 is "A", 38 is
/// "AL").
pub fn column_letters(mut column: u32) -> String {
    let mut letters = vec![];
    while column > 0 {
        let rem = ((column - 1) % 26) as u8;
        letters.push(char::from(b'A' + rem));
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Convert spreadsheet letters to a 1-based column number.
pub fn column_number(letters: &str) -> Result<u32> {
    if letters.is_empty() {
        return Err(anyhow!("empty column name"));
    }
    letters.chars().try_fold(0u32, |acc, c| {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return Err(anyhow!("invalid column name: {:?}", letters));
        }
        acc.checked_mul(26)
            .and_then(|acc| acc.checked_add(u32::from(c as u8 - b'A') + 1))
            .ok_or_else(|| anyhow!("column name too long: {:?}", letters))
    })
}

/// What happened when we tried to store a document's text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every chunk was written to `row`.
    Written { row: u32, chunks: usize },
    /// There was no text, so we didn't touch the store.
    Empty,
}

/// Splits text into chunks and writes them to consecutive cells of one row.
///
/// Writes are not transactional. If chunk `i` fails, chunks `0..i` stay
/// written and nothing after `i` is attempted.
#[derive(Clone)]
pub struct ChunkedCellWriter {
    store: Arc<dyn CellStore>,
    layout: ChunkLayout,
}

impl ChunkedCellWriter {
    pub fn new(store: Arc<dyn CellStore>, layout: ChunkLayout) -> Self {
        Self { store, layout }
    }

    /// Store `text` in the row identified by `row_key`.
    #[instrument(level = "debug", skip_all, fields(row_key = %row_key))]
    pub async fn write(
        &self,
        row_key: &str,
        text: &str,
    ) -> Result<WriteOutcome, DocumentError> {
        if text.is_empty() {
            debug!("No text to write");
            return Ok(WriteOutcome::Empty);
        }

        let rows = self
            .store
            .find_rows(row_key)
            .await
            .map_err(|error| DocumentError::StoreLookup {
                row_key: row_key.to_owned(),
                error,
            })?;
        let Some(&row) = rows.first() else {
            return Err(DocumentError::RowNotFound {
                row_key: row_key.to_owned(),
            });
        };
        if rows.len() > 1 {
            warn!(
                row_key,
                matches = rows.len(),
                row,
                "Several rows match, using the first"
            );
        }

        let chunks = split_chunks(text, self.layout.max_chunk_chars);
        for (segment_idx, chunk) in chunks.iter().enumerate() {
            let column = self.layout.base_column + segment_idx as u32;
            self.write_chunk(row, column, segment_idx, chunk)
                .await
                .map_err(|error| DocumentError::StoreWrite {
                    segment_idx,
                    written: segment_idx,
                    error,
                })?;
        }
        Ok(WriteOutcome::Written {
            row,
            chunks: chunks.len(),
        })
    }

    #[instrument(level = "debug", skip(self, chunk), fields(chars = chunk.chars().count()))]
    async fn write_chunk(
        &self,
        row: u32,
        column: u32,
        segment_idx: usize,
        chunk: &str,
    ) -> Result<()> {
        self.store
            .write_cell(row, column, chunk)
            .await
            .with_context(|| {
                format!(
                    "could not write chunk {} to {}{}",
                    segment_idx,
                    column_letters(column),
                    row
                )
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use super::*;

    /// An in-memory store with a key in column A, which can be told to fail
    /// specific writes.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub keys: Vec<String>,
        pub cells: Mutex<BTreeMap<(u32, u32), String>>,
        pub write_log: Mutex<Vec<(u32, u32)>>,
        pub fail_on_write: Option<usize>,
        pub fail_lookup: bool,
    }

    impl MemoryStore {
        pub(crate) fn with_keys(keys: &[&str]) -> Self {
            Self {
                keys: keys.iter().map(|k| (*k).to_owned()).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn cells(&self) -> BTreeMap<(u32, u32), String> {
            self.cells.lock().unwrap().clone()
        }

        pub(crate) fn write_count(&self) -> usize {
            self.write_log.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CellStore for MemoryStore {
        async fn find_rows(&self, key: &str) -> Result<Vec<u32>> {
            if self.fail_lookup {
                return Err(anyhow!("simulated lookup failure"));
            }
            Ok(self
                .keys
                .iter()
                .enumerate()
                .filter(|(_, k)| *k == key)
                .map(|(i, _)| i as u32 + 1)
                .collect())
        }

        async fn write_cell(&self, row: u32, column: u32, value: &str) -> Result<()> {
            let attempt = {
                let mut log = self.write_log.lock().unwrap();
                log.push((row, column));
                log.len() - 1
            };
            if self.fail_on_write == Some(attempt) {
                return Err(anyhow!("simulated write failure"));
            }
            self.cells
                .lock()
                .unwrap()
                .insert((row, column), value.to_owned());
            Ok(())
        }
    }

    fn small_layout() -> ChunkLayout {
        ChunkLayout {
            max_chunk_chars: 4,
            base_column: DEFAULT_BASE_COLUMN,
        }
    }

    #[test]
    fn chunks_round_trip() {
        let samples = ["", "a", "abcd", "abcde", "héllo wörld ", "日本語のテキスト"];
        for text in samples {
            for max in [1, 2, 3, 4, 7, 100] {
                let chunks = split_chunks(text, max);
                assert_eq!(chunks.concat(), text);
                if let Some((last, init)) = chunks.split_last() {
                    assert!(init.iter().all(|c| c.chars().count() == max));
                    assert!((1..=max).contains(&last.chars().count()));
                }
            }
        }
    }

    #[test]
    fn chunk_boundaries_match_character_offsets() {
        let text = "x".repeat(45_000);
        let chunks = split_chunks(&text, DEFAULT_MAX_CHUNK_CHARS);
        let lens = chunks.iter().map(|c| c.len()).collect::<Vec<_>>();
        assert_eq!(lens, vec![20_000, 20_000, 5_000]);
    }

    #[test]
    fn column_letters_match_spreadsheet_names() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(26), "Z");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(38), "AL");
        assert_eq!(column_letters(39), "AM");
        assert_eq!(column_letters(702), "ZZ");
        assert_eq!(column_letters(703), "AAA");
        for n in 1..2000 {
            assert_eq!(column_number(&column_letters(n)).unwrap(), n);
        }
        assert!(column_number("").is_err());
        assert!(column_number("A1").is_err());
    }

    #[tokio::test]
    async fn writes_chunks_to_consecutive_columns() {
        let store = Arc::new(MemoryStore::with_keys(&["other", "doc-1"]));
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        let outcome = writer.write("doc-1", "abcdefghij").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written { row: 2, chunks: 3 });
        let cells = store.cells();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[&(2, 38)], "abcd");
        assert_eq!(cells[&(2, 39)], "efgh");
        assert_eq!(cells[&(2, 40)], "ij");
    }

    #[tokio::test]
    async fn partial_failure_reports_failing_segment() {
        let store = Arc::new(MemoryStore {
            fail_on_write: Some(1),
            ..MemoryStore::with_keys(&["doc"])
        });
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        let err = writer.write("doc", "aaaabbbbcc").await.unwrap_err();
        match err {
            DocumentError::StoreWrite {
                segment_idx,
                written,
                ..
            } => {
                assert_eq!(segment_idx, 1);
                assert_eq!(written, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The third chunk was never attempted.
        assert_eq!(store.write_count(), 2);
        let cells = store.cells();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[&(1, 38)], "aaaa");
    }

    #[tokio::test]
    async fn missing_row_writes_nothing() {
        let store = Arc::new(MemoryStore::with_keys(&["a", "b"]));
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        let err = writer.write("zzz", "text").await.unwrap_err();
        assert!(matches!(err, DocumentError::RowNotFound { ref row_key } if row_key == "zzz"));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn lookup_failures_are_not_write_failures() {
        let store = Arc::new(MemoryStore {
            fail_lookup: true,
            ..MemoryStore::with_keys(&["doc"])
        });
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        let err = writer.write("doc", "text").await.unwrap_err();
        assert!(matches!(err, DocumentError::StoreLookup { ref row_key, .. } if row_key == "doc"));
        assert_eq!(err.segment_idx(), None);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn first_matching_row_wins() {
        let store = Arc::new(MemoryStore::with_keys(&["x", "dup", "dup"]));
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        writer.write("dup", "hi ").await.unwrap();
        let cells = store.cells();
        assert_eq!(cells.keys().collect::<Vec<_>>(), vec![&(2, 38)]);
    }

    #[tokio::test]
    async fn empty_text_touches_nothing() {
        let store = Arc::new(MemoryStore::default());
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        // No rows exist, but we never look.
        assert_eq!(writer.write("missing", "").await.unwrap(), WriteOutcome::Empty);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn rerun_overwrites_same_cells() {
        let store = Arc::new(MemoryStore::with_keys(&["doc"]));
        let writer = ChunkedCellWriter::new(store.clone(), small_layout());
        writer.write("doc", "0123456789").await.unwrap();
        let first = store.cells();
        writer.write("doc", "0123456789").await.unwrap();
        assert_eq!(store.cells(), first);
        assert_eq!(store.write_count(), 6);
    }
}
