//! A local CSV file that stands in for a spreadsheet.

use std::io::Write as _;

use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use super::CellStore;
use crate::{
    async_utils::blocking_iter_streams::spawn_blocking_propagating_panics, prelude::*,
};

/// A CSV file treated as a grid of cells. Row 1 is the first line of the
/// file, and there is no header row.
pub struct CsvStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CellStore for CsvStore {
    async fn find_rows(&self, key: &str) -> Result<Vec<u32>> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let key = key.to_owned();
        spawn_blocking_propagating_panics(move || -> Result<Vec<u32>> {
            let grid = read_grid(&path)?;
            Ok(grid
                .iter()
                .enumerate()
                .filter(|(_, row)| row.iter().any(|cell| *cell == key))
                .map(|(idx, _)| idx as u32 + 1)
                .collect())
        })
        .await
    }

    #[instrument(level = "trace", skip(self, value))]
    async fn write_cell(&self, row: u32, column: u32, value: &str) -> Result<()> {
        if row == 0 || column == 0 {
            return Err(anyhow!("rows and columns start at 1"));
        }
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let value = value.to_owned();
        spawn_blocking_propagating_panics(move || -> Result<()> {
            let mut grid = read_grid(&path)?;
            let (r, c) = (row as usize - 1, column as usize - 1);
            if grid.len() <= r {
                grid.resize_with(r + 1, Vec::new);
            }
            if grid[r].len() <= c {
                grid[r].resize(c + 1, String::new());
            }
            grid[r][c] = value;
            write_grid(&path, &grid)
        })
        .await
    }
}

/// Read the whole file as ragged rows of strings. Blank lines are rows with
/// no cells.
fn read_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut data = std::fs::read(path)
        .with_context(|| format!("could not open CSV store {}", path.display()))?;
    if data.last().is_some_and(|&b| b != b'\n') {
        data.push(b'\n');
    }
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data.as_slice());

    // `csv` skips blank lines, so we count them from line numbers.
    let mut grid = vec![];
    let mut record = csv::StringRecord::new();
    let mut line = rdr.position().line();
    while rdr
        .read_record(&mut record)
        .with_context(|| format!("could not parse CSV store {}", path.display()))?
    {
        let end = rdr.position().line();
        let spanned = 1 + record
            .iter()
            .map(|field| field.matches('\n').count() as u64)
            .sum::<u64>();
        let blank = (end - line).saturating_sub(spanned);
        grid.extend((0..blank).map(|_| Vec::new()));
        grid.push(record.iter().map(str::to_owned).collect());
        line = end;
    }
    Ok(grid)
}

/// Replace the file with `grid`, so readers never see a half-written file.
fn write_grid(path: &Path, grid: &[Vec<String>]) -> Result<()> {
    let mut out = Vec::new();
    for row in grid {
        if row.is_empty() {
            // `csv` won't write an empty record, and `""` isn't a blank line.
            out.push(b'\n');
            continue;
        }
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(&mut out);
        wtr.write_record(row)?;
        wtr.flush()?;
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("could not create temp file in {}", dir.display()))?;
    tmp.write_all(&out)
        .with_context(|| format!("could not write {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("could not replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn store_with(contents: &str) -> (tempfile::TempDir, CsvStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.csv");
        fs::write(&path, contents).unwrap();
        (dir, CsvStore::new(&path), path)
    }

    #[tokio::test]
    async fn finds_rows_by_exact_match() {
        let (_dir, store, _) =
            store_with("id,link\n1,https://x/a\n2,https://x/b\n3,https://x/a\n");
        assert_eq!(store.find_rows("https://x/a").await.unwrap(), vec![2, 4]);
        assert!(store.find_rows("https://x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_grows_row_to_target_column() {
        let (_dir, store, path) = store_with("k1,a\nk2,b\n");
        store.write_cell(2, 38, "hello, world").await.unwrap();
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .unwrap();
        let rows = rdr
            .records()
            .map(|r| r.unwrap().iter().map(str::to_owned).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(rows[0], vec!["k1", "a"]);
        assert_eq!(rows[1].len(), 38);
        assert_eq!(rows[1][0], "k2");
        assert_eq!(rows[1][37], "hello, world");
    }

    #[tokio::test]
    async fn blank_lines_are_rows_and_survive_writes() {
        let (_dir, store, path) = store_with("k1,a\n\nk2,\"two\nlines\"\n\n\nk3,c");
        assert_eq!(store.find_rows("k1").await.unwrap(), vec![1]);
        assert_eq!(store.find_rows("k2").await.unwrap(), vec![3]);
        assert_eq!(store.find_rows("k3").await.unwrap(), vec![6]);

        store.write_cell(6, 3, "x").await.unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "k1,a\n\nk2,\"two\nlines\"\n\n\nk3,c,x\n"
        );
        assert_eq!(store.find_rows("k3").await.unwrap(), vec![6]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("nope.csv"));
        assert!(store.find_rows("x").await.is_err());
    }

    #[tokio::test]
    async fn rejects_zero_based_addresses() {
        let (_dir, store, _) = store_with("k\n");
        assert!(store.write_cell(0, 1, "x").await.is_err());
    }
}
