//! Grouping loose words into lines and blocks.

use super::document::{Block, Geometry, Line, RecognizedPage, Word};

/// How to group words on a page.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutParams {
    /// Split lines into separate blocks where the vertical gap between them
    /// is larger than a typical word height. Otherwise every page has one
    /// block.
    pub resolve_blocks: bool,
    /// Horizontal gap, relative to page width, that splits one row of words
    /// into separate lines.
    pub paragraph_break: f32,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            resolve_blocks: false,
            paragraph_break: 0.035,
        }
    }
}

/// Build a page from unordered words.
pub fn build_page(
    page_idx: usize,
    dimensions: (u32, u32),
    words: Vec<Word>,
    params: &LayoutParams,
) -> RecognizedPage {
    let lines = resolve_lines(words, params);
    let blocks = if lines.is_empty() {
        vec![]
    } else if params.resolve_blocks {
        resolve_blocks(lines)
    } else {
        vec![block_from_lines(lines)]
    };
    RecognizedPage {
        page_idx,
        dimensions,
        blocks,
    }
}

fn median_height(words: &[Word]) -> f32 {
    let mut heights = words
        .iter()
        .map(|w| w.geometry.height())
        .collect::<Vec<_>>();
    heights.sort_by(f32::total_cmp);
    heights.get(heights.len() / 2).copied().unwrap_or(0.0)
}

/// Group words into lines, top to bottom and then left to right.
fn resolve_lines(mut words: Vec<Word>, params: &LayoutParams) -> Vec<Line> {
    if words.is_empty() {
        return vec![];
    }
    let tolerance = median_height(&words) / 2.0;
    words.sort_by(|a, b| a.geometry.y_center().total_cmp(&b.geometry.y_center()));

    // Rows of words whose centres sit close to the row's running mean.
    let mut rows: Vec<Vec<Word>> = vec![];
    let mut row_mean = 0.0;
    for word in words {
        let yc = word.geometry.y_center();
        match rows.last_mut() {
            Some(row) if (yc - row_mean).abs() <= tolerance => {
                row_mean = (row_mean * row.len() as f32 + yc) / (row.len() + 1) as f32;
                row.push(word);
            }
            _ => {
                row_mean = yc;
                rows.push(vec![word]);
            }
        }
    }

    let mut lines = vec![];
    for mut row in rows {
        row.sort_by(|a, b| a.geometry.envelope().0.total_cmp(&b.geometry.envelope().0));
        let mut current: Vec<Word> = vec![];
        for word in row {
            if let Some(prev) = current.last() {
                let gap = word.geometry.envelope().0 - prev.geometry.envelope().2;
                if gap > params.paragraph_break {
                    lines.push(line_from_words(std::mem::take(&mut current)));
                }
            }
            current.push(word);
        }
        if !current.is_empty() {
            lines.push(line_from_words(current));
        }
    }
    lines
}

/// Group lines into blocks wherever there's a tall vertical gap.
fn resolve_blocks(lines: Vec<Line>) -> Vec<Block> {
    let all_words = lines
        .iter()
        .flat_map(|l| l.words.iter().cloned())
        .collect::<Vec<_>>();
    let max_gap = median_height(&all_words);

    let mut blocks = vec![];
    let mut current: Vec<Line> = vec![];
    let mut current_bottom = f32::MIN;
    for line in lines {
        let (_, ymin, _, ymax) = line.geometry.envelope();
        if !current.is_empty() && ymin - current_bottom > max_gap {
            blocks.push(block_from_lines(std::mem::take(&mut current)));
            current_bottom = f32::MIN;
        }
        current_bottom = current_bottom.max(ymax);
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(block_from_lines(current));
    }
    blocks
}

fn line_from_words(words: Vec<Word>) -> Line {
    let geometry = Geometry::union(words.iter().map(|w| &w.geometry));
    Line { words, geometry }
}

fn block_from_lines(lines: Vec<Line>) -> Block {
    let geometry = Geometry::union(lines.iter().map(|l| &l.geometry));
    Block { lines, geometry }
}
