//! Flattening recognized pages into one stream of text per document.

use super::document::RecognizedPage;

/// Accumulates the text of a document, one page at a time.
///
/// Every word is followed by a single space, including the last one. There
/// are no line or page separators.
#[derive(Debug, Default)]
pub struct TextAggregator {
    text: String,
    word_count: usize,
}

impl TextAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every word on `page`, in reading order. Pages must be pushed in
    /// document order.
    pub fn push_page(&mut self, page: &RecognizedPage) {
        for word in page.words() {
            self.text.push_str(&word.value);
            self.text.push(' ');
            self.word_count += 1;
        }
    }

    /// How many words have we seen?
    pub fn word_count(&self) -> usize {
        self.word_count
    }

    /// The finished text stream.
    pub fn finish(self) -> String {
        self.text
    }
}
