//! The hierarchical result of OCRing a file: pages, blocks, lines and words.
//!
//! Engines produce a [`Document`], and callers mostly just want
//! [`Document::flat_text`]. Geometry is kept only so that engines which detect
//! individual words can group them into lines and blocks.

use std::cmp::Ordering;

/// An axis-aligned box in relative page coordinates (0.0 to 1.0).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    /// Create a new box, clamping all coordinates to the page.
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin: xmin.clamp(0.0, 1.0),
            ymin: ymin.clamp(0.0, 1.0),
            xmax: xmax.clamp(0.0, 1.0),
            ymax: ymax.clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn y_center(&self) -> f32 {
        (self.ymin + self.ymax) / 2.0
    }

    /// The smallest box containing both `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }
}

/// A single recognized word.
#[derive(Clone, Debug, PartialEq)]
pub struct Word {
    /// The recognized text.
    pub value: String,

    /// Where the word was found. Used for layout only.
    pub bbox: BoundingBox,
}

impl Word {
    pub fn new(value: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            value: value.into(),
            bbox,
        }
    }
}

/// A line of words, in reading order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Line {
    pub words: Vec<Word>,
}

impl Line {
    /// The words of this line, separated by single spaces.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|word| word.value.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The box containing every word in the line, if there are any words.
    fn bbox(&self) -> Option<BoundingBox> {
        let mut words = self.words.iter();
        let first = words.next()?.bbox;
        Some(words.fold(first, |acc, word| acc.union(&word.bbox)))
    }
}

/// A group of related lines.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub lines: Vec<Line>,
}

/// One page of a document. Most images have exactly one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub blocks: Vec<Block>,
}

/// How should [`Page::from_words`] group words?
#[derive(Clone, Copy, Debug)]
pub struct LayoutOptions {
    /// Horizontal gap (relative to page width) above which a line is split.
    pub paragraph_break: f32,

    /// Split lines into several blocks based on vertical gaps. When this is
    /// off, each page has a single block.
    pub resolve_blocks: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            paragraph_break: 0.035,
            resolve_blocks: false,
        }
    }
}

impl Page {
    /// Build a page from unordered word detections.
    pub fn from_words(mut words: Vec<Word>, options: &LayoutOptions) -> Self {
        if words.is_empty() {
            return Self::default();
        }

        // Group words into rows by vertical position.
        words.sort_by(|a, b| cmp_f32(a.bbox.y_center(), b.bbox.y_center()));
        let mut rows: Vec<Vec<Word>> = vec![];
        for word in words {
            match rows.last_mut() {
                Some(row) if belongs_to_row(row, &word) => row.push(word),
                _ => rows.push(vec![word]),
            }
        }

        // Split rows into lines wherever there's a wide horizontal gap.
        let mut lines = vec![];
        for mut row in rows {
            row.sort_by(|a, b| cmp_f32(a.bbox.xmin, b.bbox.xmin));
            let mut line = Line::default();
            for word in row {
                if let Some(prev) = line.words.last()
                    && word.bbox.xmin - prev.bbox.xmax > options.paragraph_break
                {
                    lines.push(std::mem::take(&mut line));
                }
                line.words.push(word);
            }
            lines.push(line);
        }
        lines.sort_by(|a, b| {
            let (a, b) = (a.bbox(), b.bbox());
            let (a, b) = (a.as_ref(), b.as_ref());
            match (a, b) {
                (Some(a), Some(b)) => cmp_f32(a.ymin, b.ymin)
                    .then_with(|| cmp_f32(a.xmin, b.xmin)),
                _ => Ordering::Equal,
            }
        });

        let blocks = if options.resolve_blocks {
            split_into_blocks(lines)
        } else {
            vec![Block { lines }]
        };
        Self { blocks }
    }
}

/// Does `word` sit on the same row as the words already in `row`?
fn belongs_to_row(row: &[Word], word: &Word) -> bool {
    let n = row.len() as f32;
    let mean_center = row.iter().map(|w| w.bbox.y_center()).sum::<f32>() / n;
    let mean_height = row.iter().map(|w| w.bbox.height()).sum::<f32>() / n;
    (word.bbox.y_center() - mean_center).abs() < mean_height / 2.0
}

/// Start a new block whenever the gap above a line is taller than the average
/// line.
fn split_into_blocks(lines: Vec<Line>) -> Vec<Block> {
    let boxes = lines.iter().filter_map(Line::bbox).collect::<Vec<_>>();
    if boxes.is_empty() {
        return vec![];
    }
    let mean_height =
        boxes.iter().map(BoundingBox::height).sum::<f32>() / boxes.len() as f32;

    let mut blocks = vec![];
    let mut current = Block::default();
    let mut prev_bottom: Option<f32> = None;
    for line in lines {
        let Some(bbox) = line.bbox() else { continue };
        if let Some(bottom) = prev_bottom
            && bbox.ymin - bottom > mean_height
        {
            blocks.push(std::mem::take(&mut current));
        }
        prev_bottom = Some(prev_bottom.map_or(bbox.ymax, |b| b.max(bbox.ymax)));
        current.lines.push(line);
    }
    blocks.push(current);
    blocks
}

fn cmp_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Summary counts, for logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextStats {
    pub chars: usize,
    pub lines: usize,
    pub words: usize,
}

/// A complete OCR result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub pages: Vec<Page>,
}

impl Document {
    /// Iterate over every line, in page, block and line order.
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.pages
            .iter()
            .flat_map(|page| page.blocks.iter())
            .flat_map(|block| block.lines.iter())
    }

    /// The trimmed text of every line which contains something other than
    /// whitespace.
    pub fn non_empty_lines(&self) -> Vec<String> {
        self.lines()
            .map(|line| line.text().trim().to_owned())
            .filter(|text| !text.is_empty())
            .collect()
    }

    /// All the text in the document, as a single space-separated string.
    pub fn flat_text(&self) -> String {
        self.non_empty_lines().join(" ")
    }

    /// Count characters, non-empty lines and words.
    pub fn stats(&self) -> TextStats {
        TextStats {
            chars: self.flat_text().chars().count(),
            lines: self.non_empty_lines().len(),
            words: self.lines().map(|line| line.words.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: &str, xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Word {
        Word::new(value, BoundingBox::new(xmin, ymin, xmax, ymax))
    }

    fn line(values: &[&str]) -> Line {
        Line {
            words: values
                .iter()
                .map(|v| word(v, 0.0, 0.0, 0.1, 0.1))
                .collect(),
        }
    }

    #[test]
    fn flat_text_joins_lines_and_skips_blank_ones() {
        let doc = Document {
            pages: vec![
                Page {
                    blocks: vec![
                        Block {
                            lines: vec![line(&["Hello", "world"]), line(&[" "])],
                        },
                        Block {
                            lines: vec![line(&[]), line(&["  second", "block  "])],
                        },
                    ],
                },
                Page {
                    blocks: vec![Block {
                        lines: vec![line(&["page", "two"])],
                    }],
                },
            ],
        };
        assert_eq!(doc.flat_text(), "Hello world second block page two");
        assert_eq!(
            doc.stats(),
            TextStats {
                chars: 33,
                lines: 3,
                words: 7,
            }
        );
    }

    #[test]
    fn empty_document_has_no_text() {
        let doc = Document::default();
        assert_eq!(doc.flat_text(), "");
        assert_eq!(doc.stats(), TextStats::default());

        let doc = Document {
            pages: vec![Page::default()],
        };
        assert_eq!(doc.flat_text(), "");
    }

    #[test]
    fn stats_count_unicode_characters() {
        let doc = Document {
            pages: vec![Page {
                blocks: vec![Block {
                    lines: vec![line(&["café", "naïve"])],
                }],
            }],
        };
        assert_eq!(doc.stats().chars, 10);
    }

    #[test]
    fn words_are_grouped_into_lines_in_reading_order() {
        let words = vec![
            word("second", 0.10, 0.30, 0.25, 0.35),
            word("world", 0.22, 0.101, 0.35, 0.151),
            word("Hello", 0.05, 0.10, 0.20, 0.15),
            word("line", 0.27, 0.30, 0.35, 0.35),
        ];
        let page = Page::from_words(words, &LayoutOptions::default());
        assert_eq!(page.blocks.len(), 1);
        let texts = page.blocks[0]
            .lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["Hello world", "second line"]);
    }

    #[test]
    fn wide_gaps_split_lines() {
        let words = vec![
            word("left", 0.05, 0.10, 0.15, 0.15),
            word("right", 0.70, 0.10, 0.85, 0.15),
        ];
        let page = Page::from_words(words, &LayoutOptions::default());
        let texts = page.blocks[0]
            .lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["left", "right"]);
    }

    #[test]
    fn blocks_are_split_on_vertical_gaps_when_requested() {
        let words = vec![
            word("title", 0.1, 0.10, 0.3, 0.15),
            word("subtitle", 0.1, 0.16, 0.3, 0.21),
            word("footer", 0.1, 0.80, 0.3, 0.85),
        ];
        let options = LayoutOptions {
            resolve_blocks: true,
            ..LayoutOptions::default()
        };
        let page = Page::from_words(words.clone(), &options);
        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[0].lines.len(), 2);
        assert_eq!(page.blocks[1].lines[0].text(), "footer");

        let page = Page::from_words(words, &LayoutOptions::default());
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].lines.len(), 3);
    }

    #[test]
    fn no_words_means_no_blocks() {
        let page = Page::from_words(vec![], &LayoutOptions::default());
        assert!(page.blocks.is_empty());
    }
}
