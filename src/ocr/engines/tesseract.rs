//! Tesseract OCR engine.

use std::sync::Arc;

use image::ImageFormat;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    document::{Block, BoundingBox, Line, Page, Word},
    page_iter::PageImage,
    prelude::*,
};

use super::{Device, EngineOpts, OcrEngine};

/// TSV `level` of individual words.
const WORD_LEVEL: u32 = 5;

/// TSV `level` of the whole page.
const PAGE_LEVEL: u32 = 1;

/// OCR engine wrapping the `tesseract` CLI tool.
#[non_exhaustive]
pub struct TesseractOcrEngine {
    /// Language passed to `-l`.
    lang: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(opts: &EngineOpts) -> Result<Arc<dyn OcrEngine>> {
        if opts.device == Device::Cuda {
            return Err(anyhow!(
                "the tesseract engine only runs on the CPU (use --device auto or cpu)"
            ));
        }
        Ok(Arc::new(Self {
            lang: opts.lang.clone(),
        }))
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(page = %page.index))]
    async fn ocr_page(&self, page: PageImage) -> Result<Page> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let image = page.image;
        let path = input_path.clone();
        spawn_blocking_propagating_panics(move || {
            image.save_with_format(&path, ImageFormat::Png)
        })
        .await?
        .context("cannot write tesseract input file")?;

        // Run tesseract on the input file.
        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("tsv")
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output)?;

        let tsv =
            String::from_utf8(output.stdout).context("tesseract output was not UTF-8")?;
        Ok(parse_tsv(&tsv))
    }
}

/// One parsed row of `tesseract` TSV output.
struct TsvRow<'a> {
    level: u32,
    block_num: u32,
    par_num: u32,
    line_num: u32,
    left: f32,
    top: f32,
    width: f32,
    height: f32,
    text: &'a str,
}

impl<'a> TsvRow<'a> {
    /// Parse a row, returning `None` for headers and malformed rows.
    fn parse(row: &'a str) -> Option<Self> {
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            return None;
        }
        Some(Self {
            level: cols[0].parse().ok()?,
            block_num: cols[2].parse().ok()?,
            par_num: cols[3].parse().ok()?,
            line_num: cols[4].parse().ok()?,
            left: cols[6].parse().ok()?,
            top: cols[7].parse().ok()?,
            width: cols[8].parse().ok()?,
            height: cols[9].parse().ok()?,
            text: cols[11].trim(),
        })
    }
}

/// Convert `tesseract` TSV output into a [`Page`].
///
/// Words are grouped into blocks by `block_num`, and into lines by
/// `(par_num, line_num)`, in the order `tesseract` reports them.
pub fn parse_tsv(tsv: &str) -> Page {
    let mut page_size = None;
    let mut blocks: Vec<(u32, Block)> = vec![];
    let mut current_line: Option<(u32, u32)> = None;

    for row in tsv.lines() {
        if row.trim().is_empty() {
            continue;
        }
        let Some(row) = TsvRow::parse(row) else {
            debug!(row = %row, "Skipping tesseract TSV row");
            continue;
        };
        if row.level == PAGE_LEVEL && row.width > 0.0 && row.height > 0.0 {
            page_size = Some((row.width, row.height));
        }
        if row.level != WORD_LEVEL || row.text.is_empty() {
            continue;
        }

        let bbox = match page_size {
            Some((page_width, page_height)) => BoundingBox::new(
                row.left / page_width,
                row.top / page_height,
                (row.left + row.width) / page_width,
                (row.top + row.height) / page_height,
            ),
            None => BoundingBox::new(0.0, 0.0, 0.0, 0.0),
        };
        let word = Word::new(row.text, bbox);

        let line_key = (row.par_num, row.line_num);
        match blocks.last_mut() {
            Some((block_num, block)) if *block_num == row.block_num => {
                match block.lines.last_mut() {
                    Some(line) if current_line == Some(line_key) => line.words.push(word),
                    _ => block.lines.push(Line { words: vec![word] }),
                }
            }
            _ => blocks.push((
                row.block_num,
                Block {
                    lines: vec![Line { words: vec![word] }],
                },
            )),
        }
        current_line = Some(line_key);
    }

    Page {
        blocks: blocks.into_iter().map(|(_, block)| block).collect(),
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, RgbImage};

    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        let mut out = vec![HEADER];
        out.extend_from_slice(rows);
        out.join("\n")
    }

    #[test]
    fn words_are_grouped_into_blocks_and_lines() {
        let input = tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t200\t100\t-1\t",
            "2\t1\t1\t0\t0\t0\t10\t10\t100\t20\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t40\t10\t96.5\tDaft",
            "5\t1\t1\t1\t1\t2\t60\t10\t40\t10\t95.1\tPunk",
            "5\t1\t1\t1\t2\t1\t10\t30\t40\t10\t91.0\tAround",
            "5\t1\t1\t1\t2\t2\t60\t30\t40\t10\t-1\t ",
            "5\t1\t2\t1\t1\t1\t10\t80\t40\t10\t90.0\tWorld",
        ]);
        let page = parse_tsv(&input);
        assert_eq!(page.blocks.len(), 2);
        let lines = page.blocks[0]
            .lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>();
        assert_eq!(lines, vec!["Daft Punk", "Around"]);
        assert_eq!(page.blocks[1].lines[0].text(), "World");

        let bbox = page.blocks[0].lines[0].words[0].bbox;
        assert!((bbox.xmin - 0.05).abs() < 1e-6);
        assert!((bbox.ymax - 0.2).abs() < 1e-6);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let input = tsv(&["garbage", "5\t1\tx\t1\t1\t1\t0\t0\t1\t1\t90\tnope"]);
        assert_eq!(parse_tsv(&input), Page::default());
        assert_eq!(parse_tsv(""), Page::default());
    }

    #[test]
    fn cuda_is_rejected() {
        let opts = EngineOpts {
            device: Device::Cuda,
            ..EngineOpts::default()
        };
        assert!(TesseractOcrEngine::new(&opts).is_err());
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn blank_page_has_no_text() -> Result<()> {
        let engine = TesseractOcrEngine::new(&EngineOpts::default())?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            200,
            100,
            image::Rgb([255, 255, 255]),
        ));
        let page = engine.ocr_page(PageImage { index: 0, image }).await?;
        assert!(page.blocks.is_empty());
        Ok(())
    }
}
