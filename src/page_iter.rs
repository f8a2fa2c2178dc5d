//! Iterate over "pages" in an image.
//!
//! Almost every input is a single frame grabbed from a video, so almost every
//! input has exactly one page. Multipage TIFFs are the exception.

use std::{fs, io::BufReader, vec};

use clap::Args;
use image::{DynamicImage, GrayImage, ImageReader, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult},
};

use crate::prelude::*;

/// Image types decoded directly by the `image` crate.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/bmp",
];

/// TIFF MIME type, handled separately due to multipage complexity.
const TIFF_MIME_TYPE: &str = "image/tiff";

/// A decoded page, ready for OCR.
#[derive(Debug)]
pub struct PageImage {
    /// The zero-based index of this page within the file.
    pub index: usize,
    /// The decoded image.
    pub image: DynamicImage,
}

/// Options for constructing a [`PageIter`].
#[derive(Args, Clone, Debug, Default)]
pub struct PageIterOptions {
    /// The maximum number of pages to process. If this is set, we will
    /// stop processing after this many pages and log a warning.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

/// An iterator over the decoded pages of an image file.
pub struct PageIter {
    /// Pages we have decoded but not yet returned.
    pages: vec::IntoIter<DynamicImage>,
    /// The index of the next page.
    next_index: usize,
    /// Number of pages in the file, including any we skipped.
    total_pages: usize,
    /// The maximum number of pages we are allowed to process.
    max_pages: Option<usize>,
}

impl PageIter {
    /// Create a new [`PageIter`] from a path, based on the detected MIME type.
    ///
    /// This decodes every page up front, so it should be called from a
    /// blocking context.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn from_path(path: &Path, options: &PageIterOptions) -> Result<Self> {
        let mime_type = get_mime_type(path)?;

        if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            let image = ImageReader::open(path)
                .with_context(|| format!("failed to open image {:?}", path.display()))?
                .with_guessed_format()
                .with_context(|| format!("failed to read image {:?}", path.display()))?
                .decode()
                .with_context(|| {
                    format!("failed to decode image {:?}", path.display())
                })?;
            Ok(Self::from_images(vec![image], 1, options.max_pages))
        } else if mime_type == TIFF_MIME_TYPE {
            let (images, total_pages) = decode_tiff_pages(path, options.max_pages)?;
            Ok(Self::from_images(images, total_pages, options.max_pages))
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PNG, JPEG, WebP, GIF, BMP, TIFF)",
                mime_type,
                path.display()
            ))
        }
    }

    fn from_images(
        mut images: Vec<DynamicImage>,
        total_pages: usize,
        max_pages: Option<usize>,
    ) -> Self {
        if let Some(max_pages) = max_pages {
            images.truncate(max_pages);
        }
        Self {
            pages: images.into_iter(),
            next_index: 0,
            total_pages,
            max_pages,
        }
    }

    /// Will this iterator return only an incomplete set of pages?
    pub fn is_incomplete(&self) -> bool {
        if let Some(max_pages) = self.max_pages {
            self.total_pages > max_pages
        } else {
            false
        }
    }

    /// If this iterator will return only an incomplete set of pages, return an
    /// error describing what was skipped.
    pub fn check_complete(&self) -> Result<()> {
        match self.max_pages {
            Some(max_pages) if self.is_incomplete() => Err(anyhow!(
                "Only {}/{} pages processed (because of --max-pages)",
                max_pages,
                self.total_pages
            )),
            _ => Ok(()),
        }
    }
}

impl Iterator for PageIter {
    type Item = PageImage;

    fn next(&mut self) -> Option<Self::Item> {
        let image = self.pages.next()?;
        let index = self.next_index;
        self.next_index += 1;
        Some(PageImage { index, image })
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Decode up to `max_pages` pages of a TIFF file, and count the rest.
///
/// Each IFD in the main chain is treated as one page.
fn decode_tiff_pages(
    path: &Path,
    max_pages: Option<usize>,
) -> Result<(Vec<DynamicImage>, usize)> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).with_context(|| {
        format!("failed to create TIFF decoder for {:?}", path.display())
    })?;

    let mut images = vec![];
    let mut ifd_index = 0;
    loop {
        if let Some(max) = max_pages
            && images.len() >= max
        {
            break;
        }

        // The first IFD is already loaded.
        if ifd_index > 0 {
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().with_context(|| {
                format!(
                    "failed to advance to IFD {} in {:?}",
                    ifd_index,
                    path.display()
                )
            })?;
        }

        images.push(decode_tiff_image(&mut decoder, path, ifd_index)?);
        ifd_index += 1;
    }

    // Count the pages we didn't decode.
    let mut total_pages = images.len();
    while decoder.more_images() {
        if decoder.next_image().is_err() {
            break;
        }
        total_pages += 1;
    }

    debug!(
        path = %path.display(),
        page_count = images.len(),
        total_pages = total_pages,
        "Decoded multipage TIFF"
    );
    Ok((images, total_pages))
}

/// Decode the current TIFF IFD to a [`DynamicImage`].
fn decode_tiff_image<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
    ifd_index: usize,
) -> Result<DynamicImage> {
    let context = || format!("IFD {} in {:?}", ifd_index, path.display());
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("failed to get dimensions for {}", context()))?;
    let color_type = decoder
        .colortype()
        .with_context(|| format!("failed to get color type for {}", context()))?;
    let data = match decoder
        .read_image()
        .with_context(|| format!("failed to decode {}", context()))?
    {
        DecodingResult::U8(data) => data,
        // Keep the high byte of 16-bit samples.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            return Err(anyhow!("unsupported TIFF sample format in {}", context()));
        }
    };

    let image = match color_type {
        ColorType::Gray(_) => {
            GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8)
        }
        ColorType::RGB(_) => {
            RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8)
        }
        ColorType::RGBA(_) => {
            RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8)
        }
        other => {
            return Err(anyhow!(
                "unsupported TIFF color type {:?} in {}",
                other,
                context()
            ));
        }
    };
    image.ok_or_else(|| anyhow!("TIFF pixel data has the wrong size for {}", context()))
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use image::{ImageFormat, Rgb};
    use tiff::encoder::{TiffEncoder, colortype};

    use super::*;

    fn write_png(dir: &Path) -> PathBuf {
        let path = dir.join("frame.png");
        let image = RgbImage::from_pixel(16, 8, Rgb([255, 255, 255]));
        image.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    fn write_tiff(dir: &Path, page_count: usize) -> PathBuf {
        let path = dir.join("pages.tiff");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        for page in 0..page_count {
            let data = vec![page as u8 * 50; 12 * 6];
            encoder
                .write_image::<colortype::Gray8>(12, 6, &data)
                .unwrap();
        }
        path
    }

    #[test]
    fn png_is_a_single_page() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_png(dir.path());
        let pages = PageIter::from_path(&path, &PageIterOptions::default())?
            .collect::<Vec<_>>();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].index, 0);
        assert_eq!(pages[0].image.width(), 16);
        assert_eq!(pages[0].image.height(), 8);
        Ok(())
    }

    #[test]
    fn tiff_page_iter_returns_correct_number_of_pages() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_tiff(dir.path(), 3);
        let page_iter = PageIter::from_path(&path, &PageIterOptions::default())?;
        assert!(page_iter.check_complete().is_ok());
        let pages = page_iter.collect::<Vec<_>>();
        assert_eq!(pages.len(), 3);
        assert_eq!(
            pages.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        Ok(())
    }

    #[test]
    fn tiff_page_iter_obeys_max_pages() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_tiff(dir.path(), 2);
        let page_iter = PageIter::from_path(
            &path,
            &PageIterOptions {
                max_pages: Some(1),
            },
        )?;
        assert!(page_iter.is_incomplete());
        assert!(page_iter.check_complete().is_err());
        assert_eq!(page_iter.count(), 1);
        Ok(())
    }

    #[test]
    fn unsupported_files_are_rejected() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("notes.pdf");
        fs::write(&path, b"%PDF-1.4\n%%EOF\n")?;
        let err = PageIter::from_path(&path, &PageIterOptions::default())
            .err()
            .expect("PDF input should be rejected");
        assert!(err.to_string().contains("unsupported MIME type"), "{err}");
        Ok(())
    }

    #[test]
    fn unknown_files_are_rejected() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("garbage.bin");
        fs::write(&path, b"definitely not an image")?;
        assert!(PageIter::from_path(&path, &PageIterOptions::default()).is_err());
        Ok(())
    }
}
