//! Recognizing the text in an image.
//!
//! The OCR engine is expensive to build (it may load large models onto a GPU),
//! so we build it once per process and cache it in [`PREDICTOR`].

use std::{future::Future, sync::Arc, time::Duration};

use clap::Args;
use tokio::{sync::OnceCell, time::Instant};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    document::Document,
    page_iter::{PageIter, PageIterOptions},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use self::engines::{EngineOpts, OcrEngine, ocr_engine_for_opts};

pub mod engines;

/// The process-wide OCR engine, built on first use.
static PREDICTOR: OnceCell<Arc<dyn OcrEngine>> = OnceCell::const_new();

/// Options for recognizing text in one image.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    #[clap(flatten)]
    pub engine_opts: EngineOpts,

    #[clap(flatten)]
    pub page_iter_opts: PageIterOptions,

    /// Give up on OCR after this many seconds. 0 means no limit.
    #[clap(long, default_value = "30")]
    pub timeout_secs: u64,
}

impl Default for OcrOpts {
    fn default() -> Self {
        Self {
            engine_opts: EngineOpts::default(),
            page_iter_opts: PageIterOptions::default(),
            timeout_secs: 30,
        }
    }
}

/// Get the cached OCR engine, building it if this is the first call.
///
/// Once an engine has been built, `opts` is ignored. If building fails,
/// nothing is cached and the next call will try again.
pub async fn get_predictor(ui: &Ui, opts: &EngineOpts) -> Result<Arc<dyn OcrEngine>> {
    get_or_build_predictor(&PREDICTOR, ui, opts).await
}

/// Get the engine stored in `cell`, building it from `opts` if empty.
async fn get_or_build_predictor(
    cell: &OnceCell<Arc<dyn OcrEngine>>,
    ui: &Ui,
    opts: &EngineOpts,
) -> Result<Arc<dyn OcrEngine>> {
    if let Some(engine) = cell.get() {
        return Ok(engine.clone());
    }
    let engine = cell
        .get_or_try_init(|| async {
            let spinner = ui.new_spinner(&ProgressConfig {
                emoji: "🧠",
                msg: "Loading OCR models",
                done_msg: "Loaded OCR models",
            });
            let start = Instant::now();
            let opts = opts.clone();
            let built =
                spawn_blocking_propagating_panics(move || ocr_engine_for_opts(&opts))
                    .await
                    .and_then(|built| built);
            let engine = match built {
                Ok(engine) => {
                    spinner.finish_using_style();
                    engine
                }
                Err(err) => {
                    spinner.abandon_with_message("Failed to load OCR models");
                    return Err(err);
                }
            };
            info!(
                engine = engine.name(),
                "OCR predictor initialized in {:.2}s",
                start.elapsed().as_secs_f64()
            );
            Ok::<_, anyhow::Error>(engine)
        })
        .await?;
    Ok(engine.clone())
}

/// OCR every page of the image at `path`, in order.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), engine = engine.name()))]
pub async fn recognize_document(
    engine: &dyn OcrEngine,
    path: &Path,
    page_iter_opts: &PageIterOptions,
) -> Result<Document> {
    let owned_path = path.to_owned();
    let page_iter_opts = page_iter_opts.clone();
    let page_iter = spawn_blocking_propagating_panics(move || {
        PageIter::from_path(&owned_path, &page_iter_opts)
    })
    .await??;
    if let Err(err) = page_iter.check_complete() {
        warn!("{}", err);
    }

    let mut pages = vec![];
    for page in page_iter {
        let index = page.index;
        let page = engine
            .ocr_page(page)
            .await
            .with_context(|| format!("failed to OCR page {}", index + 1))?;
        pages.push(page);
    }
    Ok(Document { pages })
}

/// Recognize the text in `path`, returning it as a single line.
///
/// Errors are returned to the caller. See [`recognize_text`] for a version
/// which never fails.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn try_recognize_text(ui: &Ui, path: &Path, opts: &OcrOpts) -> Result<String> {
    if !path.exists() {
        return Err(anyhow!("Image not found: {}", path.display()));
    }
    let engine = get_predictor(ui, &opts.engine_opts).await?;
    recognize_text_with(engine.as_ref(), path, opts).await
}

/// Recognize the text in `path`, returning an empty string on any error.
///
/// The error is logged, so that a calling process only ever has to deal with
/// text on our standard output.
pub async fn recognize_text(ui: &Ui, path: &Path, opts: &OcrOpts) -> String {
    match try_recognize_text(ui, path, opts).await {
        Ok(text) => text,
        Err(err) => {
            error!("OCR failed: {:?}", err);
            String::new()
        }
    }
}

/// Recognize the text in `path` using a specific engine.
async fn recognize_text_with(
    engine: &dyn OcrEngine,
    path: &Path,
    opts: &OcrOpts,
) -> Result<String> {
    let start = Instant::now();
    let doc = with_timeout(
        opts.timeout_secs,
        recognize_document(engine, path, &opts.page_iter_opts),
    )
    .await?;
    let text = doc.flat_text();
    let stats = doc.stats();
    info!(
        "Processed in {:.2}s: {} chars, {} lines, {} words",
        start.elapsed().as_secs_f64(),
        stats.chars,
        stats.lines,
        stats.words
    );
    Ok(text)
}

/// Run `fut`, failing if it takes longer than `timeout_secs` (unless that is
/// 0).
async fn with_timeout<T>(
    timeout_secs: u64,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if timeout_secs == 0 {
        return fut.await;
    }
    tokio::time::timeout(Duration::from_secs(timeout_secs), fut)
        .await
        .map_err(|_| anyhow!("OCR timed out after {}s", timeout_secs))?
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, RgbImage};

    use crate::{
        document::{Block, BoundingBox, Line, Page, Word},
        page_iter::PageImage,
    };

    use super::{engines::EngineKind, *};

    /// An engine which "recognizes" the size of each page.
    struct FakeEngine {
        delay: Duration,
    }

    #[async_trait]
    impl OcrEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn ocr_page(&self, page: PageImage) -> Result<Page> {
            tokio::time::sleep(self.delay).await;
            let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
            Ok(Page {
                blocks: vec![Block {
                    lines: vec![
                        Line {
                            words: vec![
                                Word::new(
                                    format!("{}x{}", page.image.width(), page.image.height()),
                                    bbox,
                                ),
                                Word::new(format!("page{}", page.index), bbox),
                            ],
                        },
                        Line {
                            words: vec![Word::new("  ", bbox)],
                        },
                    ],
                }],
            })
        }
    }

    fn write_png(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("frame.png");
        RgbImage::new(32, 16).save_with_format(&path, ImageFormat::Png)?;
        Ok(path)
    }

    #[tokio::test]
    async fn recognize_flattens_engine_output() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_png(dir.path())?;
        let engine = FakeEngine {
            delay: Duration::ZERO,
        };
        let text = recognize_text_with(&engine, &path, &OcrOpts::default()).await?;
        assert_eq!(text, "32x16 page0");
        Ok(())
    }

    #[tokio::test]
    async fn slow_engines_time_out() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_png(dir.path())?;
        let engine = FakeEngine {
            delay: Duration::from_secs(5),
        };
        let opts = OcrOpts {
            timeout_secs: 1,
            ..OcrOpts::default()
        };
        let err = recognize_text_with(&engine, &path, &opts)
            .await
            .err()
            .expect("recognition should time out");
        assert!(err.to_string().contains("timed out"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_images_are_errors() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("frame.png");
        std::fs::write(&path, b"not really a png")?;
        let engine = FakeEngine {
            delay: Duration::ZERO,
        };
        let result = recognize_text_with(&engine, &path, &OcrOpts::default()).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn missing_images_give_empty_text() {
        let ui = Ui::init_for_tests();
        let path = Path::new("/nonexistent/frame.png");
        assert!(try_recognize_text(&ui, path, &OcrOpts::default()).await.is_err());
        assert_eq!(recognize_text(&ui, path, &OcrOpts::default()).await, "");
        // We never tried to load the models.
        assert!(PREDICTOR.get().is_none());
    }

    #[tokio::test]
    async fn failed_engine_construction_is_not_cached() {
        let ui = Ui::init_for_tests();
        let cell = OnceCell::new();
        let opts = EngineOpts {
            model_dir: PathBuf::from("/nonexistent/models"),
            ..EngineOpts::default()
        };
        assert!(get_or_build_predictor(&cell, &ui, &opts).await.is_err());
        assert!(cell.get().is_none());
        assert!(get_or_build_predictor(&cell, &ui, &opts).await.is_err());
    }

    #[tokio::test]
    async fn predictor_is_built_once() -> Result<()> {
        let ui = Ui::init_for_tests();
        let cell = OnceCell::new();
        // Building the tesseract engine doesn't need tesseract installed.
        let tesseract = EngineOpts {
            engine: EngineKind::Tesseract,
            ..EngineOpts::default()
        };
        let first = get_or_build_predictor(&cell, &ui, &tesseract).await?;
        assert_eq!(first.name(), "tesseract");

        // Later options are ignored, even ones which couldn't build an engine.
        let onnx = EngineOpts {
            engine: EngineKind::Onnx,
            model_dir: PathBuf::from("/nonexistent/models"),
            ..EngineOpts::default()
        };
        let second = get_or_build_predictor(&cell, &ui, &onnx).await?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }
}
