//! OCR engine interface.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{document::Page, page_iter::PageImage, prelude::*};

pub mod onnx;
pub mod tesseract;

/// Which OCR engine should we use?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Pretrained text detection and recognition models run by ONNX Runtime.
    #[default]
    Onnx,
    /// The `tesseract` command-line tool.
    Tesseract,
}

/// Where should we run inference?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Device {
    /// Use CUDA if it works, otherwise the CPU.
    #[default]
    Auto,
    /// Always use the CPU.
    Cpu,
    /// Require CUDA.
    Cuda,
}

/// Options used to construct an OCR engine.
#[derive(Args, Clone, Debug)]
pub struct EngineOpts {
    /// The OCR engine to use.
    #[clap(long, env = "OCR_ENGINE", value_enum, default_value_t = EngineKind::Onnx)]
    pub engine: EngineKind,

    /// Where to run the models.
    #[clap(long, env = "OCR_DEVICE", value_enum, default_value_t = Device::Auto)]
    pub device: Device,

    /// Directory containing the ONNX models and an optional `ocr.toml`.
    #[clap(long, env = "OCR_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// Language passed to `tesseract -l`.
    #[clap(long, env = "OCR_TESSERACT_LANG", default_value = "eng")]
    pub lang: String,

    /// Split pages into several blocks based on vertical spacing.
    #[clap(long)]
    pub resolve_blocks: bool,

    /// Number of threads used by ONNX Runtime for each model. Defaults to the
    /// number of CPUs.
    #[clap(long)]
    pub intra_threads: Option<usize>,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            device: Device::default(),
            model_dir: PathBuf::from("models"),
            lang: "eng".to_owned(),
            resolve_blocks: false,
            intra_threads: None,
        }
    }
}

/// Interface to an engine which OCRs a single page.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// OCR a single page.
    async fn ocr_page(&self, page: PageImage) -> Result<Page>;
}

/// Build the OCR engine selected by `opts`.
///
/// This may load large models, so call it from a blocking context.
pub fn ocr_engine_for_opts(opts: &EngineOpts) -> Result<Arc<dyn OcrEngine>> {
    match opts.engine {
        EngineKind::Onnx => onnx::OnnxOcrEngine::new(opts),
        EngineKind::Tesseract => tesseract::TesseractOcrEngine::new(opts),
    }
}
