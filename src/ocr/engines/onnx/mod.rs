//! OCR using pretrained text detection and recognition models, run by ONNX
//! Runtime.
//!
//! Pages are assumed to be upright, so we only deal with axis-aligned boxes:
//! no orientation detection, page straightening or language detection.

use std::sync::Arc;

use image::DynamicImage;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider as _,
    },
    session::{Session, builder::GraphOptimizationLevel},
};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    document::{BoundingBox, LayoutOptions, Page, Word},
    page_iter::PageImage,
    prelude::*,
};

use self::{
    config::{OnnxModelConfig, load_vocab},
    detection::TextDetector,
    recognition::TextRecognizer,
};

use super::{Device, EngineOpts, OcrEngine};

pub mod config;
pub mod detection;
pub mod preprocessing;
pub mod recognition;

/// OCR engine running a detection model and a recognition model.
pub struct OnnxOcrEngine {
    predictor: Arc<OnnxPredictor>,
}

impl OnnxOcrEngine {
    /// Load both models. This is slow, so call it from a blocking context.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(opts: &EngineOpts) -> Result<Arc<dyn OcrEngine>> {
        let config = OnnxModelConfig::load(&opts.model_dir)?;
        for path in config.required_files() {
            if !path.exists() {
                return Err(anyhow!(
                    "ONNX model file not found: {} (set --model-dir or OCR_MODEL_DIR)",
                    path.display()
                ));
            }
        }
        let vocab = load_vocab(&config.recognition.vocab)?;
        let intra_threads = opts.intra_threads.unwrap_or_else(num_cpus::get).max(1);

        let (det_session, det_device) =
            load_session(&config.detection.model, opts.device, intra_threads)?;
        // If CUDA didn't work for the first model, don't bother trying again.
        let rec_device = if det_device == Device::Cpu {
            Device::Cpu
        } else {
            opts.device
        };
        let (rec_session, rec_device) =
            load_session(&config.recognition.model, rec_device, intra_threads)?;
        info!(
            detection = ?det_device,
            recognition = ?rec_device,
            intra_threads,
            "Loaded ONNX OCR models"
        );

        let predictor = OnnxPredictor {
            detector: TextDetector::new(det_session, config.detection),
            recognizer: TextRecognizer::new(rec_session, vocab, config.recognition),
            layout: LayoutOptions {
                resolve_blocks: opts.resolve_blocks,
                ..LayoutOptions::default()
            },
        };
        Ok(Arc::new(Self {
            predictor: Arc::new(predictor),
        }))
    }
}

#[async_trait]
impl OcrEngine for OnnxOcrEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    #[instrument(level = "debug", skip_all, fields(page = %page.index))]
    async fn ocr_page(&self, page: PageImage) -> Result<Page> {
        let predictor = self.predictor.clone();
        spawn_blocking_propagating_panics(move || predictor.ocr_image(&page.image))
            .await?
    }
}

/// Both models, plus layout settings.
struct OnnxPredictor {
    detector: TextDetector,
    recognizer: TextRecognizer,
    layout: LayoutOptions,
}

impl OnnxPredictor {
    fn ocr_image(&self, image: &DynamicImage) -> Result<Page> {
        let boxes = self.detector.detect(image)?;
        let crops = boxes
            .iter()
            .map(|detected| crop_box(image, &detected.bbox))
            .collect::<Vec<_>>();
        let texts = self.recognizer.recognize(&crops)?;
        let words = boxes
            .into_iter()
            .zip(texts)
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(detected, text)| {
                trace!(text = %text, score = detected.score, "Recognized word");
                Word::new(text, detected.bbox)
            })
            .collect::<Vec<_>>();
        debug!(words = words.len(), "Recognized words");
        Ok(Page::from_words(words, &self.layout))
    }
}

/// Cut a relative box out of `image`. Always returns at least one pixel.
fn crop_box(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let x0 = ((bbox.xmin * width as f32).floor() as u32).min(width.saturating_sub(1));
    let y0 = ((bbox.ymin * height as f32).floor() as u32).min(height.saturating_sub(1));
    let x1 = ((bbox.xmax * width as f32).ceil() as u32).clamp(x0 + 1, width.max(1));
    let y1 = ((bbox.ymax * height as f32).ceil() as u32).clamp(y0 + 1, height.max(1));
    image.crop_imm(x0, y0, x1 - x0, y1 - y0)
}

/// Is the CUDA execution provider usable in this process?
fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(err) => {
            debug!("Could not check for CUDA: {}", err);
            false
        }
    }
}

/// Load an ONNX model on the requested device. Returns the device actually
/// used, which is never [`Device::Auto`].
fn load_session(
    model_path: &Path,
    device: Device,
    intra_threads: usize,
) -> Result<(Session, Device)> {
    match device {
        Device::Cpu => {
            let session = build_session(model_path, Device::Cpu, intra_threads)?;
            Ok((session, Device::Cpu))
        }
        Device::Cuda => {
            let session = build_session(model_path, Device::Cuda, intra_threads)
                .context("--device cuda was requested but CUDA could not be used")?;
            Ok((session, Device::Cuda))
        }
        Device::Auto => {
            let cuda = cuda_available();
            info!(
                cuda_available = cuda,
                model = %model_path.display(),
                "Selecting execution provider"
            );
            if cuda {
                match build_session(model_path, Device::Cuda, intra_threads) {
                    Ok(session) => return Ok((session, Device::Cuda)),
                    Err(err) => {
                        warn!(
                            "CUDA execution provider failed, falling back to CPU: {:?}",
                            err
                        );
                    }
                }
            }
            let session = build_session(model_path, Device::Cpu, intra_threads)?;
            Ok((session, Device::Cpu))
        }
    }
}

fn build_session(
    model_path: &Path,
    device: Device,
    intra_threads: usize,
) -> Result<Session> {
    let providers = match device {
        Device::Cuda => [CUDAExecutionProvider::default().build().error_on_failure()],
        Device::Cpu | Device::Auto => [CPUExecutionProvider::default().build()],
    };
    Session::builder()
        .context("failed to create session builder")?
        .with_execution_providers(providers)
        .context("failed to register execution provider")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set optimization level")?
        .with_intra_threads(intra_threads)
        .context("failed to set intra threads")?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))
}
