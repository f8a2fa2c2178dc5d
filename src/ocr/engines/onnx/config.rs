//! Model configuration, loaded from `ocr.toml` in the model directory.
//!
//! Every field has a default matching docTR's `db_resnet50` detector and
//! `crnn_vgg16_bn` recognizer, so the file only needs to list overrides.

use std::fs;

use serde::Deserialize;

use crate::prelude::*;

/// The name of the optional configuration file inside the model directory.
pub const CONFIG_FILE_NAME: &str = "ocr.toml";

/// Configuration for both models.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OnnxModelConfig {
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
}

/// Text detection model settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    /// Path to the ONNX model.
    pub model: PathBuf,
    /// Images are resized to fit a square of this size.
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Probability above which a pixel counts as text.
    pub bin_thresh: f32,
    /// Minimum mean probability of a box.
    pub box_thresh: f32,
    /// How far to grow boxes, relative to their area and perimeter.
    pub unclip_ratio: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("det.onnx"),
            input_size: 1024,
            mean: [0.798, 0.785, 0.772],
            std: [0.264, 0.2749, 0.287],
            bin_thresh: 0.3,
            box_thresh: 0.1,
            unclip_ratio: 1.5,
        }
    }
}

/// Where the CTC blank sits in the recognizer's output classes.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlankPosition {
    /// Class 0 is blank, and class `i` is vocabulary entry `i - 1`.
    First,
    /// The last class is blank, and class `i` is vocabulary entry `i`.
    #[default]
    Last,
}

/// Text recognition model settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionConfig {
    /// Path to the ONNX model.
    pub model: PathBuf,
    /// Path to the vocabulary, one symbol per line.
    pub vocab: PathBuf,
    pub input_height: u32,
    pub input_width: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub blank: BlankPosition,
    /// Maximum number of word crops per inference call.
    pub batch_size: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("rec.onnx"),
            vocab: PathBuf::from("vocab.txt"),
            input_height: 32,
            input_width: 128,
            mean: [0.694, 0.695, 0.693],
            std: [0.299, 0.296, 0.301],
            blank: BlankPosition::Last,
            batch_size: 64,
        }
    }
}

impl OnnxModelConfig {
    /// Load the configuration for `model_dir`, resolving relative paths
    /// against it.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {:?}", path.display()))?;
            Self::from_toml(&data)
                .with_context(|| format!("failed to parse {:?}", path.display()))?
        } else {
            debug!(path = %path.display(), "No model config found, using defaults");
            Self::default()
        };

        config.detection.model = model_dir.join(&config.detection.model);
        config.recognition.model = model_dir.join(&config.recognition.model);
        config.recognition.vocab = model_dir.join(&config.recognition.vocab);
        config.validate()?;
        Ok(config)
    }

    fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    fn validate(&self) -> Result<()> {
        if self.detection.input_size == 0 {
            return Err(anyhow!("detection.input_size must be positive"));
        }
        let rec = &self.recognition;
        if rec.input_height == 0 || rec.input_width == 0 || rec.batch_size == 0 {
            return Err(anyhow!(
                "recognition input_height, input_width and batch_size must be positive"
            ));
        }
        if self
            .detection
            .std
            .iter()
            .chain(rec.std.iter())
            .any(|&s| s <= 0.0)
        {
            return Err(anyhow!("std values must be positive"));
        }
        Ok(())
    }

    /// The model files we need, for checking before we start ONNX Runtime.
    pub fn required_files(&self) -> [&Path; 3] {
        [
            &self.detection.model,
            &self.recognition.model,
            &self.recognition.vocab,
        ]
    }
}

/// Load a vocabulary file with one symbol per line.
///
/// A line holding a single space is the space symbol. Other lines are trimmed
/// and empty lines are skipped.
pub fn load_vocab(path: &Path) -> Result<Vec<char>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read vocabulary {:?}", path.display()))?;
    let vocab = parse_vocab(&data);
    if vocab.is_empty() {
        return Err(anyhow!("vocabulary {:?} is empty", path.display()));
    }
    Ok(vocab)
}

fn parse_vocab(data: &str) -> Vec<char> {
    data.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| {
            if line == " " {
                Some(' ')
            } else {
                line.trim().chars().next()
            }
        })
        .collect()
}
