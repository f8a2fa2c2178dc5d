//! Text recognition: read the word in each crop with a CTC model.

use std::sync::Mutex;

use image::DynamicImage;
use ndarray::{Array4, ArrayView2, Axis, Ix3};
use ort::{session::Session, value::Value};

use crate::prelude::*;

use super::{
    config::{BlankPosition, RecognitionConfig},
    preprocessing::preprocess_for_recognition,
};

/// A loaded recognition model and its vocabulary.
pub struct TextRecognizer {
    session: Mutex<Session>,
    input_name: String,
    vocab: Vec<char>,
    config: RecognitionConfig,
}

impl TextRecognizer {
    pub fn new(session: Session, vocab: Vec<char>, config: RecognitionConfig) -> Self {
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_owned());
        debug!(input = %input_name, vocab_size = vocab.len(), "Recognition model ready");
        Self {
            session: Mutex::new(session),
            input_name,
            vocab,
            config,
        }
    }

    /// Recognize the text in each crop. Returns one string per crop.
    pub fn recognize(&self, crops: &[DynamicImage]) -> Result<Vec<String>> {
        let mut texts = Vec::with_capacity(crops.len());
        for batch in crops.chunks(self.config.batch_size) {
            let input = preprocess_for_recognition(batch, &self.config);
            texts.extend(self.run(input)?);
        }
        Ok(texts)
    }

    fn run(&self, input: Array4<f32>) -> Result<Vec<String>> {
        let batch_size = input.shape()[0];
        let input_value = Value::from_array(input)
            .context("failed to create recognition input tensor")?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("recognition session lock was poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .context("recognition inference failed")?;
        let logits = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract recognition output")?
            .into_dimensionality::<Ix3>()
            .context("recognition output should be [batch, steps, classes]")?;
        if logits.shape()[0] != batch_size {
            return Err(anyhow!(
                "recognition output has batch size {}, expected {}",
                logits.shape()[0],
                batch_size
            ));
        }

        Ok(logits
            .axis_iter(Axis(0))
            .map(|steps| ctc_greedy_decode(steps, &self.vocab, self.config.blank))
            .collect())
    }
}

/// Greedy CTC decoding: take the best class at each step, collapse repeats
/// and drop blanks.
pub fn ctc_greedy_decode(
    logits: ArrayView2<'_, f32>,
    vocab: &[char],
    blank: BlankPosition,
) -> String {
    let num_classes = logits.ncols();
    if num_classes == 0 {
        return String::new();
    }
    let blank_idx = match blank {
        BlankPosition::First => 0,
        BlankPosition::Last => num_classes - 1,
    };

    let mut text = String::new();
    let mut prev = None;
    for step in logits.rows() {
        let best = step
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best_idx, best_val), (idx, &val)| {
                if val > best_val {
                    (idx, val)
                } else {
                    (best_idx, best_val)
                }
            })
            .0;
        if best != blank_idx && prev != Some(best) {
            let vocab_idx = match blank {
                BlankPosition::First => best - 1,
                BlankPosition::Last => best,
            };
            if let Some(&symbol) = vocab.get(vocab_idx) {
                text.push(symbol);
            }
        }
        prev = Some(best);
    }
    text
}
