//! Text detection: find word boxes with a DB-style segmentation model.

use std::sync::Mutex;

use image::DynamicImage;
use ndarray::{Array2, Axis, Ix2};
use ort::{session::Session, value::Value};

use crate::{document::BoundingBox, prelude::*};

use super::{
    config::DetectionConfig,
    preprocessing::{ResizeInfo, preprocess_for_detection},
};

/// Components smaller than this (in probability map pixels) are noise.
const MIN_BOX_SIZE: usize = 2;

/// A detected word, in relative page coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectedBox {
    pub bbox: BoundingBox,
    /// Mean text probability inside the box.
    pub score: f32,
}

/// A loaded detection model.
pub struct TextDetector {
    session: Mutex<Session>,
    input_name: String,
    config: DetectionConfig,
}

impl TextDetector {
    pub fn new(session: Session, config: DetectionConfig) -> Self {
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_owned());
        debug!(input = %input_name, "Detection model ready");
        Self {
            session: Mutex::new(session),
            input_name,
            config,
        }
    }

    /// Find word boxes in `image`, in no particular order.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedBox>> {
        let (input, info) = preprocess_for_detection(image, &self.config);
        let prob_map = self.run(input)?;
        let boxes = boxes_from_probability_map(prob_map, &info, &self.config);
        debug!(count = boxes.len(), "Detected word boxes");
        Ok(boxes)
    }

    /// Run the model and return its output as a 2D map.
    fn run(&self, input: ndarray::Array4<f32>) -> Result<Array2<f32>> {
        let input_value =
            Value::from_array(input).context("failed to create detection input tensor")?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("detection session lock was poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .context("detection inference failed")?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract detection output")?;
        trace!(shape = ?output.shape(), "Detection output");

        let map = match output.ndim() {
            4 => output
                .index_axis_move(Axis(0), 0)
                .index_axis_move(Axis(0), 0)
                .to_owned(),
            3 => output.index_axis_move(Axis(0), 0).to_owned(),
            2 => output.to_owned(),
            _ => {
                return Err(anyhow!(
                    "unexpected detection output shape {:?}",
                    output.shape()
                ));
            }
        };
        map.into_dimensionality::<Ix2>()
            .context("detection output was not a 2D map")
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// An axis-aligned connected component, in probability map pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Component {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
}

/// Turn a text probability map into word boxes.
pub fn boxes_from_probability_map(
    mut prob_map: Array2<f32>,
    info: &ResizeInfo,
    config: &DetectionConfig,
) -> Vec<DetectedBox> {
    // Some exports leave out the final sigmoid.
    if prob_map.iter().any(|&v| !(0.0..=1.0).contains(&v)) {
        prob_map.mapv_inplace(sigmoid);
    }
    let (map_height, map_width) = prob_map.dim();
    if map_height == 0 || map_width == 0 {
        return vec![];
    }
    let bitmap = prob_map.mapv(|v| v > config.bin_thresh);

    // The map may be smaller than the model input.
    let scale_x = info.canvas_width as f32 / map_width as f32;
    let scale_y = info.canvas_height as f32 / map_height as f32;

    let mut boxes = vec![];
    for component in connected_components(&bitmap) {
        let width = component.max_x - component.min_x + 1;
        let height = component.max_y - component.min_y + 1;
        if width < MIN_BOX_SIZE || height < MIN_BOX_SIZE {
            continue;
        }

        let score = prob_map
            .slice(ndarray::s![
                component.min_y..=component.max_y,
                component.min_x..=component.max_x
            ])
            .mean()
            .unwrap_or(0.0);
        if score < config.box_thresh {
            continue;
        }

        // Grow the box, since the model predicts shrunken text regions.
        let (width, height) = (width as f32, height as f32);
        let distance = width * height * config.unclip_ratio / (2.0 * (width + height));
        let x0 = (component.min_x as f32 - distance) * scale_x;
        let y0 = (component.min_y as f32 - distance) * scale_y;
        let x1 = ((component.max_x + 1) as f32 + distance) * scale_x;
        let y1 = ((component.max_y + 1) as f32 + distance) * scale_y;

        let (xmin, ymin) = info.canvas_to_relative(x0, y0);
        let (xmax, ymax) = info.canvas_to_relative(x1, y1);
        let bbox = BoundingBox::new(xmin, ymin, xmax, ymax);
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            continue;
        }
        boxes.push(DetectedBox { bbox, score });
    }
    boxes
}

/// Find 4-connected components of set pixels.
fn connected_components(bitmap: &Array2<bool>) -> Vec<Component> {
    let (height, width) = bitmap.dim();
    let mut visited = Array2::<bool>::from_elem((height, width), false);
    let mut components = vec![];
    let mut stack = vec![];

    for ((y, x), &set) in bitmap.indexed_iter() {
        if !set || visited[[y, x]] {
            continue;
        }
        let mut component = Component {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        };
        visited[[y, x]] = true;
        stack.push((y, x));
        while let Some((cy, cx)) = stack.pop() {
            component.min_x = component.min_x.min(cx);
            component.max_x = component.max_x.max(cx);
            component.min_y = component.min_y.min(cy);
            component.max_y = component.max_y.max(cy);

            let mut neighbors = Vec::with_capacity(4);
            if cy > 0 {
                neighbors.push((cy - 1, cx));
            }
            if cy + 1 < height {
                neighbors.push((cy + 1, cx));
            }
            if cx > 0 {
                neighbors.push((cy, cx - 1));
            }
            if cx + 1 < width {
                neighbors.push((cy, cx + 1));
            }
            for (ny, nx) in neighbors {
                if bitmap[[ny, nx]] && !visited[[ny, nx]] {
                    visited[[ny, nx]] = true;
                    stack.push((ny, nx));
                }
            }
        }
        components.push(component);
    }
    components
}
