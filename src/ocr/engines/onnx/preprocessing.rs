//! Image to tensor conversion for both models.

use image::{DynamicImage, RgbImage, imageops};
use ndarray::Array4;

use super::config::{DetectionConfig, RecognitionConfig};

/// How an image was placed on a fixed-size canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResizeInfo {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl ResizeInfo {
    /// Convert a point on the canvas to relative coordinates in the original
    /// image.
    pub fn canvas_to_relative(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.resized_width as f32,
            (y - self.offset_y as f32) / self.resized_height as f32,
        )
    }
}

/// Work out where an image of `width × height` goes on the canvas, keeping
/// its aspect ratio.
pub fn fit_to_canvas(
    width: u32,
    height: u32,
    canvas_width: u32,
    canvas_height: u32,
    centered: bool,
) -> ResizeInfo {
    let scale = f32::min(
        canvas_width as f32 / width.max(1) as f32,
        canvas_height as f32 / height.max(1) as f32,
    );
    let resized_width = ((width as f32 * scale).round() as u32).clamp(1, canvas_width);
    let resized_height =
        ((height as f32 * scale).round() as u32).clamp(1, canvas_height);
    let (offset_x, offset_y) = if centered {
        (
            (canvas_width - resized_width) / 2,
            (canvas_height - resized_height) / 2,
        )
    } else {
        (0, 0)
    };
    ResizeInfo {
        canvas_width,
        canvas_height,
        resized_width,
        resized_height,
        offset_x,
        offset_y,
    }
}

/// Resize an image onto a black canvas.
fn resize_onto_canvas(image: &DynamicImage, info: &ResizeInfo) -> RgbImage {
    let resized = imageops::resize(
        &image.to_rgb8(),
        info.resized_width,
        info.resized_height,
        imageops::FilterType::Triangle,
    );
    let mut canvas = RgbImage::new(info.canvas_width, info.canvas_height);
    imageops::overlay(
        &mut canvas,
        &resized,
        i64::from(info.offset_x),
        i64::from(info.offset_y),
    );
    canvas
}

/// Write `image` into `tensor[batch_idx]` as normalized CHW floats.
fn write_normalized(
    tensor: &mut Array4<f32>,
    batch_idx: usize,
    image: &RgbImage,
    mean: &[f32; 3],
    std: &[f32; 3],
) {
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            tensor[[batch_idx, c, y as usize, x as usize]] = (value - mean[c]) / std[c];
        }
    }
}

/// Prepare a page for the detection model: a `[1, 3, size, size]` tensor,
/// with the page centered on a black square.
pub fn preprocess_for_detection(
    image: &DynamicImage,
    config: &DetectionConfig,
) -> (Array4<f32>, ResizeInfo) {
    let size = config.input_size;
    let info = fit_to_canvas(image.width(), image.height(), size, size, true);
    let canvas = resize_onto_canvas(image, &info);
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    write_normalized(&mut tensor, 0, &canvas, &config.mean, &config.std);
    (tensor, info)
}

/// Prepare word crops for the recognition model: an `[N, 3, H, W]` tensor,
/// with each crop in the top left corner.
pub fn preprocess_for_recognition(
    crops: &[DynamicImage],
    config: &RecognitionConfig,
) -> Array4<f32> {
    let (width, height) = (config.input_width, config.input_height);
    let mut tensor =
        Array4::<f32>::zeros((crops.len(), 3, height as usize, width as usize));
    for (idx, crop) in crops.iter().enumerate() {
        let info = fit_to_canvas(crop.width(), crop.height(), width, height, false);
        let canvas = resize_onto_canvas(crop, &info);
        write_normalized(&mut tensor, idx, &canvas, &config.mean, &config.std);
    }
    tensor
}
