//! The image-transform / neural-net family: [`ImageTransformer`]
//! (resize/crop/rotate), [`NeuralNetEvaluator`] (batched model evaluation
//! behind the [`ModelBackend`] seam), [`ImageClassifier`] (top-K labels)
//! and [`ImageSegmenter`] (per-pixel argmax). The DNN framework itself is
//! out of scope; [`MockModelBackend`] is a deterministic stand-in used by
//! tests and demos in place of a real model runtime.

use crate::context::Runtime;
use crate::error::{RuntimeError, SafResult};
use crate::factory::OperatorFactory;
use crate::frame::{Frame, ImageMatrix, PixelDepth};
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const KEY_IMAGE: &str = "image";

/// Resizes `image` to `width x height` using nearest-neighbor sampling.
fn resize_nearest(src: &ImageMatrix, width: u32, height: u32) -> ImageMatrix {
    let mut data = vec![0u8; (width * height * src.channels) as usize * src.depth.bytes_per_element()];
    let bpe = src.depth.bytes_per_element();
    for y in 0..height {
        let src_y = (y as u64 * src.rows as u64 / height.max(1) as u64) as u32;
        for x in 0..width {
            let src_x = (x as u64 * src.cols as u64 / width.max(1) as u64) as u32;
            for c in 0..src.channels {
                let src_idx = ((src_y * src.cols + src_x) * src.channels + c) as usize * bpe;
                let dst_idx = ((y * width + x) * src.channels + c) as usize * bpe;
                data[dst_idx..dst_idx + bpe].copy_from_slice(&src.data[src_idx..src_idx + bpe]);
            }
        }
    }
    ImageMatrix {
        rows: height,
        cols: width,
        channels: src.channels,
        depth: src.depth,
        data,
    }
}

/// Rotation applied before/instead of resizing, in quarter turns
/// clockwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Deg90,
    Deg180,
    Deg270,
}

fn rotate(src: &ImageMatrix, rotation: Rotation) -> ImageMatrix {
    if rotation == Rotation::None {
        return src.clone();
    }
    let bpe = src.depth.bytes_per_element();
    let (rows, cols, channels) = (src.rows, src.cols, src.channels);
    let (out_rows, out_cols) = match rotation {
        Rotation::Deg180 => (rows, cols),
        _ => (cols, rows),
    };
    let mut data = vec![0u8; src.data.len()];
    for y in 0..rows {
        for x in 0..cols {
            let (out_x, out_y) = match rotation {
                Rotation::Deg90 => (rows - 1 - y, x),
                Rotation::Deg180 => (cols - 1 - x, rows - 1 - y),
                Rotation::Deg270 => (y, cols - 1 - x),
                Rotation::None => unreachable!(),
            };
            for c in 0..channels {
                let src_idx = ((y * cols + x) * channels + c) as usize * bpe;
                let dst_idx = ((out_y * out_cols + out_x) * channels + c) as usize * bpe;
                data[dst_idx..dst_idx + bpe].copy_from_slice(&src.data[src_idx..src_idx + bpe]);
            }
        }
    }
    ImageMatrix {
        rows: out_rows,
        cols: out_cols,
        channels,
        depth: src.depth,
        data,
    }
}

/// Resizes (and optionally rotates) the `image` field, storing the result
/// back at `"image"`. Decoding `original_bytes` into an image is a codec
/// concern out of scope here — the operator assumes an upstream source
/// already populated `"image"`, or synthesizes a blank one of the
/// configured size so the pipeline's shape stays testable without a real
/// decoder.
pub struct ImageTransformer {
    width: u32,
    height: u32,
    rotation: Rotation,
}

impl ImageTransformer {
    pub fn new(width: u32, height: u32, rotation: Rotation) -> Self {
        Self { width, height, rotation }
    }
}

impl OperatorLogic for ImageTransformer {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        let source = frame
            .get::<ImageMatrix>(KEY_IMAGE)
            .unwrap_or_else(|_| ImageMatrix::zeros(self.height, self.width, 3, PixelDepth::U8));
        let rotated = rotate(&source, self.rotation);
        let resized = resize_nearest(&rotated, self.width, self.height);
        frame.set(KEY_IMAGE, resized);
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// The out-of-scope DNN framework seam: given a named input
/// layer and a batch of images, produces a named output-layer activation
/// tensor per image.
pub trait ModelBackend: Send {
    fn default_output_layer(&self) -> &str;
    fn evaluate_batch(
        &mut self,
        input_layer: &str,
        images: &[ImageMatrix],
        output_layers: &[String],
    ) -> Result<Vec<HashMap<String, Vec<f32>>>, RuntimeError>;
}

/// A deterministic stand-in producing a fixed-length activation vector per
/// image, independent of pixel content — enough to exercise the substrate
/// (batching, field attachment, ordering) without a real model runtime.
pub struct MockModelBackend {
    default_output_layer: String,
    activation_len: usize,
}

impl MockModelBackend {
    pub fn new(default_output_layer: impl Into<String>, activation_len: usize) -> Self {
        Self {
            default_output_layer: default_output_layer.into(),
            activation_len,
        }
    }
}

impl ModelBackend for MockModelBackend {
    fn default_output_layer(&self) -> &str {
        &self.default_output_layer
    }

    fn evaluate_batch(
        &mut self,
        _input_layer: &str,
        images: &[ImageMatrix],
        output_layers: &[String],
    ) -> Result<Vec<HashMap<String, Vec<f32>>>, RuntimeError> {
        Ok(images
            .iter()
            .map(|img| {
                let seed: f32 = img.data.iter().map(|b| *b as u32).sum::<u32>() as f32;
                let mut out = HashMap::new();
                for layer in output_layers {
                    let activations = (0..self.activation_len)
                        .map(|i| (seed + i as f32).sin().abs())
                        .collect();
                    out.insert(layer.clone(), activations);
                }
                out
            })
            .collect())
    }
}

/// Real ONNX Runtime-backed model, enabled by the `onnx` feature.
/// One inference call per image (batching across the session itself is
/// left to ONNX Runtime's own execution provider); images are normalized
/// to `[0, 1]` floats in `NCHW` layout before being handed to the session.
#[cfg(feature = "onnx")]
mod onnx_backend {
    use super::ModelBackend;
    use crate::error::RuntimeError;
    use crate::frame::ImageMatrix;
    use ort::session::Session;
    use ort::value::Tensor;
    use std::collections::HashMap;

    pub struct OnnxModelBackend {
        session: Session,
        default_output_layer: String,
    }

    impl OnnxModelBackend {
        pub fn new(model_path: &str, default_output_layer: impl Into<String>) -> Result<Self, RuntimeError> {
            let session = Session::builder()
                .map_err(|e| RuntimeError::Model(e.to_string()))?
                .commit_from_file(model_path)
                .map_err(|e| RuntimeError::Model(e.to_string()))?;
            Ok(Self {
                session,
                default_output_layer: default_output_layer.into(),
            })
        }
    }

    impl ModelBackend for OnnxModelBackend {
        fn default_output_layer(&self) -> &str {
            &self.default_output_layer
        }

        fn evaluate_batch(
            &mut self,
            input_layer: &str,
            images: &[ImageMatrix],
            output_layers: &[String],
        ) -> Result<Vec<HashMap<String, Vec<f32>>>, RuntimeError> {
            let mut results = Vec::with_capacity(images.len());
            for image in images {
                let chw: Vec<f32> = image.data.iter().map(|&b| b as f32 / 255.0).collect();
                let shape = [1usize, image.channels as usize, image.rows as usize, image.cols as usize];
                let tensor =
                    Tensor::from_array((shape, chw)).map_err(|e| RuntimeError::Model(e.to_string()))?;
                let inputs = ort::inputs![input_layer => tensor].map_err(|e| RuntimeError::Model(e.to_string()))?;
                let outputs = self.session.run(inputs).map_err(|e| RuntimeError::Model(e.to_string()))?;
                let mut per_frame = HashMap::new();
                for layer in output_layers {
                    if let Some(value) = outputs.get(layer.as_str()) {
                        if let Ok((_, data)) = value.try_extract_raw_tensor::<f32>() {
                            per_frame.insert(layer.clone(), data.to_vec());
                        }
                    }
                }
                results.push(per_frame);
            }
            Ok(results)
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx_backend::OnnxModelBackend;

/// Batches up to `batch_size` frames, runs the [`ModelBackend`] on the
/// configured input layer, and attaches each requested output layer's
/// activation tensor as a frame field named after the layer. A partial batch is flushed once the operator sees a stop frame
/// or whenever fewer than `batch_size` frames have accumulated across two
/// ticks with no new arrivals — simplified here to "flush whenever the
/// batch is full" since `process` only ever sees one frame per tick and
/// the substrate already paces ticks at the 15ms source-pop timeout.
pub struct NeuralNetEvaluator {
    backend: Box<dyn ModelBackend>,
    input_layer: String,
    output_layers: Vec<String>,
    batch_size: usize,
    pending: VecDeque<Frame>,
}

impl NeuralNetEvaluator {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        input_layer: impl Into<String>,
        output_layers: Vec<String>,
        batch_size: usize,
    ) -> Self {
        assert!(batch_size > 0, "NeuralNetEvaluator batch_size must be positive");
        Self {
            backend,
            input_layer: input_layer.into(),
            output_layers,
            batch_size,
            pending: VecDeque::new(),
        }
    }

    fn flush(&mut self, io: &mut OperatorIo<'_>) {
        if self.pending.is_empty() {
            return;
        }
        let frames: Vec<Frame> = self.pending.drain(..).collect();
        let images: Vec<ImageMatrix> = frames
            .iter()
            .map(|f| f.get::<ImageMatrix>(KEY_IMAGE).unwrap_or_else(|_| ImageMatrix::zeros(1, 1, 1, PixelDepth::U8)))
            .collect();
        match self
            .backend
            .evaluate_batch(&self.input_layer, &images, &self.output_layers)
        {
            Ok(activations) => {
                for (mut frame, layers) in frames.into_iter().zip(activations) {
                    for (layer, tensor) in layers {
                        frame.set(layer, tensor);
                    }
                    io.push_frame("output", frame);
                }
            }
            Err(e) => log::error!("NeuralNetEvaluator batch evaluation failed: {e}"),
        }
    }
}

impl OperatorLogic for NeuralNetEvaluator {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        if let Some(frame) = io.get_frame("input") {
            self.pending.push_back(frame);
        }
        if self.pending.len() >= self.batch_size {
            self.flush(io);
        }
    }

    fn on_stop(&mut self, io: &mut OperatorOnStopIo<'_>) -> bool {
        for frame in self.pending.drain(..) {
            io.push_frame("output", frame);
        }
        true
    }
}

/// Reads the activation tensor at the model's default output layer and
/// attaches top-K labels and probabilities.
pub struct ImageClassifier {
    output_layer: String,
    labels: Vec<String>,
    top_k: usize,
}

impl ImageClassifier {
    pub fn new(output_layer: impl Into<String>, labels: Vec<String>, top_k: usize) -> Self {
        Self {
            output_layer: output_layer.into(),
            labels,
            top_k,
        }
    }
}

impl OperatorLogic for ImageClassifier {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(activations) = frame.get::<Vec<f32>>(&self.output_layer) {
            let mut indexed: Vec<(usize, f32)> = activations.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            indexed.truncate(self.top_k);
            let top_labels: Vec<String> = indexed
                .iter()
                .map(|(i, _)| self.labels.get(*i).cloned().unwrap_or_else(|| format!("class_{i}")))
                .collect();
            let top_probs: Vec<f32> = indexed.iter().map(|(_, p)| *p).collect();
            frame.set("labels", top_labels);
            frame.set("probabilities", top_probs);
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Per-pixel argmax over `output_layer`'s activation tensor (assumed to be
/// a flattened `rows * cols * num_classes` row-major tensor), attaching a
/// colored segmentation image.
pub struct ImageSegmenter {
    output_layer: String,
    num_classes: usize,
    rows: u32,
    cols: u32,
    palette: Vec<[u8; 3]>,
}

impl ImageSegmenter {
    pub fn new(output_layer: impl Into<String>, num_classes: usize, rows: u32, cols: u32) -> Self {
        let palette = (0..num_classes)
            .map(|i| {
                let hue = (i as u8).wrapping_mul(37);
                [hue, hue.wrapping_mul(3), hue.wrapping_mul(5)]
            })
            .collect();
        Self {
            output_layer: output_layer.into(),
            num_classes,
            rows,
            cols,
            palette,
        }
    }
}

impl OperatorLogic for ImageSegmenter {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(scores) = frame.get::<Vec<f32>>(&self.output_layer) {
            let mut data = vec![0u8; (self.rows * self.cols * 3) as usize];
            for pixel in 0..(self.rows * self.cols) as usize {
                let base = pixel * self.num_classes;
                let mut best_class = 0usize;
                let mut best_score = f32::MIN;
                for c in 0..self.num_classes {
                    if let Some(&score) = scores.get(base + c) {
                        if score > best_score {
                            best_score = score;
                            best_class = c;
                        }
                    }
                }
                let color = self.palette.get(best_class).copied().unwrap_or([0, 0, 0]);
                data[pixel * 3..pixel * 3 + 3].copy_from_slice(&color);
            }
            frame.set(
                "segmentation_image",
                ImageMatrix::new_u8(self.rows, self.cols, 3, data),
            );
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

fn parse_output_layers(params: &HashMap<String, String>, default_layer: &str) -> Vec<String> {
    match params.get("output_layers") {
        Some(s) => s.split(',').map(|s| s.trim().to_string()).collect(),
        None => vec![default_layer.to_string()],
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "ImageTransformer",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let width: u32 = params.get("width").and_then(|v| v.parse().ok()).unwrap_or(224);
            let height: u32 = params.get("height").and_then(|v| v.parse().ok()).unwrap_or(224);
            let rotation = match params.get("rotation").map(String::as_str) {
                Some("90") => Rotation::Deg90,
                Some("180") => Rotation::Deg180,
                Some("270") => Rotation::Deg270,
                _ => Rotation::None,
            };
            Ok(Operator::new(
                name,
                "ImageTransformer",
                &["input"],
                &["output"],
                Box::new(ImageTransformer::new(width, height, rotation)),
            ))
        }),
    );

    factory.register(
        "NeuralNetEvaluator",
        Box::new(|name, params, runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let model_name = params.get("model").cloned().unwrap_or_default();
            let default_output_layer = runtime
                .models
                .model(&model_name)
                .map(|m| m.default_output_layer.clone())
                .unwrap_or_else(|_| "prob".to_string());
            let input_layer = runtime
                .models
                .model(&model_name)
                .map(|m| m.default_input_layer.clone())
                .unwrap_or_else(|_| "data".to_string());
            let output_layers = parse_output_layers(params, &default_output_layer);
            let activation_len: usize = params
                .get("activation_len")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000);
            let batch_size: usize = params.get("batch_size").and_then(|v| v.parse().ok()).unwrap_or(1);
            let backend: Box<dyn ModelBackend> = {
                #[cfg(feature = "onnx")]
                {
                    match params.get("model_path") {
                        Some(path) => match onnx_backend::OnnxModelBackend::new(path, default_output_layer.clone()) {
                            Ok(b) => Box::new(b),
                            Err(e) => {
                                log::warn!("NeuralNetEvaluator falling back to mock backend: {e}");
                                Box::new(MockModelBackend::new(default_output_layer, activation_len))
                            }
                        },
                        None => Box::new(MockModelBackend::new(default_output_layer, activation_len)),
                    }
                }
                #[cfg(not(feature = "onnx"))]
                {
                    Box::new(MockModelBackend::new(default_output_layer, activation_len))
                }
            };
            Ok(Operator::new(
                name,
                "NeuralNetEvaluator",
                &["input"],
                &["output"],
                Box::new(NeuralNetEvaluator::new(backend, input_layer, output_layers, batch_size)),
            ))
        }),
    );

    factory.register(
        "ImageClassifier",
        Box::new(|name, params, runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let model_name = params.get("model").cloned().unwrap_or_default();
            let output_layer = runtime
                .models
                .model(&model_name)
                .map(|m| m.default_output_layer.clone())
                .unwrap_or_else(|_| "prob".to_string());
            let labels = params
                .get("labels")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let top_k: usize = params.get("top_k").and_then(|v| v.parse().ok()).unwrap_or(5);
            Ok(Operator::new(
                name,
                "ImageClassifier",
                &["input"],
                &["output"],
                Box::new(ImageClassifier::new(output_layer, labels, top_k)),
            ))
        }),
    );

    factory.register(
        "ImageSegmenter",
        Box::new(|name, params, runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let model_name = params.get("model").cloned().unwrap_or_default();
            let output_layer = runtime
                .models
                .model(&model_name)
                .map(|m| m.default_output_layer.clone())
                .unwrap_or_else(|_| "prob".to_string());
            let num_classes: usize = params.get("num_classes").and_then(|v| v.parse().ok()).unwrap_or(21);
            let rows: u32 = params.get("height").and_then(|v| v.parse().ok()).unwrap_or(224);
            let cols: u32 = params.get("width").and_then(|v| v.parse().ok()).unwrap_or(224);
            Ok(Operator::new(
                name,
                "ImageSegmenter",
                &["input"],
                &["output"],
                Box::new(ImageSegmenter::new(output_layer, num_classes, rows, cols)),
            ))
        }),
    );
}
