//! Bounding-box / identity / feature operators. The detector/tracker/embedding math itself is
//! out of scope; each operator here is a thin
//! `Process`-loop wrapper around a small backend trait, the same shape as
//! [`super::neural_net::ModelBackend`], with a deterministic mock backend
//! so the substrate (field wiring, ordering, batching) is exercised
//! without a real detector/tracker/embedding model.

use crate::context::Runtime;
use crate::error::{RuntimeError, SafResult};
use crate::factory::OperatorFactory;
use crate::frame::{Frame, ImageMatrix, Rect};
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use log::warn;
use std::sync::Arc;

const KEY_BOUNDING_BOXES: &str = "bounding_boxes";
const KEY_TAGS: &str = "tags";
const KEY_IDS: &str = "ids";
const KEY_FEATURES: &str = "features";
const KEY_IMAGE: &str = "image";

/// Produces bounding boxes and class tags for an image (`ObjectDetector`'s
/// algorithmic body, an out-of-scope concern).
pub trait DetectorBackend: Send {
    fn detect(&mut self, image: &ImageMatrix) -> Result<Vec<(Rect, String)>, RuntimeError>;
}

/// Deterministic stand-in: always reports one bounding box covering the
/// whole frame, tagged `"object"`.
pub struct MockDetectorBackend;

impl DetectorBackend for MockDetectorBackend {
    fn detect(&mut self, image: &ImageMatrix) -> Result<Vec<(Rect, String)>, RuntimeError> {
        Ok(vec![(
            Rect {
                x: 0,
                y: 0,
                w: image.cols as i32,
                h: image.rows as i32,
            },
            "object".to_string(),
        )])
    }
}

/// Reads `"image"`, attaches `bounding_boxes` and `tags`.
pub struct ObjectDetector {
    backend: Box<dyn DetectorBackend>,
}

impl ObjectDetector {
    pub fn new(backend: Box<dyn DetectorBackend>) -> Self {
        Self { backend }
    }
}

impl OperatorLogic for ObjectDetector {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(image) = frame.get::<ImageMatrix>(KEY_IMAGE) {
            match self.backend.detect(&image) {
                Ok(detections) => {
                    let (rects, tags): (Vec<Rect>, Vec<String>) = detections.into_iter().unzip();
                    frame.set(KEY_BOUNDING_BOXES, rects);
                    frame.set(KEY_TAGS, tags);
                }
                Err(e) => log::error!("ObjectDetector failed: {e}"),
            }
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Assigns a stable identity to each incoming bounding box across frames
/// (`ObjectTracker`/`FaceTracker`'s algorithmic body, an out-of-scope
/// concern).
pub trait TrackerBackend: Send {
    fn track(&mut self, boxes: &[Rect]) -> Vec<i64>;
}

/// Deterministic stand-in: assigns a fresh, monotonically increasing id to
/// every box in every frame (no real cross-frame association).
#[derive(Default)]
pub struct MockTrackerBackend {
    next_id: i64,
}

impl TrackerBackend for MockTrackerBackend {
    fn track(&mut self, boxes: &[Rect]) -> Vec<i64> {
        (0..boxes.len())
            .map(|_| {
                let id = self.next_id;
                self.next_id += 1;
                id
            })
            .collect()
    }
}

/// Consumes `bounding_boxes`, attaches `ids`. Used for
/// both `ObjectTracker` and `FaceTracker` — the two differ only in which
/// upstream operator feeds them boxes, not in substrate behavior.
pub struct BoxTracker {
    backend: Box<dyn TrackerBackend>,
}

impl BoxTracker {
    pub fn new(backend: Box<dyn TrackerBackend>) -> Self {
        Self { backend }
    }
}

impl OperatorLogic for BoxTracker {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(boxes) = frame.get::<Vec<Rect>>(KEY_BOUNDING_BOXES) {
            let ids = self.backend.track(&boxes);
            frame.set(KEY_IDS, ids);
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Produces an embedding vector for each cropped region (`FeatureExtractor`
/// / `Facenet`'s algorithmic body, an out-of-scope concern).
pub trait EmbeddingBackend: Send {
    fn embed(&mut self, image: &ImageMatrix, region: &Rect) -> Vec<f32>;
}

/// Deterministic stand-in: an embedding derived from the region's area and
/// position, fixed length.
pub struct MockEmbeddingBackend {
    dims: usize,
}

impl MockEmbeddingBackend {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl EmbeddingBackend for MockEmbeddingBackend {
    fn embed(&mut self, _image: &ImageMatrix, region: &Rect) -> Vec<f32> {
        let seed = (region.w * region.h + region.x + region.y) as f32;
        (0..self.dims).map(|i| (seed + i as f32).cos()).collect()
    }
}

/// Consumes `image` + `bounding_boxes`, attaches `features` — one
/// embedding vector per box, in box order. Used for both
/// `FeatureExtractor` and `Facenet`.
pub struct FeatureExtractor {
    backend: Box<dyn EmbeddingBackend>,
}

impl FeatureExtractor {
    pub fn new(backend: Box<dyn EmbeddingBackend>) -> Self {
        Self { backend }
    }
}

impl OperatorLogic for FeatureExtractor {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let (Ok(image), Ok(boxes)) = (
            frame.get::<ImageMatrix>(KEY_IMAGE),
            frame.get::<Vec<Rect>>(KEY_BOUNDING_BOXES),
        ) {
            let features: Vec<Vec<f32>> = boxes.iter().map(|r| self.backend.embed(&image, r)).collect();
            frame.set(KEY_FEATURES, features);
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Matches incoming `features` against a fixed gallery by nearest
/// (Euclidean) distance, attaching `ids`.
pub struct ObjectMatcher {
    gallery: Vec<(i64, Vec<f32>)>,
    max_distance: f32,
}

impl ObjectMatcher {
    pub fn new(gallery: Vec<(i64, Vec<f32>)>, max_distance: f32) -> Self {
        Self { gallery, max_distance }
    }

    fn best_match(&self, query: &[f32]) -> Option<i64> {
        self.gallery
            .iter()
            .map(|(id, feat)| (id, euclidean_distance(query, feat)))
            .filter(|(_, dist)| *dist <= self.max_distance)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| *id)
    }
}

/// Parses the `gallery` pipeline parameter: semicolon-separated
/// `id:f1,f2,f3` entries, the same flat string-param idiom
/// `FeatureExtractor`'s `dims` and `Throttler`'s `fps` use to carry
/// non-string-keyed config through the `HashMap<String, String>`
/// parameters a [`crate::pipeline::OperatorSpec`] supplies. Malformed
/// entries are skipped rather than failing the whole pipeline build.
fn parse_gallery(raw: &str) -> Vec<(i64, Vec<f32>)> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (id_str, feat_str) = entry.split_once(':')?;
            let id: i64 = id_str.trim().parse().ok()?;
            let features: Vec<f32> = feat_str
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            Some((id, features))
        })
        .collect()
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

impl OperatorLogic for ObjectMatcher {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(features) = frame.get::<Vec<Vec<f32>>>(KEY_FEATURES) {
            let ids: Vec<i64> = features
                .iter()
                .map(|f| self.best_match(f).unwrap_or(-1))
                .collect();
            frame.set(KEY_IDS, ids);
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Type alias used only to give `Facenet` and `FaceTracker` their own
/// names in the factory registry, while sharing the rest of this module's
/// substrate behavior with `FeatureExtractor` / `ObjectTracker`.
pub type Facenet = FeatureExtractor;
pub type FaceTracker = BoxTracker;
pub type ObjectTracker = BoxTracker;

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "ObjectDetector",
        Box::new(|name, _params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            Ok(Operator::new(
                name,
                "ObjectDetector",
                &["input"],
                &["output"],
                Box::new(ObjectDetector::new(Box::new(MockDetectorBackend))),
            ))
        }),
    );
    factory.register(
        "ObjectTracker",
        Box::new(|name, _params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            Ok(Operator::new(
                name,
                "ObjectTracker",
                &["input"],
                &["output"],
                Box::new(BoxTracker::new(Box::new(MockTrackerBackend::default()))),
            ))
        }),
    );
    factory.register(
        "FaceTracker",
        Box::new(|name, _params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            Ok(Operator::new(
                name,
                "FaceTracker",
                &["input"],
                &["output"],
                Box::new(BoxTracker::new(Box::new(MockTrackerBackend::default()))),
            ))
        }),
    );
    factory.register(
        "FeatureExtractor",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let dims: usize = params.get("dims").and_then(|v| v.parse().ok()).unwrap_or(128);
            Ok(Operator::new(
                name,
                "FeatureExtractor",
                &["input"],
                &["output"],
                Box::new(FeatureExtractor::new(Box::new(MockEmbeddingBackend::new(dims)))),
            ))
        }),
    );
    factory.register(
        "Facenet",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let dims: usize = params.get("dims").and_then(|v| v.parse().ok()).unwrap_or(128);
            Ok(Operator::new(
                name,
                "Facenet",
                &["input"],
                &["output"],
                Box::new(FeatureExtractor::new(Box::new(MockEmbeddingBackend::new(dims)))),
            ))
        }),
    );
    factory.register(
        "ObjectMatcher",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let max_distance: f32 = params
                .get("max_distance")
                .and_then(|v| v.parse().ok())
                .unwrap_or(f32::MAX);
            let gallery = params
                .get("gallery")
                .map(|raw| parse_gallery(raw))
                .unwrap_or_default();
            if gallery.is_empty() {
                warn!(
                    "ObjectMatcher {name:?} built with an empty gallery (no usable \
                     `gallery` parameter); it will never find a match and `ids` will \
                     always come out as -1"
                );
            }
            Ok(Operator::new(
                name,
                "ObjectMatcher",
                &["input"],
                &["output"],
                Box::new(ObjectMatcher::new(gallery, max_distance)),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tick(logic: &mut dyn OperatorLogic, sinks: &HashMap<String, Arc<crate::stream::Stream>>, frame: Frame) {
        let mut cache = HashMap::new();
        cache.insert("input".to_string(), frame);
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, sinks, false, &mut pushed_stop);
        logic.process(&mut io);
    }

    #[test]
    fn object_detector_attaches_boxes_and_tags() {
        let mut detector = ObjectDetector::new(Box::new(MockDetectorBackend));
        let output = crate::stream::Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);

        let mut f = Frame::new();
        f.set(KEY_IMAGE, ImageMatrix::zeros(10, 10, 3, crate::frame::PixelDepth::U8));
        tick(&mut detector, &sinks, f);

        let out = reader.pop(Some(std::time::Duration::from_millis(5))).unwrap();
        assert_eq!(out.get::<Vec<Rect>>(KEY_BOUNDING_BOXES).unwrap().len(), 1);
        assert_eq!(out.get::<Vec<String>>(KEY_TAGS).unwrap(), vec!["object".to_string()]);
    }

    #[test]
    fn tracker_assigns_one_id_per_box() {
        let mut tracker = BoxTracker::new(Box::new(MockTrackerBackend::default()));
        let output = crate::stream::Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);

        let mut f = Frame::new();
        f.set(KEY_BOUNDING_BOXES, vec![Rect::default(), Rect::default()]);
        tick(&mut tracker, &sinks, f);

        let out = reader.pop(Some(std::time::Duration::from_millis(5))).unwrap();
        assert_eq!(out.get::<Vec<i64>>(KEY_IDS).unwrap().len(), 2);
    }

    #[test]
    fn matcher_rejects_beyond_max_distance() {
        let gallery = vec![(42i64, vec![0.0f32, 0.0])];
        let matcher = ObjectMatcher::new(gallery, 0.5);
        assert_eq!(matcher.best_match(&[0.0, 0.0]), Some(42));
        assert_eq!(matcher.best_match(&[10.0, 10.0]), None);
    }

    #[test]
    fn parse_gallery_reads_id_feature_pairs_from_the_params_string() {
        let parsed = parse_gallery("42:0.0,0.0;7:1.5,2.5,3.5");
        assert_eq!(parsed, vec![(42, vec![0.0, 0.0]), (7, vec![1.5, 2.5, 3.5])]);
    }

    #[test]
    fn parse_gallery_skips_malformed_entries() {
        let parsed = parse_gallery("not-an-entry;42:1.0,2.0;;id-without-colon");
        assert_eq!(parsed, vec![(42, vec![1.0, 2.0])]);
    }

    #[test]
    fn object_matcher_built_through_the_factory_uses_the_gallery_param() {
        let mut factory = OperatorFactory::new();
        register(&mut factory);
        let runtime = Runtime::default();
        let mut params = HashMap::new();
        params.insert("gallery".to_string(), "42:0.0,0.0".to_string());
        params.insert("max_distance".to_string(), "0.5".to_string());
        let op = factory
            .create("m", "ObjectMatcher", &params, &runtime)
            .unwrap();

        let upstream = crate::stream::Stream::new("up");
        op.set_source("input", Arc::clone(&upstream)).unwrap();
        let reader = op.sink("output").unwrap().subscribe(None);
        op.start(4).unwrap();

        let mut f = Frame::new();
        f.set(KEY_FEATURES, vec![vec![0.0f32, 0.0]]);
        upstream.push(f, false);

        let out = reader.pop(Some(std::time::Duration::from_millis(500))).unwrap();
        assert_eq!(out.get::<Vec<i64>>(KEY_IDS).unwrap(), vec![42]);

        upstream.stop();
        op.stop();
    }
}
