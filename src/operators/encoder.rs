//! [`GstVideoEncoder`]: encodes the `"image"` field to
//! H.264, either to a file or over UDP, forwarding the frame unchanged.
//! A real encoder feeds one image per `process` call into an
//! `appsrc ! videoconvert ! x264enc ! ...` pipeline; the GStreamer binding
//! itself is out of scope, so [`VideoEncoderBackend`] is the seam a real
//! pipeline would implement.

use crate::context::Runtime;
use crate::error::{RuntimeError, SafResult};
use crate::factory::OperatorFactory;
use crate::frame::ImageMatrix;
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use std::sync::Arc;

/// Where encoded output goes: a file path, or a UDP port on localhost.
#[derive(Clone, Debug, PartialEq)]
pub enum EncodeSink {
    File(String),
    Udp(u16),
}

/// The out-of-scope GStreamer pipeline seam. `write_frame` is
/// called once per image in arrival order; `finish` tears the pipeline down
/// (EOS + state change in the real binding).
pub trait VideoEncoderBackend: Send {
    fn write_frame(&mut self, image: &ImageMatrix) -> Result<(), RuntimeError>;
    fn finish(&mut self) -> Result<(), RuntimeError>;
}

/// Deterministic stand-in used without the `gstreamer` feature: appends raw
/// frame bytes to the target file (ignored, for `EncodeSink::Udp`) so the
/// operator's pass-through contract is exercised without a real codec.
pub struct RawAppendBackend {
    file: Option<std::fs::File>,
}

impl RawAppendBackend {
    pub fn new(sink: &EncodeSink) -> Self {
        let file = match sink {
            EncodeSink::File(path) => std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok(),
            EncodeSink::Udp(_) => None,
        };
        Self { file }
    }
}

impl VideoEncoderBackend for RawAppendBackend {
    fn write_frame(&mut self, image: &ImageMatrix) -> Result<(), RuntimeError> {
        if let Some(file) = self.file.as_mut() {
            use std::io::Write;
            file.write_all(&image.data).map_err(RuntimeError::Io)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RuntimeError> {
        if let Some(file) = self.file.as_mut() {
            use std::io::Write;
            file.flush().map_err(RuntimeError::Io)?;
        }
        Ok(())
    }
}

/// Real GStreamer-backed encoder, enabled by the `gstreamer` feature:
/// feeds each image through an `appsrc ! videoconvert ! x264enc ! ...`
/// pipeline to either a file sink (`EncodeSink::File`) or a UDP sink
/// (`EncodeSink::Udp`), in place of the `RawAppendBackend` stand-in above.
#[cfg(feature = "gstreamer")]
mod gst_backend {
    use super::{EncodeSink, VideoEncoderBackend};
    use crate::error::RuntimeError;
    use crate::frame::{ImageMatrix, PixelDepth};
    use gstreamer::prelude::*;
    use gstreamer_app::AppSrc;

    pub struct GstBackend {
        pipeline: gstreamer::Pipeline,
        appsrc: AppSrc,
    }

    impl GstBackend {
        pub fn new(sink: &EncodeSink, width: u32, height: u32) -> Result<Self, RuntimeError> {
            gstreamer::init().map_err(|e| RuntimeError::Codec(e.to_string()))?;
            let sink_desc = match sink {
                EncodeSink::File(path) => format!("mp4mux ! filesink location={path}"),
                EncodeSink::Udp(port) => format!("rtph264pay ! udpsink host=127.0.0.1 port={port}"),
            };
            let desc = format!(
                "appsrc name=src format=time ! videoconvert ! x264enc tune=zerolatency \
                 ! {sink_desc}"
            );
            let pipeline = gstreamer::parse::launch(&desc)
                .map_err(|e| RuntimeError::Codec(e.to_string()))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| RuntimeError::Codec("pipeline downcast failed".to_string()))?;
            let appsrc = pipeline
                .by_name("src")
                .and_then(|e| e.downcast::<AppSrc>().ok())
                .ok_or_else(|| RuntimeError::Codec("appsrc element missing".to_string()))?;
            let caps = gstreamer::Caps::builder("video/x-raw")
                .field("format", "BGR")
                .field("width", width as i32)
                .field("height", height as i32)
                .build();
            appsrc.set_caps(Some(&caps));
            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| RuntimeError::Codec(e.to_string()))?;
            Ok(Self { pipeline, appsrc })
        }
    }

    impl VideoEncoderBackend for GstBackend {
        fn write_frame(&mut self, image: &ImageMatrix) -> Result<(), RuntimeError> {
            if image.depth != PixelDepth::U8 {
                return Err(RuntimeError::Codec(
                    "GstVideoEncoder requires 8-bit image samples".to_string(),
                ));
            }
            let buffer = gstreamer::Buffer::from_slice(image.data.clone());
            self.appsrc
                .push_buffer(buffer)
                .map_err(|e| RuntimeError::Codec(format!("appsrc push_buffer failed: {e:?}")))?;
            Ok(())
        }

        fn finish(&mut self) -> Result<(), RuntimeError> {
            let _ = self.appsrc.end_of_stream();
            self.pipeline
                .set_state(gstreamer::State::Null)
                .map_err(|e| RuntimeError::Codec(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(feature = "gstreamer")]
pub use gst_backend::GstBackend;

/// Encodes `image_key`'s image per frame and forwards the frame unchanged.
pub struct GstVideoEncoder {
    image_key: String,
    backend: Box<dyn VideoEncoderBackend>,
}

impl GstVideoEncoder {
    pub fn new(image_key: impl Into<String>, backend: Box<dyn VideoEncoderBackend>) -> Self {
        Self {
            image_key: image_key.into(),
            backend,
        }
    }
}

impl OperatorLogic for GstVideoEncoder {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(image) = frame.get::<ImageMatrix>(&self.image_key) {
            if let Err(e) = self.backend.write_frame(&image) {
                log::error!("GstVideoEncoder failed to write frame: {e}");
            }
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        if let Err(e) = self.backend.finish() {
            log::error!("GstVideoEncoder failed to finish: {e}");
            return false;
        }
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "GstVideoEncoder",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let image_key = params.get("image_key").cloned().unwrap_or_else(|| "image".to_string());
            let sink = match params.get("udp_port").and_then(|v| v.parse().ok()) {
                Some(port) => EncodeSink::Udp(port),
                None => EncodeSink::File(
                    params
                        .get("output_path")
                        .cloned()
                        .unwrap_or_else(|| "output.mp4".to_string()),
                ),
            };
            let backend: Box<dyn VideoEncoderBackend> = {
                #[cfg(feature = "gstreamer")]
                {
                    let width: u32 = params.get("width").and_then(|v| v.parse().ok()).unwrap_or(640);
                    let height: u32 = params.get("height").and_then(|v| v.parse().ok()).unwrap_or(480);
                    match gst_backend::GstBackend::new(&sink, width, height) {
                        Ok(b) => Box::new(b),
                        Err(e) => {
                            log::warn!("GstVideoEncoder falling back to raw append backend: {e}");
                            Box::new(RawAppendBackend::new(&sink))
                        }
                    }
                }
                #[cfg(not(feature = "gstreamer"))]
                {
                    Box::new(RawAppendBackend::new(&sink))
                }
            };
            Ok(Operator::new(
                name,
                "GstVideoEncoder",
                &["input"],
                &["output"],
                Box::new(GstVideoEncoder::new(image_key, backend)),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelDepth};
    use std::collections::HashMap;

    #[test]
    fn forwards_frame_unchanged_after_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let backend = Box::new(RawAppendBackend::new(&EncodeSink::File(path.to_string_lossy().into_owned())));
        let mut encoder = GstVideoEncoder::new("image", backend);

        let output = crate::stream::Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);

        let mut f = Frame::new();
        f.set_frame_id(1);
        f.set("image", ImageMatrix::zeros(2, 2, 3, PixelDepth::U8));
        let mut cache = HashMap::new();
        cache.insert("input".to_string(), f);
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, &sinks, false, &mut pushed_stop);
        encoder.process(&mut io);

        let out = reader.pop(Some(std::time::Duration::from_millis(5))).unwrap();
        assert_eq!(out.frame_id(), Some(1));
        assert!(path.exists());
    }
}
