//! Camera: the pipeline's only source operator.
//! Produces frames carrying the raw captured bytes, a monotonic
//! `frame_id`, and `capture_time_micros`. Restartable on end-of-stream.
//!
//! Camera-driver bindings (GStreamer, PtGrey, Vimba) are explicitly out of
//! scope; [`CameraSource`] is the seam a real binding would implement.
//! [`FakeCameraSource`] is the only implementation this crate ships, a
//! deterministic synthetic-frame generator for tests and demos.

use crate::context::Runtime;
use crate::error::SafResult;
use crate::factory::OperatorFactory;
use crate::frame::{Frame, KEY_ORIGINAL_BYTES};
use crate::operator::{Operator, OperatorIo, OperatorLogic};
use crate::time::TimePoint;
use std::time::Duration;

/// The out-of-scope seam for a real video source. `read_frame` returns
/// `None` at end-of-stream; [`Camera`] either restarts it or emits a stop
/// frame, per the `restart_on_eof` policy.
pub trait CameraSource: Send {
    fn read_frame(&mut self) -> Option<Vec<u8>>;
    fn restart(&mut self);
}

/// A deterministic, in-process stand-in for a real camera: emits solid
/// zeroed `width * height * channels`-byte buffers, optionally exhausting
/// after `max_frames`.
pub struct FakeCameraSource {
    width: u32,
    height: u32,
    channels: u32,
    max_frames: Option<u64>,
    emitted: u64,
}

impl FakeCameraSource {
    pub fn new(width: u32, height: u32, channels: u32, max_frames: Option<u64>) -> Self {
        Self {
            width,
            height,
            channels,
            max_frames,
            emitted: 0,
        }
    }
}

impl CameraSource for FakeCameraSource {
    fn read_frame(&mut self) -> Option<Vec<u8>> {
        if let Some(max) = self.max_frames {
            if self.emitted >= max {
                return None;
            }
        }
        self.emitted += 1;
        Some(vec![0u8; (self.width * self.height * self.channels) as usize])
    }

    fn restart(&mut self) {
        self.emitted = 0;
    }
}

pub struct Camera {
    name: String,
    source: Box<dyn CameraSource>,
    frame_interval: Duration,
    restart_on_eof: bool,
    next_frame_id: u64,
}

impl Camera {
    pub fn new(name: impl Into<String>, source: Box<dyn CameraSource>, fps: f64, restart_on_eof: bool) -> Self {
        let interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self {
            name: name.into(),
            source,
            frame_interval: interval,
            restart_on_eof,
            next_frame_id: 0,
        }
    }
}

impl OperatorLogic for Camera {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        match self.source.read_frame() {
            Some(bytes) => {
                if !self.frame_interval.is_zero() {
                    std::thread::sleep(self.frame_interval);
                }
                let mut frame = Frame::new();
                frame.set_frame_id(self.next_frame_id);
                self.next_frame_id += 1;
                frame.set_capture_time(TimePoint::now());
                frame.set("camera_name", self.name.clone());
                frame.set(KEY_ORIGINAL_BYTES, bytes);
                io.push_frame("output", frame);
            }
            None => {
                if self.restart_on_eof {
                    self.source.restart();
                } else {
                    let mut stop = Frame::new();
                    stop.set_stop_frame(true);
                    io.push_frame("output", stop);
                }
            }
        }
    }

    fn on_stop(&mut self, _io: &mut crate::operator::OperatorOnStopIo<'_>) -> bool {
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "Camera",
        Box::new(|name, params, runtime: &Runtime| -> SafResult<std::sync::Arc<Operator>> {
            let camera_name = params.get("camera").cloned().unwrap_or_else(|| name.to_string());
            let (width, height, restart_on_eof) = match runtime.cameras.camera(&camera_name) {
                Ok(desc) => (desc.width, desc.height, desc.restart_on_eof),
                Err(_) => (640, 480, false),
            };
            let fps: f64 = params
                .get("fps")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30.0);
            let source = Box::new(FakeCameraSource::new(width, height, 3, None));
            Ok(Operator::new(
                name,
                "Camera",
                &[],
                &["output"],
                Box::new(Camera::new(camera_name, source, fps, restart_on_eof)),
            ))
        }),
    );
}
