//! Filesystem sink operators: [`JpegWriter`],
//! [`FrameWriter`], [`BinaryFileWriter`] and the structured-log
//! [`DbWriter`]. All four share [`OutputLayout`], a flat / by-capture-time
//! / rotating-numbered-directory output scheme.

use crate::context::Runtime;
use crate::error::SafResult;
use crate::factory::OperatorFactory;
use crate::frame::{Frame, ImageMatrix, KEY_ORIGINAL_BYTES};
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a written frame's file lands under `output_dir`.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputLayout {
    /// Flat into `output_dir`.
    Flat,
    /// `YYYY/MM/DD/HH/MM/SS/` subdirectories keyed by capture time.
    ByCaptureTime,
    /// Rotating numbered subdirectories of `frames_per_dir` frames each.
    RotatingDirs { frames_per_dir: u64 },
}

impl OutputLayout {
    pub fn parse(s: &str, frames_per_dir: Option<u64>) -> Self {
        match s {
            "by_capture_time" => OutputLayout::ByCaptureTime,
            "rotating" => OutputLayout::RotatingDirs {
                frames_per_dir: frames_per_dir.unwrap_or(1000),
            },
            _ => OutputLayout::Flat,
        }
    }

    fn directory_for(&self, base: &Path, frame: &Frame, frame_index: u64) -> PathBuf {
        match self {
            OutputLayout::Flat => base.to_path_buf(),
            OutputLayout::ByCaptureTime => {
                let t = frame.capture_time().unwrap_or_default();
                let dt: DateTime<Utc> =
                    DateTime::from_timestamp_micros(t.micros_since_epoch() as i64).unwrap_or_default();
                base.join(dt.format("%Y/%m/%d/%H/%M/%S").to_string())
            }
            OutputLayout::RotatingDirs { frames_per_dir } => {
                let dir_index = frame_index / frames_per_dir.max(&1);
                base.join(dir_index.to_string())
            }
        }
    }
}

fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

fn file_stem(frame: &Frame, frame_index: u64) -> String {
    frame
        .frame_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| frame_index.to_string())
}

/// Persists the `"image"` field as a JPEG file per frame.
/// Without the `jpeg` feature there is no encoder available; frames are
/// written with a `.raw` extension and a warning instead of silently
/// producing invalid JPEG bytes.
pub struct JpegWriter {
    output_dir: PathBuf,
    layout: OutputLayout,
    frame_index: u64,
}

impl JpegWriter {
    pub fn new(output_dir: impl Into<PathBuf>, layout: OutputLayout) -> Self {
        Self {
            output_dir: output_dir.into(),
            layout,
            frame_index: 0,
        }
    }
}

#[cfg(feature = "jpeg")]
fn encode_jpeg(image: &ImageMatrix) -> Result<Vec<u8>, image::ImageError> {
    use image::codecs::jpeg::JpegEncoder;
    use image::ColorType;
    let color = match image.channels {
        1 => ColorType::L8,
        3 => ColorType::Rgb8,
        4 => ColorType::Rgba8,
        _ => ColorType::Rgb8,
    };
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new(&mut out);
    encoder.encode(&image.data, image.cols, image.rows, color)?;
    Ok(out)
}

impl OperatorLogic for JpegWriter {
    fn init(&mut self) -> bool {
        ensure_dir(&self.output_dir).is_ok()
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(image) = frame.get::<ImageMatrix>("image") {
            let dir = self.layout.directory_for(&self.output_dir, &frame, self.frame_index);
            if ensure_dir(&dir).is_ok() {
                #[cfg(feature = "jpeg")]
                {
                    match encode_jpeg(&image) {
                        Ok(bytes) => {
                            let path = dir.join(format!("{}.jpg", file_stem(&frame, self.frame_index)));
                            if let Err(e) = fs::write(&path, bytes) {
                                log::error!("JpegWriter failed to write {path:?}: {e}");
                            }
                        }
                        Err(e) => log::error!("JpegWriter failed to encode frame: {e}"),
                    }
                }
                #[cfg(not(feature = "jpeg"))]
                {
                    log::warn!("JpegWriter built without the `jpeg` feature, writing raw bytes");
                    let path = dir.join(format!("{}.raw", file_stem(&frame, self.frame_index)));
                    if let Err(e) = fs::write(&path, &image.data) {
                        log::error!("JpegWriter failed to write {path:?}: {e}");
                    }
                }
            }
        }
        self.frame_index += 1;
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Persists the whole frame as a UTF-8 JSON document, using the §6
/// external (write-only) JSON representation.
pub struct FrameWriter {
    output_dir: PathBuf,
    layout: OutputLayout,
    frame_index: u64,
}

impl FrameWriter {
    pub fn new(output_dir: impl Into<PathBuf>, layout: OutputLayout) -> Self {
        Self {
            output_dir: output_dir.into(),
            layout,
            frame_index: 0,
        }
    }
}

impl OperatorLogic for FrameWriter {
    fn init(&mut self) -> bool {
        ensure_dir(&self.output_dir).is_ok()
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        let dir = self.layout.directory_for(&self.output_dir, &frame, self.frame_index);
        if ensure_dir(&dir).is_ok() {
            let path = dir.join(format!("{}.json", file_stem(&frame, self.frame_index)));
            let doc = crate::frame::json::frame_to_external_json(&frame);
            match serde_json::to_vec_pretty(&doc) {
                Ok(bytes) => {
                    if let Err(e) = fs::write(&path, bytes) {
                        log::error!("FrameWriter failed to write {path:?}: {e}");
                    }
                }
                Err(e) => log::error!("FrameWriter failed to serialize frame: {e}"),
            }
        }
        self.frame_index += 1;
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Persists the raw byte array serialization of the selected fields
///. Non-byte fields are rendered via
/// their JSON form and UTF-8 encoded, since "raw byte array" only has an
/// unambiguous meaning for `Bytes`/`Image` fields.
pub struct BinaryFileWriter {
    output_dir: PathBuf,
    layout: OutputLayout,
    fields: Vec<String>,
    frame_index: u64,
}

impl BinaryFileWriter {
    pub fn new(output_dir: impl Into<PathBuf>, layout: OutputLayout, fields: Vec<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            layout,
            fields,
            frame_index: 0,
        }
    }

    fn serialize(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::new();
        let keys: Vec<&str> = if self.fields.is_empty() {
            frame.field_names().iter().map(String::as_str).collect::<Vec<_>>().into_iter().collect()
        } else {
            self.fields.iter().map(String::as_str).collect()
        };
        for key in keys {
            if let Ok(bytes) = frame.get::<Vec<u8>>(key) {
                out.extend_from_slice(&bytes);
            } else if let Ok(image) = frame.get::<ImageMatrix>(key) {
                out.extend_from_slice(&image.data);
            }
        }
        out
    }
}

impl OperatorLogic for BinaryFileWriter {
    fn init(&mut self) -> bool {
        ensure_dir(&self.output_dir).is_ok()
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        let dir = self.layout.directory_for(&self.output_dir, &frame, self.frame_index);
        if ensure_dir(&dir).is_ok() {
            let path = dir.join(format!("{}.bin", file_stem(&frame, self.frame_index)));
            let bytes = self.serialize(&frame);
            if let Err(e) = fs::write(&path, bytes) {
                log::error!("BinaryFileWriter failed to write {path:?}: {e}");
            }
        }
        self.frame_index += 1;
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Appends a CSV-like row per frame keyed on `camera_name`, `frame_id`,
/// `tags`, `bounding_boxes`, `ids`, `features`. A real deployment would point this at a database; the
/// contract this crate owns is the row shape, not the storage engine, so a
/// single append-only CSV file stands in for it.
pub struct DbWriter {
    log_path: PathBuf,
    file: Option<std::fs::File>,
}

impl DbWriter {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            file: None,
        }
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

impl OperatorLogic for DbWriter {
    fn init(&mut self) -> bool {
        if let Some(parent) = self.log_path.parent() {
            if ensure_dir(parent).is_err() {
                return false;
            }
        }
        match fs::OpenOptions::new().create(true).append(true).open(&self.log_path) {
            Ok(f) => {
                self.file = Some(f);
                true
            }
            Err(e) => {
                log::error!("DbWriter failed to open {:?}: {e}", self.log_path);
                false
            }
        }
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        let camera_name = frame.get::<String>("camera_name").unwrap_or_default();
        let frame_id = frame.frame_id().unwrap_or(0);
        let tags = frame.get::<Vec<String>>("tags").unwrap_or_default().join(";");
        let bboxes = frame
            .get::<Vec<crate::frame::Rect>>("bounding_boxes")
            .unwrap_or_default()
            .iter()
            .map(|r| format!("{}:{}:{}:{}", r.x, r.y, r.w, r.h))
            .collect::<Vec<_>>()
            .join(";");
        let ids = frame
            .get::<Vec<i64>>("ids")
            .unwrap_or_default()
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(";");
        let num_features = frame.get::<Vec<Vec<f32>>>("features").map(|f| f.len()).unwrap_or(0);

        let row = format!(
            "{},{},{},{},{},{}\n",
            csv_escape(&camera_name),
            frame_id,
            csv_escape(&tags),
            csv_escape(&bboxes),
            csv_escape(&ids),
            num_features,
        );
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(row.as_bytes()) {
                log::error!("DbWriter failed to append row: {e}");
            }
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "JpegWriter",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let output_dir = params.get("output_dir").cloned().unwrap_or_else(|| ".".to_string());
            let layout = OutputLayout::parse(
                params.get("layout").map(String::as_str).unwrap_or("flat"),
                params.get("frames_per_dir").and_then(|v| v.parse().ok()),
            );
            Ok(Operator::new(
                name,
                "JpegWriter",
                &["input"],
                &[],
                Box::new(JpegWriter::new(output_dir, layout)),
            ))
        }),
    );
    factory.register(
        "FrameWriter",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let output_dir = params.get("output_dir").cloned().unwrap_or_else(|| ".".to_string());
            let layout = OutputLayout::parse(
                params.get("layout").map(String::as_str).unwrap_or("flat"),
                params.get("frames_per_dir").and_then(|v| v.parse().ok()),
            );
            Ok(Operator::new(
                name,
                "FrameWriter",
                &["input"],
                &[],
                Box::new(FrameWriter::new(output_dir, layout)),
            ))
        }),
    );
    factory.register(
        "BinaryFileWriter",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let output_dir = params.get("output_dir").cloned().unwrap_or_else(|| ".".to_string());
            let layout = OutputLayout::parse(
                params.get("layout").map(String::as_str).unwrap_or("flat"),
                params.get("frames_per_dir").and_then(|v| v.parse().ok()),
            );
            let fields = params
                .get("fields")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| vec![KEY_ORIGINAL_BYTES.to_string()]);
            Ok(Operator::new(
                name,
                "BinaryFileWriter",
                &["input"],
                &[],
                Box::new(BinaryFileWriter::new(output_dir, layout, fields)),
            ))
        }),
    );
    factory.register(
        "Writer",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let log_path = params
                .get("log_path")
                .cloned()
                .unwrap_or_else(|| "saf_writer.csv".to_string());
            Ok(Operator::new(
                name,
                "Writer",
                &["input"],
                &[],
                Box::new(DbWriter::new(log_path)),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tick(logic: &mut dyn OperatorLogic, frame: Frame) {
        let mut cache = HashMap::new();
        cache.insert("input".to_string(), frame);
        let sinks = HashMap::new();
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, &sinks, false, &mut pushed_stop);
        logic.process(&mut io);
    }

    #[test]
    fn frame_writer_persists_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameWriter::new(dir.path(), OutputLayout::Flat);
        assert!(writer.init());

        let mut f = Frame::new();
        f.set_frame_id(7);
        f.set("x", 1i32);
        tick(&mut writer, f);

        let path = dir.path().join("7.json");
        assert!(path.exists());
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("\"x\""));
    }

    #[test]
    fn binary_file_writer_writes_selected_field_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BinaryFileWriter::new(dir.path(), OutputLayout::Flat, vec![KEY_ORIGINAL_BYTES.to_string()]);
        assert!(writer.init());

        let mut f = Frame::new();
        f.set_frame_id(1);
        f.set(KEY_ORIGINAL_BYTES, vec![1u8, 2, 3]);
        tick(&mut writer, f);

        let path = dir.path().join("1.bin");
        assert_eq!(fs::read(path).unwrap(), vec![1u8, 2, 3]);
    }

    #[test]
    fn db_writer_appends_csv_row() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let mut writer = DbWriter::new(&log_path);
        assert!(writer.init());

        let mut f = Frame::new();
        f.set_frame_id(3);
        f.set("camera_name", "front_door".to_string());
        f.set("tags", vec!["person".to_string()]);
        tick(&mut writer, f);
        let mut stop_io = crate::operator::OperatorOnStopIo::for_test(&HashMap::new(), false);
        writer.on_stop(&mut stop_io);

        let contents = fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("front_door,3,person"));
    }

    #[test]
    fn rotating_layout_groups_by_frame_index() {
        let layout = OutputLayout::RotatingDirs { frames_per_dir: 2 };
        let base = Path::new("/tmp/out");
        let f = Frame::new();
        assert_eq!(layout.directory_for(base, &f, 0), base.join("0"));
        assert_eq!(layout.directory_for(base, &f, 1), base.join("0"));
        assert_eq!(layout.directory_for(base, &f, 2), base.join("1"));
    }
}
