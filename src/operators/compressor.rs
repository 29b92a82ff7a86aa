//! [`Compressor`]: compresses `original_bytes` with BZIP2 or GZIP and
//! attaches the result plus a type tag. Runs synchronously inside
//! `process` rather than handing work to a second worker thread, since
//! `Operator` already gives every instance its own; a second thread per
//! operator would only add contention, not parallelism.

use crate::context::Runtime;
use crate::error::{RuntimeError, SafResult};
use crate::factory::OperatorFactory;
use crate::frame::KEY_ORIGINAL_BYTES;
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use std::sync::Arc;

pub const KEY_COMPRESSED_BYTES: &str = "compressed_bytes";
pub const KEY_COMPRESSION_TYPE: &str = "compression_type";

/// The codec a [`Compressor`] applies to `original_bytes`, minus a `NONE`
/// case (modeled instead by simply not instantiating a `Compressor`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    Bzip2,
    Gzip,
}

impl CompressionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionKind::Bzip2 => "bzip2",
            CompressionKind::Gzip => "gzip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bzip2" | "bz2" => Some(CompressionKind::Bzip2),
            "gzip" | "gz" => Some(CompressionKind::Gzip),
            _ => None,
        }
    }
}

pub struct Compressor {
    kind: CompressionKind,
}

impl Compressor {
    pub fn new(kind: CompressionKind) -> Self {
        Self { kind }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        compress_bytes(self.kind, data)
    }
}

#[cfg(feature = "compression")]
fn compress_bytes(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    use std::io::Write;
    match kind {
        CompressionKind::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| RuntimeError::Codec(e.to_string()))?;
            encoder.finish().map_err(|e| RuntimeError::Codec(e.to_string()))
        }
        CompressionKind::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| RuntimeError::Codec(e.to_string()))?;
            encoder.finish().map_err(|e| RuntimeError::Codec(e.to_string()))
        }
    }
}

#[cfg(not(feature = "compression"))]
fn compress_bytes(_kind: CompressionKind, _data: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    Err(RuntimeError::Codec(
        "crate built without the `compression` feature".to_string(),
    ))
}

impl OperatorLogic for Compressor {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        if let Ok(bytes) = frame.get::<Vec<u8>>(KEY_ORIGINAL_BYTES) {
            match self.compress(&bytes) {
                Ok(compressed) => {
                    frame.set(KEY_COMPRESSED_BYTES, compressed);
                    frame.set(KEY_COMPRESSION_TYPE, self.kind.as_str().to_string());
                }
                Err(e) => {
                    log::error!("Compressor failed to compress frame: {e}");
                }
            }
        }
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "Compressor",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let kind = params
                .get("type")
                .and_then(|v| CompressionKind::parse(v))
                .unwrap_or(CompressionKind::Gzip);
            Ok(Operator::new(
                name,
                "Compressor",
                &["input"],
                &["output"],
                Box::new(Compressor::new(kind)),
            ))
        }),
    );
}
