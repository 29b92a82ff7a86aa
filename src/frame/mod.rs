//! The [`Frame`] data model.
//!
//! A `Frame` is a typed, extensible bag of named fields flowing through the
//! pipeline. The variant set is closed (a Rust `enum`) but extensible by
//! adding a case — a sum type with a generic `get<T>` that pattern-matches,
//! rather than a runtime-tagged union with an unchecked cast.

mod json;
mod types;

pub use types::{FaceLandmark, ImageMatrix, PixelDepth, Rect};

use crate::error::FrameError;
use crate::flow_control::FlowControlToken;
use crate::time::TimePoint;
use std::collections::BTreeMap;

pub(crate) const KEY_FRAME_ID: &str = "frame_id";
pub(crate) const KEY_CAPTURE_TIME: &str = "capture_time_micros";
pub(crate) const KEY_STOP_FRAME: &str = "stop_frame";
pub(crate) const KEY_ORIGINAL_BYTES: &str = "original_bytes";

/// The closed set of value variants a [`Frame`] field can hold: the
/// numeric widths, image matrices, vector and dictionary variants a
/// real-time analytics pipeline's frames need.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    TimePoint(TimePoint),
    Duration(std::time::Duration),
    Text(String),
    Bytes(Vec<u8>),
    Image(ImageMatrix),
    VecString(Vec<String>),
    VecFloat(Vec<f32>),
    VecDouble(Vec<f64>),
    VecInt(Vec<i64>),
    VecRect(Vec<Rect>),
    VecLandmark(Vec<FaceLandmark>),
    VecFeature(Vec<Vec<f32>>),
    VecFrame(Vec<Frame>),
    MapIntFloat(BTreeMap<i32, f32>),
    MapIntBool(BTreeMap<i32, bool>),
    MapU64Int(BTreeMap<u64, i64>),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Int32(_) => "Int32",
            FieldValue::Int64(_) => "Int64",
            FieldValue::UInt32(_) => "UInt32",
            FieldValue::UInt64(_) => "UInt64",
            FieldValue::Float32(_) => "Float32",
            FieldValue::Float64(_) => "Float64",
            FieldValue::Bool(_) => "Bool",
            FieldValue::TimePoint(_) => "TimePoint",
            FieldValue::Duration(_) => "Duration",
            FieldValue::Text(_) => "Text",
            FieldValue::Bytes(_) => "Bytes",
            FieldValue::Image(_) => "Image",
            FieldValue::VecString(_) => "VecString",
            FieldValue::VecFloat(_) => "VecFloat",
            FieldValue::VecDouble(_) => "VecDouble",
            FieldValue::VecInt(_) => "VecInt",
            FieldValue::VecRect(_) => "VecRect",
            FieldValue::VecLandmark(_) => "VecLandmark",
            FieldValue::VecFeature(_) => "VecFeature",
            FieldValue::VecFrame(_) => "VecFrame",
            FieldValue::MapIntFloat(_) => "MapIntFloat",
            FieldValue::MapIntBool(_) => "MapIntBool",
            FieldValue::MapU64Int(_) => "MapU64Int",
        }
    }

    /// Approximate byte size, used by [`Frame::raw_size_bytes`].
    pub fn raw_size_bytes(&self) -> usize {
        match self {
            FieldValue::Int32(_) => 4,
            FieldValue::Int64(_) => 8,
            FieldValue::UInt32(_) => 4,
            FieldValue::UInt64(_) => 8,
            FieldValue::Float32(_) => 4,
            FieldValue::Float64(_) => 8,
            FieldValue::Bool(_) => 1,
            FieldValue::TimePoint(_) => 8,
            FieldValue::Duration(_) => 16,
            FieldValue::Text(s) => s.len(),
            FieldValue::Bytes(b) => b.len(),
            FieldValue::Image(m) => m.byte_len(),
            FieldValue::VecString(v) => v.iter().map(|s| s.len()).sum(),
            FieldValue::VecFloat(v) => v.len() * 4,
            FieldValue::VecDouble(v) => v.len() * 8,
            FieldValue::VecInt(v) => v.len() * 8,
            FieldValue::VecRect(v) => v.len() * std::mem::size_of::<Rect>(),
            FieldValue::VecLandmark(v) => v.len() * std::mem::size_of::<FaceLandmark>(),
            FieldValue::VecFeature(v) => v.iter().map(|f| f.len() * 4).sum(),
            FieldValue::VecFrame(v) => v.iter().map(|f| f.raw_size_bytes(&[])).sum(),
            FieldValue::MapIntFloat(m) => m.len() * 8,
            FieldValue::MapIntBool(m) => m.len() * 5,
            FieldValue::MapU64Int(m) => m.len() * 16,
        }
    }
}

/// Implemented for every Rust type that can be stored in / read out of a
/// [`Frame`] field. `set` takes `impl Into<FieldValue>`, `get<T>` requires
/// `T: TryFrom<FieldValue>`. Implemented via macro below for every case in
/// [`FieldValue`].
macro_rules! field_value_conversions {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> FieldValue {
                    FieldValue::$variant(v)
                }
            }

            impl TryFrom<FieldValue> for $ty {
                type Error = FieldValue;
                fn try_from(v: FieldValue) -> Result<$ty, FieldValue> {
                    match v {
                        FieldValue::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )+
    };
}

field_value_conversions! {
    Int32 => i32,
    Int64 => i64,
    UInt32 => u32,
    UInt64 => u64,
    Float32 => f32,
    Float64 => f64,
    Bool => bool,
    TimePoint => TimePoint,
    Duration => std::time::Duration,
    Text => String,
    Bytes => Vec<u8>,
    Image => ImageMatrix,
    VecString => Vec<String>,
    VecFloat => Vec<f32>,
    VecDouble => Vec<f64>,
    VecInt => Vec<i64>,
    VecRect => Vec<Rect>,
    VecLandmark => Vec<FaceLandmark>,
    VecFeature => Vec<Vec<f32>>,
    VecFrame => Vec<Frame>,
    MapIntFloat => BTreeMap<i32, f32>,
    MapIntBool => BTreeMap<i32, bool>,
    MapU64Int => BTreeMap<u64, i64>,
}

/// A typed, extensible record carrying payload and metadata between
/// operators. Keys are unique; `set` overwrites.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    fields: BTreeMap<String, FieldValue>,
    pub(crate) token: Option<FlowControlToken>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Returns `key` by value. `KeyMissing` if absent, `TypeMismatch` if the
    /// stored variant does not hold `T`.
    pub fn get<T>(&self, key: &str) -> Result<T, FrameError>
    where
        T: TryFrom<FieldValue, Error = FieldValue>,
        FieldValueTypeName<T>: TypeNamed,
    {
        let stored = self
            .fields
            .get(key)
            .cloned()
            .ok_or_else(|| FrameError::KeyMissing(key.to_string()))?;
        let found = stored.type_name();
        T::try_from(stored).map_err(|_| FrameError::TypeMismatch {
            key: key.to_string(),
            expected: FieldValueTypeName::<T>::name(),
            found,
        })
    }

    /// Membership test; never fails.
    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Erases `key` if present; no-op otherwise.
    pub fn delete(&mut self, key: &str) {
        self.fields.remove(key);
    }

    pub fn set_stop_frame(&mut self, stop: bool) {
        self.set(KEY_STOP_FRAME, stop);
    }

    pub fn is_stop_frame(&self) -> bool {
        self.get::<bool>(KEY_STOP_FRAME).unwrap_or(false)
    }

    pub fn set_frame_id(&mut self, id: u64) {
        self.set(KEY_FRAME_ID, id);
    }

    pub fn frame_id(&self) -> Option<u64> {
        self.get::<u64>(KEY_FRAME_ID).ok()
    }

    pub fn set_capture_time(&mut self, t: TimePoint) {
        self.set(KEY_CAPTURE_TIME, t);
    }

    pub fn capture_time(&self) -> Option<TimePoint> {
        self.get::<TimePoint>(KEY_CAPTURE_TIME).ok()
    }

    /// Approximate byte size of the listed fields; empty ⇒ all fields.
    pub fn raw_size_bytes(&self, fields: &[&str]) -> usize {
        if fields.is_empty() {
            self.fields.values().map(FieldValue::raw_size_bytes).sum()
        } else {
            fields
                .iter()
                .filter_map(|k| self.fields.get(*k))
                .map(FieldValue::raw_size_bytes)
                .sum()
        }
    }

    /// Deep copy restricted to the named fields; empty ⇒ all fields.
    /// `original_bytes` is always deep-copied along with everything else —
    /// it is a `Vec<u8>`, and cloning it already allocates a fresh buffer,
    /// so no special case is needed to avoid aliasing the large payload.
    pub fn clone_with(&self, fields: &[&str]) -> Frame {
        if fields.is_empty() {
            return self.clone();
        }
        let mut out = Frame::new();
        for key in fields {
            if let Some(v) = self.fields.get(*key) {
                out.fields.insert(key.to_string(), v.clone());
            }
        }
        out.token = self.token.clone();
        out
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json::frame_to_json(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Frame, FrameError> {
        json::json_to_frame(value)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Stamps this frame with a flow-control back-reference. Called only by
    /// `FlowControlEntrance::admit`.
    pub(crate) fn stamp_token(&mut self, token: FlowControlToken) {
        self.token = Some(token);
    }

    /// Removes and returns this frame's flow-control token, if any. Called
    /// by `FlowControlExit::pass` and by any operator that releases tokens
    /// on behalf of frames it drops (e.g. `Throttler`).
    pub fn take_token(&mut self) -> Option<FlowControlToken> {
        self.token.take()
    }
}

/// Helper used by [`Frame::get`] to report the expected type name in a
/// `TypeMismatch` without requiring every `T` to implement a separate named
/// trait at the call site.
pub struct FieldValueTypeName<T>(std::marker::PhantomData<T>);
pub trait TypeNamed {
    fn name() -> &'static str;
}

macro_rules! type_named {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl TypeNamed for FieldValueTypeName<$ty> {
                fn name() -> &'static str { $name }
            }
        )+
    };
}

type_named! {
    i32 => "Int32",
    i64 => "Int64",
    u32 => "UInt32",
    u64 => "UInt64",
    f32 => "Float32",
    f64 => "Float64",
    bool => "Bool",
    TimePoint => "TimePoint",
    std::time::Duration => "Duration",
    String => "Text",
    Vec<u8> => "Bytes",
    ImageMatrix => "Image",
    Vec<String> => "VecString",
    Vec<f32> => "VecFloat",
    Vec<f64> => "VecDouble",
    Vec<i64> => "VecInt",
    Vec<Rect> => "VecRect",
    Vec<FaceLandmark> => "VecLandmark",
    Vec<Vec<f32>> => "VecFeature",
    Vec<Frame> => "VecFrame",
    BTreeMap<i32, f32> => "MapIntFloat",
    BTreeMap<i32, bool> => "MapIntBool",
    BTreeMap<u64, i64> => "MapU64Int",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_has_is_total() {
        let mut f = Frame::new();
        assert!(!f.has("x"));
        f.set("x", 1i32);
        assert!(f.has("x"));
        f.set("x", 2i32);
        assert_eq!(f.get::<i32>("x").unwrap(), 2);
    }

    #[test]
    fn get_missing_key_errors() {
        let f = Frame::new();
        assert_eq!(f.get::<i32>("nope"), Err(FrameError::KeyMissing("nope".into())));
    }

    #[test]
    fn get_wrong_type_errors() {
        let mut f = Frame::new();
        f.set("x", "hello".to_string());
        let err = f.get::<i32>("x").unwrap_err();
        match err {
            FrameError::TypeMismatch { expected, found, .. } => {
                assert_eq!(expected, "Int32");
                assert_eq!(found, "Text");
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn delete_is_noop_when_absent() {
        let mut f = Frame::new();
        f.delete("nope");
        assert!(!f.has("nope"));
    }

    #[test]
    fn stop_frame_sugar_round_trips() {
        let mut f = Frame::new();
        assert!(!f.is_stop_frame());
        f.set_stop_frame(true);
        assert!(f.is_stop_frame());
    }

    #[test]
    fn clone_with_restricts_fields_and_is_independent() {
        let mut f = Frame::new();
        f.set("a", 1i32);
        f.set("b", 2i32);
        let mut clone = f.clone_with(&["a"]);
        assert_eq!(clone.field_names(), vec!["a".to_string()]);
        clone.set("a", 99i32);
        assert_eq!(f.get::<i32>("a").unwrap(), 1);
    }

    #[test]
    fn clone_with_empty_selector_clones_everything() {
        let mut f = Frame::new();
        f.set("a", 1i32);
        f.set("b", 2i32);
        let clone = f.clone_with(&[]);
        assert_eq!(clone.field_names().len(), 2);
    }

    #[test]
    fn raw_size_bytes_sums_selected_fields_only() {
        let mut f = Frame::new();
        f.set("bytes", vec![0u8; 100]);
        f.set("n", 5i32);
        assert_eq!(f.raw_size_bytes(&["bytes"]), 100);
        assert_eq!(f.raw_size_bytes(&[]), 104);
    }
}
