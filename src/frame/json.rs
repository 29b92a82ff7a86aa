//! `Frame` <-> JSON.
//!
//! Two related but distinct JSON needs: a round-trippable `to_json`/`parse`
//! pair, and the on-disk format used by `FrameWriter`, which is bit-exact to
//! a format that is not itself meant to be parsed back (ISO-like
//! timestamps, OpenCV `FileStorage` image JSON, single-key `Rect`/
//! `FaceLandmark` objects). We keep both: [`frame_to_json`] /
//! [`json_to_frame`] are self-describing (`{"t": "...", "v": ...}` per
//! field) and round-trip exactly; [`frame_to_external_json`] renders the
//! write-only format for persistence.

use super::{FaceLandmark, Frame, ImageMatrix, PixelDepth, Rect};
use crate::error::FrameError;
use crate::time::TimePoint;
use serde_json::{json, Map, Value};

pub fn frame_to_json(frame: &Frame) -> Value {
    let mut obj = Map::new();
    for key in frame.field_names() {
        // field_names() only reflects what's present; get<FieldValue> isn't
        // exposed publicly, so re-read through the typed accessors via the
        // type_name dispatch table below.
        let value = frame_field_json(frame, &key);
        obj.insert(key, value);
    }
    Value::Object(obj)
}

fn tagged(t: &str, v: Value) -> Value {
    json!({ "t": t, "v": v })
}

fn frame_field_json(frame: &Frame, key: &str) -> Value {
    // Frame doesn't expose raw FieldValue access outside the crate; walk the
    // closed set via get::<T> attempts, cheapest-first. This mirrors how the
    // original's JSON writer dispatches on `Frame::GetType`.
    macro_rules! try_get {
        ($ty:ty, $tag:literal, $conv:expr) => {
            if let Ok(v) = frame.get::<$ty>(key) {
                return tagged($tag, $conv(v));
            }
        };
    }
    try_get!(i32, "Int32", |v: i32| json!(v));
    try_get!(i64, "Int64", |v: i64| json!(v));
    try_get!(u32, "UInt32", |v: u32| json!(v));
    try_get!(u64, "UInt64", |v: u64| json!(v));
    try_get!(f32, "Float32", |v: f32| json!(v));
    try_get!(f64, "Float64", |v: f64| json!(v));
    try_get!(bool, "Bool", |v: bool| json!(v));
    try_get!(TimePoint, "TimePoint", |v: TimePoint| json!(v.micros_since_epoch()));
    try_get!(std::time::Duration, "Duration", |v: std::time::Duration| json!(v.as_micros() as u64));
    try_get!(String, "Text", |v: String| json!(v));
    try_get!(Vec<u8>, "Bytes", |v: Vec<u8>| json!(v));
    try_get!(ImageMatrix, "Image", |v: ImageMatrix| v.to_opencv_json());
    try_get!(Vec<String>, "VecString", |v: Vec<String>| json!(v));
    try_get!(Vec<f32>, "VecFloat", |v: Vec<f32>| json!(v));
    try_get!(Vec<f64>, "VecDouble", |v: Vec<f64>| json!(v));
    try_get!(Vec<i64>, "VecInt", |v: Vec<i64>| json!(v));
    try_get!(Vec<Rect>, "VecRect", |v: Vec<Rect>| json!(v));
    try_get!(Vec<FaceLandmark>, "VecLandmark", |v: Vec<FaceLandmark>| json!(v));
    try_get!(Vec<Vec<f32>>, "VecFeature", |v: Vec<Vec<f32>>| json!(v));
    try_get!(Vec<Frame>, "VecFrame", |v: Vec<Frame>| Value::Array(
        v.iter().map(frame_to_json).collect()
    ));
    try_get!(std::collections::BTreeMap<i32, f32>, "MapIntFloat", |v: std::collections::BTreeMap<i32, f32>| {
        json!(v.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<std::collections::BTreeMap<_, _>>())
    });
    try_get!(std::collections::BTreeMap<i32, bool>, "MapIntBool", |v: std::collections::BTreeMap<i32, bool>| {
        json!(v.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<std::collections::BTreeMap<_, _>>())
    });
    try_get!(std::collections::BTreeMap<u64, i64>, "MapU64Int", |v: std::collections::BTreeMap<u64, i64>| {
        json!(v.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<std::collections::BTreeMap<_, _>>())
    });
    Value::Null
}

pub fn json_to_frame(value: &Value) -> Result<Frame, FrameError> {
    let obj = value
        .as_object()
        .ok_or_else(|| FrameError::TypeMismatch {
            key: String::new(),
            expected: "object",
            found: "non-object",
        })?;
    let mut frame = Frame::new();
    for (key, tagged_value) in obj {
        let t = tagged_value.get("t").and_then(Value::as_str).unwrap_or_default();
        let v = tagged_value.get("v").cloned().unwrap_or(Value::Null);
        set_tagged_field(&mut frame, key, t, v)?;
    }
    Ok(frame)
}

fn set_tagged_field(frame: &mut Frame, key: &str, t: &str, v: Value) -> Result<(), FrameError> {
    let bad = || FrameError::TypeMismatch {
        key: key.to_string(),
        expected: "matching JSON shape",
        found: "mismatched JSON shape",
    };
    match t {
        "Int32" => frame.set(key, v.as_i64().ok_or_else(bad)? as i32),
        "Int64" => frame.set(key, v.as_i64().ok_or_else(bad)?),
        "UInt32" => frame.set(key, v.as_u64().ok_or_else(bad)? as u32),
        "UInt64" => frame.set(key, v.as_u64().ok_or_else(bad)?),
        "Float32" => frame.set(key, v.as_f64().ok_or_else(bad)? as f32),
        "Float64" => frame.set(key, v.as_f64().ok_or_else(bad)?),
        "Bool" => frame.set(key, v.as_bool().ok_or_else(bad)?),
        "TimePoint" => frame.set(key, TimePoint::new(v.as_u64().ok_or_else(bad)?)),
        "Duration" => frame.set(key, std::time::Duration::from_micros(v.as_u64().ok_or_else(bad)?)),
        "Text" => frame.set(key, v.as_str().ok_or_else(bad)?.to_string()),
        "Bytes" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let bytes: Vec<u8> = arr
                .iter()
                .map(|x| x.as_u64().map(|n| n as u8).ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(key, bytes);
        }
        "VecString" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let vals: Vec<String> = arr
                .iter()
                .map(|x| x.as_str().map(str::to_string).ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(key, vals);
        }
        "VecFloat" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let vals: Vec<f32> = arr
                .iter()
                .map(|x| x.as_f64().map(|n| n as f32).ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(key, vals);
        }
        "VecDouble" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let vals: Vec<f64> = arr
                .iter()
                .map(|x| x.as_f64().ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(key, vals);
        }
        "VecInt" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let vals: Vec<i64> = arr
                .iter()
                .map(|x| x.as_i64().ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(key, vals);
        }
        "VecRect" => {
            let vals: Vec<Rect> = serde_json::from_value(v).map_err(|_| bad())?;
            frame.set(key, vals);
        }
        "VecLandmark" => {
            let vals: Vec<FaceLandmark> = serde_json::from_value(v).map_err(|_| bad())?;
            frame.set(key, vals);
        }
        "VecFeature" => {
            let vals: Vec<Vec<f32>> = serde_json::from_value(v).map_err(|_| bad())?;
            frame.set(key, vals);
        }
        "VecFrame" => {
            let arr = v.as_array().ok_or_else(bad)?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                out.push(json_to_frame(item)?);
            }
            frame.set(key, out);
        }
        "Image" => {
            let rows = v.get("rows").and_then(Value::as_u64).ok_or_else(bad)? as u32;
            let cols = v.get("cols").and_then(Value::as_u64).ok_or_else(bad)? as u32;
            let channels = v.get("channels").and_then(Value::as_u64).ok_or_else(bad)? as u32;
            let depth = match v.get("dt").and_then(Value::as_str).ok_or_else(bad)? {
                "u1" => PixelDepth::U8,
                "f4" => PixelDepth::F32,
                _ => return Err(bad()),
            };
            let data: Vec<u8> = v
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(bad)?
                .iter()
                .map(|x| x.as_u64().map(|n| n as u8).ok_or_else(bad))
                .collect::<Result<_, _>>()?;
            frame.set(
                key,
                ImageMatrix {
                    rows,
                    cols,
                    channels,
                    depth,
                    data,
                },
            );
        }
        "MapIntFloat" => {
            let obj = v.as_object().ok_or_else(bad)?;
            let mut m = std::collections::BTreeMap::new();
            for (k, val) in obj {
                m.insert(k.parse::<i32>().map_err(|_| bad())?, val.as_f64().ok_or_else(bad)? as f32);
            }
            frame.set(key, m);
        }
        "MapIntBool" => {
            let obj = v.as_object().ok_or_else(bad)?;
            let mut m = std::collections::BTreeMap::new();
            for (k, val) in obj {
                m.insert(k.parse::<i32>().map_err(|_| bad())?, val.as_bool().ok_or_else(bad)?);
            }
            frame.set(key, m);
        }
        "MapU64Int" => {
            let obj = v.as_object().ok_or_else(bad)?;
            let mut m = std::collections::BTreeMap::new();
            for (k, val) in obj {
                m.insert(k.parse::<u64>().map_err(|_| bad())?, val.as_i64().ok_or_else(bad)?);
            }
            frame.set(key, m);
        }
        _ => {
            return Err(FrameError::TypeMismatch {
                key: key.to_string(),
                expected: "known field-value tag",
                found: "unrecognized tag",
            });
        }
    }
    Ok(())
}

/// Renders the write-only on-disk representation: numerics as
/// JSON numbers, time points as `"YYYY-Mon-DD HH:MM:SS.uuuuuu"`, byte arrays
/// as arrays of small integers, image matrices as OpenCV `FileStorage` JSON,
/// and `Rect`/`FaceLandmark` as a single-key object naming the type.
pub fn frame_to_external_json(frame: &Frame) -> Value {
    let mut obj = Map::new();
    for key in frame.field_names() {
        obj.insert(key.clone(), external_field_json(frame, &key));
    }
    Value::Object(obj)
}

fn external_field_json(frame: &Frame, key: &str) -> Value {
    macro_rules! try_get {
        ($ty:ty, $conv:expr) => {
            if let Ok(v) = frame.get::<$ty>(key) {
                return $conv(v);
            }
        };
    }
    try_get!(i32, |v: i32| json!(v));
    try_get!(i64, |v: i64| json!(v));
    try_get!(u32, |v: u32| json!(v));
    try_get!(u64, |v: u64| json!(v));
    try_get!(f32, |v: f32| json!(v));
    try_get!(f64, |v: f64| json!(v));
    try_get!(bool, |v: bool| json!(v));
    try_get!(TimePoint, |v: TimePoint| json!(v.to_json_string()));
    try_get!(String, |v: String| json!(v));
    try_get!(Vec<u8>, |v: Vec<u8>| json!(v));
    try_get!(ImageMatrix, |v: ImageMatrix| v.to_opencv_json());
    try_get!(Vec<String>, |v: Vec<String>| json!(v));
    try_get!(Vec<f32>, |v: Vec<f32>| json!(v));
    try_get!(Vec<f64>, |v: Vec<f64>| json!(v));
    try_get!(Vec<i64>, |v: Vec<i64>| json!(v));
    // Each element renders as a single-key object naming its type; the
    // field itself is still a plain JSON array of those.
    try_get!(Vec<Rect>, |v: Vec<Rect>| Value::Array(
        v.iter().map(|r| json!({ "Rect": r })).collect()
    ));
    try_get!(Vec<FaceLandmark>, |v: Vec<FaceLandmark>| Value::Array(
        v.iter().map(|l| json!({ "FaceLandmark": l })).collect()
    ));
    try_get!(Vec<Vec<f32>>, |v: Vec<Vec<f32>>| json!(v));
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars_and_vectors() {
        let mut f = Frame::new();
        f.set("i", 5i32);
        f.set("s", "hi".to_string());
        f.set("b", true);
        f.set("v", vec![1.0f32, 2.0, 3.0]);
        let parsed = Frame::from_json(&f.to_json()).unwrap();
        assert_eq!(parsed.get::<i32>("i").unwrap(), 5);
        assert_eq!(parsed.get::<String>("s").unwrap(), "hi");
        assert!(parsed.get::<bool>("b").unwrap());
        assert_eq!(parsed.get::<Vec<f32>>("v").unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn round_trip_nested_frame() {
        let mut inner = Frame::new();
        inner.set("x", 1i32);
        let mut outer = Frame::new();
        outer.set("children", vec![inner.clone()]);
        let parsed = Frame::from_json(&outer.to_json()).unwrap();
        let children = parsed.get::<Vec<Frame>>("children").unwrap();
        assert_eq!(children[0].get::<i32>("x").unwrap(), 1);
    }

    #[test]
    fn external_json_renders_iso_time() {
        let mut f = Frame::new();
        f.set_capture_time(TimePoint::new(1_700_000_000_000_000));
        let v = frame_to_external_json(&f);
        let s = v.get("capture_time_micros").unwrap().as_str().unwrap();
        assert!(s.contains('-') && s.contains(':'));
    }
}
