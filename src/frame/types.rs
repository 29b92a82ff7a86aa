//! Auxiliary value types carried inside a [`super::FieldValue`]: rectangles,
//! face landmarks and the image matrix, expressed as plain, serializable
//! Rust structs.

use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Five `(x, y)` facial landmark points (eyes, nose, mouth corners), the
/// fixed-size layout face-detection/recognition operators attach.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmark {
    pub points: [(f32, f32); 5],
}

/// Sample element type of an [`ImageMatrix`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelDepth {
    U8,
    F32,
}

impl PixelDepth {
    pub fn bytes_per_element(self) -> usize {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::F32 => 4,
        }
    }
}

/// A dense `rows x cols x channels` image buffer, carrying either 8-bit or
/// 32-bit float samples. Row-major, channel-interleaved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMatrix {
    pub rows: u32,
    pub cols: u32,
    pub channels: u32,
    pub depth: PixelDepth,
    pub data: Vec<u8>,
}

impl ImageMatrix {
    pub fn new_u8(rows: u32, cols: u32, channels: u32, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), (rows * cols * channels) as usize);
        Self {
            rows,
            cols,
            channels,
            depth: PixelDepth::U8,
            data,
        }
    }

    pub fn zeros(rows: u32, cols: u32, channels: u32, depth: PixelDepth) -> Self {
        let len = rows as usize * cols as usize * channels as usize * depth.bytes_per_element();
        Self {
            rows,
            cols,
            channels,
            depth,
            data: vec![0u8; len],
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// OpenCV `FileStorage`-shaped JSON representation used for persisted
    /// `Frame` JSON.
    pub fn to_opencv_json(&self) -> serde_json::Value {
        serde_json::json!({
            "rows": self.rows,
            "cols": self.cols,
            "channels": self.channels,
            "dt": match self.depth { PixelDepth::U8 => "u1", PixelDepth::F32 => "f4" },
            "data": self.data,
        })
    }
}
