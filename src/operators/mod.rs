//! The built-in operator kinds. Each obeys the [`crate::operator::OperatorLogic`]
//! contract; algorithmic bodies that are an out-of-scope concern (DNN
//! inference, detector/tracker math, codec bindings) sit behind small
//! backend traits with a mock/null default, so the substrate around them
//! is fully exercised without pulling in a real model runtime.

mod buffer;
mod camera;
mod compressor;
mod detection;
mod encoder;
mod flow_control_ops;
mod network;
mod neural_net;
mod throttle;
mod writer;

pub use buffer::Buffer;
pub use camera::{Camera, CameraSource, FakeCameraSource};
pub use compressor::{Compressor, CompressionKind};
pub use detection::{FaceTracker, Facenet, FeatureExtractor, ObjectDetector, ObjectMatcher, ObjectTracker};
pub use encoder::GstVideoEncoder;
pub use flow_control_ops::{FlowControlEntranceOp, FlowControlExitOp};
pub use network::{FramePublisher, FrameSubscriber, Receiver, Sender};
pub use neural_net::{
    ImageClassifier, ImageSegmenter, ImageTransformer, MockModelBackend, ModelBackend, NeuralNetEvaluator, Rotation,
};
pub use throttle::{Strider, Throttler};
pub use writer::{BinaryFileWriter, DbWriter, FrameWriter, JpegWriter};

use crate::factory::OperatorFactory;

/// Registers every built-in kind under the string name the pipeline-spec
/// JSON uses for `operator_type`.
pub fn register_all(factory: &mut OperatorFactory) {
    camera::register(factory);
    neural_net::register(factory);
    detection::register(factory);
    throttle::register(factory);
    buffer::register(factory);
    compressor::register(factory);
    writer::register(factory);
    network::register(factory);
    encoder::register(factory);
    flow_control_ops::register(factory);
}
