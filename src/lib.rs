//! `camflow`: the pipeline substrate for a streaming analytics framework —
//! the frame data model, the stream/reader pub-sub primitive, the operator
//! execution loop, the topology construction and lifecycle orchestrator,
//! and the end-to-end flow-control (token) mechanism.
//!
//! Algorithmic bodies of specific operators (DNN inference, codec
//! bindings, detector/tracker math, camera-driver bindings, GPU
//! acceleration, wire formats) are out of scope: operators that need one
//! of these reach it through a small backend trait (e.g.
//! [`operators::ModelBackend`], [`operators::CameraSource`]) with a
//! mock/null default, so the substrate is fully exercised without pulling
//! in a real model runtime, codec library, or camera driver.
//!
//! ```text
//!        Camera --> ImageTransformer --> NeuralNetEvaluator --> ImageClassifier --> JpegWriter
//! ```
//! is a `Pipeline` built either programmatically (wiring [`operator::Operator`]s
//! directly) or from a JSON [`pipeline::PipelineSpec`] via [`factory::OperatorFactory`].

pub mod context;
pub mod error;
pub mod factory;
pub mod flow_control;
pub mod frame;
pub mod operator;
pub mod operators;
pub mod pipeline;
pub mod stream;
pub mod time;

pub use context::Runtime;
pub use error::{SafError, SafResult};
pub use factory::OperatorFactory;
pub use frame::Frame;
pub use operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
pub use pipeline::{OperatorSpec, Pipeline, PipelineSpec};
pub use stream::{Stream, StreamReader};
