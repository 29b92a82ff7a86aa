//! Error taxonomy: one small `thiserror`-derived enum per failure category,
//! each carrying the structured fields (operator/port names, key names,
//! ranges) needed to act on the failure rather than a single closed set of
//! unit variants.

use thiserror::Error;

/// Errors accessing or mutating a [`crate::frame::Frame`]'s fields.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("key missing: {0}")]
    KeyMissing(String),
    #[error("type mismatch for key {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors raised while a [`crate::stream::Stream`] / `StreamReader` is
/// stopped or being torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("operation attempted on a stopped stream or reader")]
    Stopped,
}

/// Configuration errors: unknown camera/model, invalid enum string,
/// out-of-range integer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown camera: {0}")]
    UnknownCamera(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("missing config key: {0}")]
    Missing(String),
    #[error("config key {key} has the wrong type, expected {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Wiring-time errors raised by [`crate::pipeline::Pipeline::build`] and
/// [`crate::operator::Operator::set_source`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WiringError {
    #[error("unknown source port {port:?} on operator {operator:?}")]
    UnknownSource { operator: String, port: String },
    #[error("unknown sink port {port:?} on operator {operator:?}")]
    UnknownSink { operator: String, port: String },
    #[error("source port {port:?} on operator {operator:?} was declared but never bound")]
    UnboundSource { operator: String, port: String },
    #[error("operator kind not registered with the factory: {0}")]
    UnknownKind(String),
    #[error("operator name used more than once: {0}")]
    DuplicateName(String),
    #[error("reference to undefined operator {0:?} in an input binding")]
    UnknownProducer(String),
    #[error("dependency graph contains a cycle involving operator {0:?}")]
    Cycle(String),
}

/// Runtime (I/O, codec, DNN framework) failures. These are
/// almost always surfaced through `Operator::init` returning `false` or
/// through a stop-frame being emitted rather than propagated; the variant
/// exists for the minority of call sites (factory construction, file I/O)
/// that do return a `Result`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("model backend error: {0}")]
    Model(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Top-level union of every error kind this crate can surface through a
/// public `Result`. Internal modules return their specific error type and
/// rely on `#[from]` to fold into this one at the boundaries (pipeline
/// build, operator start, factory construction).
#[derive(Debug, Error)]
pub enum SafError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("operator already started")]
    AlreadyStarted,
    #[error("operator initialisation failed")]
    InitFailed,
}

pub type SafResult<T> = Result<T, SafError>;
