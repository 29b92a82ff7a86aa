//! Dependency-injection root for process-wide configuration: device and
//! camera/model catalogs, normally passed around as process-wide
//! singletons. Here they are bundled into [`Runtime`], an explicit value
//! constructed once and threaded into `Pipeline::build` and the operator
//! factory; [`Runtime::global`] / [`Runtime::set_global`] are kept only as
//! an opt-in convenience for callers that prefer ambient access.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A single configuration value, as loaded from a `saf.toml`-shaped
/// document.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Process-wide string-keyed configuration.
#[derive(Clone, Debug, Default)]
pub struct Context {
    values: HashMap<String, ConfigValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: HashMap<String, ConfigValue>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.values.get(key) {
            Some(ConfigValue::Str(s)) => Ok(s.as_str()),
            Some(_) => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
            None => Err(ConfigError::Missing(key.to_string())),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ConfigError> {
        match self.values.get(key) {
            Some(ConfigValue::Int(n)) => Ok(*n),
            Some(_) => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "integer",
            }),
            None => Err(ConfigError::Missing(key.to_string())),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.values.get(key) {
            Some(ConfigValue::Bool(b)) => Ok(*b),
            Some(_) => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "bool",
            }),
            None => Err(ConfigError::Missing(key.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ContextDoc {
    #[serde(default)]
    context: HashMap<String, ConfigValue>,
}

impl Context {
    /// Loads a `saf.toml`-shaped document, e.g.:
    ///
    /// ```toml
    /// [context]
    /// device_index = 0
    /// encoder_element = "x264enc"
    /// ```
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let doc: ContextDoc = toml::from_str(contents).map_err(|e| ConfigError::InvalidValue {
            key: "saf.toml".to_string(),
            value: e.to_string(),
        })?;
        Ok(Self::from_values(doc.context))
    }
}

/// One entry of `cameras.toml`.
#[derive(Clone, Debug, Deserialize)]
pub struct CameraDescriptor {
    pub name: String,
    pub video_uri: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub restart_on_eof: bool,
}

fn default_dimension() -> u32 {
    640
}

fn default_buffer_size() -> usize {
    16
}

#[derive(Clone, Debug, Default, Deserialize)]
struct CamerasDoc {
    #[serde(default)]
    cameras: Vec<CameraDescriptor>,
}

/// Declared cameras, loaded once from `cameras.toml`.
#[derive(Clone, Debug, Default)]
pub struct CameraManager {
    cameras: HashMap<String, CameraDescriptor>,
}

impl CameraManager {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let doc: CamerasDoc = toml::from_str(contents)
            .map_err(|e| ConfigError::InvalidValue {
                key: "cameras.toml".to_string(),
                value: e.to_string(),
            })?;
        let cameras = doc.cameras.into_iter().map(|c| (c.name.clone(), c)).collect();
        Ok(Self { cameras })
    }

    pub fn camera(&self, name: &str) -> Result<&CameraDescriptor, ConfigError> {
        self.cameras
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCamera(name.to_string()))
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &str> {
        self.cameras.keys().map(String::as_str)
    }
}

/// One entry of `models.toml`.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub model_type: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub input_shape: Vec<u32>,
    #[serde(default = "default_input_layer")]
    pub default_input_layer: String,
    #[serde(default = "default_output_layer")]
    pub default_output_layer: String,
    #[serde(default)]
    pub label_file: Option<String>,
}

fn default_input_layer() -> String {
    "data".to_string()
}

fn default_output_layer() -> String {
    "prob".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ModelsDoc {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

/// Declared model descriptors, loaded once from `models.toml`.
#[derive(Clone, Debug, Default)]
pub struct ModelManager {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelManager {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let doc: ModelsDoc = toml::from_str(contents)
            .map_err(|e| ConfigError::InvalidValue {
                key: "models.toml".to_string(),
                value: e.to_string(),
            })?;
        let models = doc.models.into_iter().map(|m| (m.name.clone(), m)).collect();
        Ok(Self { models })
    }

    pub fn model(&self, name: &str) -> Result<&ModelDescriptor, ConfigError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

/// The dependency-injection root passed into [`crate::pipeline::Pipeline::build`]
/// and every [`crate::factory::OperatorFactory`] constructor.
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    pub context: Context,
    pub cameras: CameraManager,
    pub models: ModelManager,
    pub flow_control: crate::flow_control::FlowControlRegistry,
}

impl Runtime {
    pub fn new(context: Context, cameras: CameraManager, models: ModelManager) -> Self {
        Self {
            context,
            cameras,
            models,
            flow_control: crate::flow_control::FlowControlRegistry::new(),
        }
    }
}

static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Installs `self` as the process-wide runtime. Intended for binaries
    /// (demos, CLIs) that want ambient access instead of threading a
    /// `&Runtime` everywhere; library code should prefer explicit
    /// injection. Panics if called more than once.
    pub fn set_global(self) {
        GLOBAL_RUNTIME
            .set(self)
            .unwrap_or_else(|_| panic!("Runtime::set_global called more than once"));
    }

    /// Returns the process-wide runtime installed by [`Self::set_global`].
    /// Panics if none has been installed.
    pub fn global() -> &'static Runtime {
        GLOBAL_RUNTIME
            .get()
            .expect("Runtime::set_global was never called")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_typed_getters_reject_wrong_type() {
        let mut ctx = Context::new();
        ctx.set("device_index", ConfigValue::Int(0));
        assert_eq!(ctx.get_i64("device_index").unwrap(), 0);
        assert!(matches!(
            ctx.get_str("device_index"),
            Err(ConfigError::WrongType { .. })
        ));
        assert!(matches!(ctx.get_str("missing"), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn context_loads_from_toml() {
        let toml_src = r#"
            [context]
            device_index = 1
            encoder_element = "x264enc"
        "#;
        let ctx = Context::from_toml(toml_src).unwrap();
        assert_eq!(ctx.get_i64("device_index").unwrap(), 1);
        assert_eq!(ctx.get_str("encoder_element").unwrap(), "x264enc");
    }

    #[test]
    fn camera_manager_loads_from_toml() {
        let toml_src = r#"
            [[cameras]]
            name = "front_door"
            video_uri = "rtsp://example/front"
            width = 1280
            height = 720
        "#;
        let mgr = CameraManager::from_toml(toml_src).unwrap();
        let cam = mgr.camera("front_door").unwrap();
        assert_eq!(cam.width, 1280);
        assert!(matches!(mgr.camera("nope"), Err(ConfigError::UnknownCamera(_))));
    }

    #[test]
    fn model_manager_loads_from_toml() {
        let toml_src = r#"
            [[models]]
            name = "squeezenet"
            model_type = "classification"
            default_output_layer = "softmax"
        "#;
        let mgr = ModelManager::from_toml(toml_src).unwrap();
        let model = mgr.model("squeezenet").unwrap();
        assert_eq!(model.default_output_layer, "softmax");
    }
}
