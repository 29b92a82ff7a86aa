//! `OperatorFactory`: maps an operator kind + parameter map to a
//! constructed instance, the thing that lets
//! [`crate::pipeline::Pipeline::build`] turn a JSON document into a running
//! topology without the caller naming concrete operator types.

use crate::context::Runtime;
use crate::error::{SafResult, WiringError};
use crate::operator::Operator;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered operator kind's constructor: given the operator's declared
/// name, its `parameters` map from the pipeline spec, and the runtime, it
/// builds a started-but-unstarted [`Operator`] (wiring to sources happens
/// afterward, in `Pipeline::build`).
pub type OperatorConstructor =
    Box<dyn Fn(&str, &HashMap<String, String>, &Runtime) -> SafResult<Arc<Operator>> + Send + Sync>;

/// The kind registry. Each built-in derived operator kind registers itself
/// under its string name (`"Camera"`, `"Throttler"`, ...);
/// [`OperatorFactory::create`] is the one place a kind name turns into a
/// concrete [`Operator`].
#[derive(Default)]
pub struct OperatorFactory {
    constructors: HashMap<String, OperatorConstructor>,
}

impl OperatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, ctor: OperatorConstructor) {
        self.constructors.insert(kind.into(), ctor);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn create(
        &self,
        name: &str,
        kind: &str,
        parameters: &HashMap<String, String>,
        runtime: &Runtime,
    ) -> SafResult<Arc<Operator>> {
        let ctor = self
            .constructors
            .get(kind)
            .ok_or_else(|| WiringError::UnknownKind(kind.to_string()))?;
        ctor(name, parameters, runtime)
    }

    /// Registers every built-in operator kind. Demos and tests that want
    /// the stock operator set call this once on a fresh factory.
    pub fn with_builtin_operators() -> Self {
        let mut factory = Self::new();
        crate::operators::register_all(&mut factory);
        factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{OperatorIo, OperatorLogic};

    struct NoOp;
    impl OperatorLogic for NoOp {
        fn init(&mut self) -> bool {
            true
        }
        fn process(&mut self, _io: &mut OperatorIo<'_>) {}
        fn on_stop(&mut self, _io: &mut crate::operator::OperatorOnStopIo<'_>) -> bool {
            true
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let factory = OperatorFactory::new();
        let runtime = Runtime::default();
        let err = factory.create("a", "NoSuchKind", &HashMap::new(), &runtime);
        assert!(matches!(
            err,
            Err(crate::error::SafError::Wiring(WiringError::UnknownKind(_)))
        ));
    }

    #[test]
    fn registered_kind_constructs() {
        let mut factory = OperatorFactory::new();
        factory.register(
            "NoOp",
            Box::new(|name, _params, _runtime| {
                Ok(Operator::new(name, "NoOp", &[], &["output"], Box::new(NoOp)))
            }),
        );
        let runtime = Runtime::default();
        let op = factory
            .create("a", "NoOp", &HashMap::new(), &runtime)
            .unwrap();
        assert_eq!(op.name(), "a");
    }
}
