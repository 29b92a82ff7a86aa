//! [`FlowControlEntranceOp`] / [`FlowControlExitOp`]: the operator-shaped
//! wrappers the pipeline wires around [`crate::flow_control::FlowControlEntrance`]
//! / [`crate::flow_control::FlowControlExit`].
//!
//! Every other derived operator in this crate keeps its whole state private;
//! these two are the exception, because an entrance's blocking `admit` call
//! can outlive the rest of `process` — it is woken from outside, via
//! [`crate::flow_control::FlowControlRegistry`], not by anything this file
//! does at teardown time.

use crate::context::Runtime;
use crate::error::SafResult;
use crate::factory::OperatorFactory;
use crate::flow_control::{FlowControlEntrance, FlowControlExit};
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use std::sync::Arc;

/// Admits frames through a shared token budget. Registered into the
/// operator's [`Runtime`] under its own operator name so
/// [`crate::pipeline::Pipeline::stop`] can call
/// [`crate::flow_control::FlowControlRegistry::stop_all`] ahead of joining
/// this operator's worker thread, unblocking a frame stuck waiting on
/// `admit`.
pub struct FlowControlEntranceOp {
    entrance: Arc<FlowControlEntrance>,
}

impl FlowControlEntranceOp {
    pub fn new(entrance: Arc<FlowControlEntrance>) -> Self {
        Self { entrance }
    }
}

impl OperatorLogic for FlowControlEntranceOp {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        match self.entrance.admit(&mut frame) {
            Some(()) => io.push_frame("output", frame),
            None => {
                // Registry::stop_all woke us; the pipeline is tearing down.
            }
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        self.entrance.stop();
        true
    }
}

/// Releases a frame's flow-control token (if any) and forwards it unchanged.
pub struct FlowControlExitOp {
    exit: FlowControlExit,
}

impl FlowControlExitOp {
    pub fn new() -> Self {
        Self {
            exit: FlowControlExit::new(),
        }
    }
}

impl Default for FlowControlExitOp {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorLogic for FlowControlExitOp {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        self.exit.pass(&mut frame);
        io.push_frame("output", frame);
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "FlowControlEntrance",
        Box::new(|name, params, runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let budget: u32 = params.get("budget").and_then(|v| v.parse().ok()).unwrap_or(16);
            let entrance = Arc::new(FlowControlEntrance::new(budget));
            runtime.flow_control.register(name, Arc::clone(&entrance));
            Ok(Operator::new(
                name,
                "FlowControlEntrance",
                &["input"],
                &["output"],
                Box::new(FlowControlEntranceOp::new(entrance)),
            ))
        }),
    );
    factory.register(
        "FlowControlExit",
        Box::new(|name, _params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            Ok(Operator::new(
                name,
                "FlowControlExit",
                &["input"],
                &["output"],
                Box::new(FlowControlExitOp::new()),
            ))
        }),
    );
}
