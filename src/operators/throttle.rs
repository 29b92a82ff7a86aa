//! Rate-limiting operators: [`Throttler`] caps frames per
//! second and drops the rest; [`Strider`] keeps every Nth frame. Both
//! preserve relative order of the frames they keep.

use crate::context::Runtime;
use crate::error::SafResult;
use crate::factory::OperatorFactory;
use crate::operator::{Operator, OperatorIo, OperatorLogic};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Emits at most `fps` frames per second, dropping the rest. A dropped
/// frame's flow-control token, if any, is released on the spot so an
/// upstream `FlowControlEntrance`'s budget never leaks.
pub struct Throttler {
    min_interval: Duration,
    last_emitted: Option<Instant>,
}

impl Throttler {
    pub fn new(fps: f64) -> Self {
        assert!(fps > 0.0, "Throttler fps must be positive");
        Self {
            min_interval: Duration::from_secs_f64(1.0 / fps),
            last_emitted: None,
        }
    }
}

impl OperatorLogic for Throttler {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        let now = Instant::now();
        let should_emit = match self.last_emitted {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if should_emit {
            self.last_emitted = Some(now);
            io.push_frame("output", frame);
        } else {
            if let Some(token) = frame.take_token() {
                debug!("Throttler dropping frame, releasing its flow-control token");
                token.release();
            }
        }
    }

    fn on_stop(&mut self, _io: &mut crate::operator::OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Emits every Nth frame, dropping the rest.
pub struct Strider {
    stride: u64,
    seen: u64,
}

impl Strider {
    pub fn new(stride: u64) -> Self {
        assert!(stride > 0, "Strider stride must be positive");
        Self { stride, seen: 0 }
    }
}

impl OperatorLogic for Strider {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(mut frame) = io.get_frame("input") else {
            return;
        };
        let index = self.seen;
        self.seen += 1;
        if index % self.stride == 0 {
            io.push_frame("output", frame);
        } else if let Some(token) = frame.take_token() {
            token.release();
        }
    }

    fn on_stop(&mut self, _io: &mut crate::operator::OperatorOnStopIo<'_>) -> bool {
        true
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "Throttler",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let fps: f64 = params.get("fps").and_then(|v| v.parse().ok()).unwrap_or(30.0);
            Ok(Operator::new(
                name,
                "Throttler",
                &["input"],
                &["output"],
                Box::new(Throttler::new(fps)),
            ))
        }),
    );
    factory.register(
        "Strider",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let stride: u64 = params.get("stride").and_then(|v| v.parse().ok()).unwrap_or(1);
            Ok(Operator::new(
                name,
                "Strider",
                &["input"],
                &["output"],
                Box::new(Strider::new(stride)),
            ))
        }),
    );
}
