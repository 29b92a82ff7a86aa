//! [`Buffer`]: delays a stream by exactly N frames, holding them in a fixed-
//! capacity `VecDeque` and flushing whatever remains buffered on teardown.

use crate::context::Runtime;
use crate::error::SafResult;
use crate::factory::OperatorFactory;
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use std::collections::VecDeque;
use std::sync::Arc;

pub struct Buffer {
    capacity: usize,
    queue: VecDeque<crate::frame::Frame>,
}

impl Buffer {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0, "Buffer capacity must be positive");
        Self {
            capacity: num_frames,
            queue: VecDeque::with_capacity(num_frames),
        }
    }
}

impl OperatorLogic for Buffer {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        self.queue.push_back(frame);
        if self.queue.len() > self.capacity {
            let oldest = self.queue.pop_front().expect("just checked len > 0");
            io.push_frame("output", oldest);
        }
    }

    /// Flushes every still-buffered frame to the sink. Runs
    /// after the worker loop has already forwarded the generic stop frame
    ///, so these trail it on the sink stream.
    fn on_stop(&mut self, io: &mut OperatorOnStopIo<'_>) -> bool {
        for frame in self.drain() {
            io.push_frame("output", frame);
        }
        true
    }
}

impl Buffer {
    fn drain(&mut self) -> Vec<crate::frame::Frame> {
        self.queue.drain(..).collect()
    }
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "Buffer",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let num_frames: usize = params
                .get("num_frames")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            Ok(Operator::new(
                name,
                "Buffer",
                &["input"],
                &["output"],
                Box::new(Buffer::new(num_frames)),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tick(logic: &mut dyn crate::operator::OperatorLogic, sinks: &HashMap<String, Arc<crate::stream::Stream>>, frame: Frame) {
        let mut cache = HashMap::new();
        cache.insert("input".to_string(), frame);
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, sinks, false, &mut pushed_stop);
        logic.process(&mut io);
    }

    #[test]
    fn buffer_delays_by_exactly_n_frames() {
        let mut buffer = Buffer::new(3);
        let output = crate::stream::Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);

        for i in 0..10u64 {
            let mut f = Frame::new();
            f.set_frame_id(i);
            tick(&mut buffer, &sinks, f);
        }

        let mut received = Vec::new();
        while let Some(f) = reader.pop(Some(Duration::from_millis(5))) {
            received.push(f.frame_id().unwrap());
        }
        assert_eq!(received, (0..7).collect::<Vec<_>>());
        assert_eq!(buffer.queue.len(), 3);
    }

    #[test]
    fn on_stop_flushes_remaining_frames_in_order() {
        let mut buffer = Buffer::new(3);
        let output = crate::stream::Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);
        for i in 0..5u64 {
            let mut f = Frame::new();
            f.set_frame_id(i);
            tick(&mut buffer, &sinks, f);
        }
        let mut on_stop_io = crate::operator::OperatorOnStopIo::for_test(&sinks, false);
        buffer.on_stop(&mut on_stop_io);

        let mut received = Vec::new();
        while let Some(f) = reader.pop(Some(Duration::from_millis(5))) {
            received.push(f.frame_id().unwrap());
        }
        // First 2 frames already flowed out during the regular pushes
        // (0, 1), the remaining 3 (2, 3, 4) flush on stop.
        assert_eq!(received, vec![2, 3, 4]);
    }
}
