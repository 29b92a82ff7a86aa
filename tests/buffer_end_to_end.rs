//! `Buffer(3)` wired into a real running `Operator`, driven by pushes onto
//! its source stream rather than by calling `process` directly.

use camflow::frame::Frame;
use camflow::operator::Operator;
use camflow::operators::Buffer;
use camflow::stream::Stream;
use std::time::Duration;

#[test]
fn buffer_delays_by_capacity_and_flushes_on_stop() {
    let producer = Stream::new("producer");
    let buffer_op = Operator::new("buffer", "Buffer", &["input"], &["output"], Box::new(Buffer::new(3)));
    buffer_op.set_source("input", producer.clone()).unwrap();
    let reader = buffer_op.sink("output").unwrap().subscribe(Some(32));

    buffer_op.start(16).unwrap();

    for i in 0..10u64 {
        let mut frame = Frame::new();
        frame.set_frame_id(i);
        producer.push(frame, true);
    }

    let mut seen = Vec::new();
    while seen.len() < 7 {
        match reader.pop(Some(Duration::from_millis(500))) {
            Some(frame) => seen.push(frame.frame_id().unwrap()),
            None => panic!("timed out waiting for buffered output"),
        }
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6]);

    let mut stop = Frame::new();
    stop.set_stop_frame(true);
    producer.push(stop, true);

    // The worker loop forwards the generic stop frame as soon as it sees
    // one from upstream; `Buffer`'s own flush only happens once `stop()` is
    // called explicitly, so the three retained frames trail it.
    let marker = reader.pop(Some(Duration::from_millis(500))).unwrap();
    assert!(marker.is_stop_frame());

    buffer_op.stop();

    let mut flushed = Vec::new();
    while flushed.len() < 3 {
        match reader.pop(Some(Duration::from_millis(500))) {
            Some(frame) => flushed.push(frame.frame_id().unwrap()),
            None => panic!("timed out waiting for flushed frames"),
        }
    }
    assert_eq!(flushed, vec![7, 8, 9]);
}
