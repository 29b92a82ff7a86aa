//! Fan-out semantics of a single `Stream` with multiple `StreamReader`s.

use camflow::frame::Frame;
use camflow::stream::Stream;

#[test]
fn fan_out_delivers_full_order_to_blocking_reader_and_a_subset_to_dropping_reader() {
    let stream = Stream::new("detections");
    let dropping = stream.subscribe(Some(4));
    let blocking = stream.subscribe(Some(100));

    for i in 0..100u64 {
        let mut frame = Frame::new();
        frame.set_frame_id(i);
        stream.push(frame, false);
    }

    let mut from_blocking = Vec::new();
    while let Some(frame) = blocking.pop(Some(std::time::Duration::from_millis(50))) {
        from_blocking.push(frame.frame_id().unwrap());
    }
    assert_eq!(from_blocking, (0..100).collect::<Vec<_>>());

    let mut from_dropping = Vec::new();
    while let Some(frame) = dropping.pop(Some(std::time::Duration::from_millis(50))) {
        from_dropping.push(frame.frame_id().unwrap());
    }
    assert!(!from_dropping.is_empty());
    assert!(from_dropping.len() < 100);
    assert!(from_dropping.windows(2).all(|w| w[0] < w[1]));
    let unique: std::collections::HashSet<_> = from_dropping.iter().collect();
    assert_eq!(unique.len(), from_dropping.len());
}
