//! `Compressor(BZIP2)`: round-trips a large zeroed buffer through the real
//! bzip2 codec and checks the decompressed bytes match bit-for-bit.

#![cfg(feature = "compression")]

use camflow::frame::Frame;
use camflow::operator::Operator;
use camflow::operators::{CompressionKind, Compressor};
use camflow::stream::Stream;
use std::io::Read;
use std::time::Duration;

#[test]
fn bzip2_round_trips_a_one_mebibyte_zero_buffer() {
    let original = vec![0u8; 1024 * 1024];

    let producer = Stream::new("producer");
    let compressor_op = Operator::new(
        "compressor",
        "Compressor",
        &["input"],
        &["output"],
        Box::new(Compressor::new(CompressionKind::Bzip2)),
    );
    compressor_op.set_source("input", producer.clone()).unwrap();
    let reader = compressor_op.sink("output").unwrap().subscribe(None);
    compressor_op.start(4).unwrap();

    let mut frame = Frame::new();
    frame.set_frame_id(0);
    frame.set("original_bytes", original.clone());
    producer.push(frame, true);

    let result = reader.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(result.get::<String>("compression_type").unwrap(), "bzip2");
    let compressed = result.get::<Vec<u8>>("compressed_bytes").unwrap();

    let mut decoder = bzip2::read::BzDecoder::new(&compressed[..]);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    assert_eq!(decompressed, original);

    compressor_op.stop();
}
