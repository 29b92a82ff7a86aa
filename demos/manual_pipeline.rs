//! Programmatic pipeline construction: wires a
//! `Camera -> ImageTransformer -> NeuralNetEvaluator` chain directly with
//! `Operator`/`Stream` calls rather than going through
//! [`camflow::Pipeline::build`] and a JSON spec (see `camflow-run` for
//! that). Kept thin and CLI-adjacent: wrappers like this are external
//! collaborators, not part of the core.

use camflow::operator::Operator;
use camflow::operators::{Camera, FakeCameraSource, ImageClassifier, ImageTransformer, MockModelBackend, NeuralNetEvaluator};
use camflow::pipeline::Pipeline;
use std::time::Duration;

fn parse_args() -> anyhow::Result<u64> {
    let mut frames = 10u64;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args.next().ok_or_else(|| anyhow::anyhow!("--frames needs a value"))?;
                frames = value.parse()?;
            }
            "--config-dir" | "--camera" | "--display" | "--device" => {
                // Accepted for CLI-surface parity with the other demo
                // binaries; this demo has nothing to do with them since it
                // builds its topology in-process.
                args.next();
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }
    Ok(frames)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let frames = match parse_args() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("argument error: {err}");
            std::process::exit(1);
        }
    };

    let camera = Operator::new(
        "camera",
        "Camera",
        &[],
        &["output"],
        Box::new(Camera::new(
            "demo-camera",
            Box::new(FakeCameraSource::new(320, 240, 3, Some(frames))),
            30.0,
            false,
        )),
    );

    let transformer = Operator::new(
        "transformer",
        "ImageTransformer",
        &["input"],
        &["output"],
        Box::new(ImageTransformer::new(224, 224, camflow::operators::Rotation::None)),
    );
    transformer.set_source("input", camera.sink("output")?)?;

    let backend = Box::new(MockModelBackend::new("prob", 10));
    let nne = Operator::new(
        "nne",
        "NeuralNetEvaluator",
        &["input"],
        &["output"],
        Box::new(NeuralNetEvaluator::new(backend, "data", vec!["prob".to_string()], 1)),
    );
    nne.set_source("input", transformer.sink("output")?)?;

    let classifier = Operator::new(
        "classifier",
        "ImageClassifier",
        &["input"],
        &["output"],
        Box::new(ImageClassifier::new(
            "prob",
            (0..10).map(|i| format!("class-{i}")).collect(),
            3,
        )),
    );
    classifier.set_source("input", nne.sink("output")?)?;
    let result_reader = classifier.sink("output")?.subscribe(Some(64));

    let pipeline = Pipeline::from_operators(vec![camera, transformer, nne, classifier])?;

    if !pipeline.start()? {
        eprintln!("pipeline failed to start");
        std::process::exit(1);
    }

    let mut received = 0u64;
    loop {
        match result_reader.pop(Some(Duration::from_secs(2))) {
            Some(frame) if frame.is_stop_frame() => break,
            Some(_) => received += 1,
            None => break,
        }
    }

    pipeline.stop();
    println!("received {received} classified frames");
    Ok(())
}
