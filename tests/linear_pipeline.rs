//! End-to-end checks for a three-operator linear chain and for
//! `Pipeline::build`'s start/stop ordering.

use camflow::context::Runtime;
use camflow::factory::{OperatorConstructor, OperatorFactory};
use camflow::operator::Operator;
use camflow::operators::{
    Camera, FakeCameraSource, ImageTransformer, MockModelBackend, NeuralNetEvaluator, Rotation,
};
use camflow::pipeline::{OperatorSpec, Pipeline, PipelineSpec};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[test]
fn camera_transformer_nne_preserves_order_and_propagates_stop() {
    let camera = Operator::new(
        "camera",
        "Camera",
        &[],
        &["output"],
        Box::new(Camera::new(
            "cam",
            Box::new(FakeCameraSource::new(32, 24, 3, Some(10))),
            1000.0,
            false,
        )),
    );

    let transformer = Operator::new(
        "transformer",
        "ImageTransformer",
        &["input"],
        &["output"],
        Box::new(ImageTransformer::new(16, 16, Rotation::None)),
    );
    transformer
        .set_source("input", camera.sink("output").unwrap())
        .unwrap();

    let backend = Box::new(MockModelBackend::new("prob", 4));
    let nne = Operator::new(
        "nne",
        "NeuralNetEvaluator",
        &["input"],
        &["output"],
        Box::new(NeuralNetEvaluator::new(backend, "data", vec!["prob".to_string()], 1)),
    );
    nne.set_source("input", transformer.sink("output").unwrap()).unwrap();
    let reader = nne.sink("output").unwrap().subscribe(Some(32));

    let pipeline = Pipeline::from_operators(vec![camera, transformer, nne]).unwrap();
    assert!(pipeline.start().unwrap());

    let started = Instant::now();
    let mut seen = 0usize;
    loop {
        match reader.pop(Some(Duration::from_millis(300))) {
            Some(frame) if frame.is_stop_frame() => break,
            Some(frame) => {
                assert!(frame.get::<Vec<f32>>("prob").is_ok());
                seen += 1;
            }
            None => panic!("timed out waiting for frames"),
        }
    }
    assert_eq!(seen, 10);
    assert!(started.elapsed() < Duration::from_millis(200));

    pipeline.stop();
}

#[test]
fn build_from_json_runs_lifecycle_hooks_in_spec_order() {
    let order_started: std::sync::Arc<parking_lot::Mutex<Vec<String>>> = Default::default();
    let order_stopped: std::sync::Arc<parking_lot::Mutex<Vec<String>>> = Default::default();

    let mut factory = OperatorFactory::new();
    let probe = |sources: &'static [&'static str],
                 kind: &'static str,
                 started: &std::sync::Arc<parking_lot::Mutex<Vec<String>>>,
                 stopped: &std::sync::Arc<parking_lot::Mutex<Vec<String>>>|
     -> OperatorConstructor {
        let started = std::sync::Arc::clone(started);
        let stopped = std::sync::Arc::clone(stopped);
        Box::new(move |name: &str, _params: &HashMap<String, String>, _runtime: &Runtime| {
            Ok(Operator::new(
                name,
                kind,
                sources,
                &["output"],
                Box::new(LifecycleProbe {
                    name: name.to_string(),
                    started: std::sync::Arc::clone(&started),
                    stopped: std::sync::Arc::clone(&stopped),
                }),
            ))
        })
    };
    factory.register("camera_noop", probe(&[], "camera_noop", &order_started, &order_stopped));
    factory.register("xform_noop", probe(&["input"], "xform_noop", &order_started, &order_stopped));
    factory.register("classify_noop", probe(&["input"], "classify_noop", &order_started, &order_stopped));

    let spec: PipelineSpec = PipelineSpec {
        operators: vec![
            OperatorSpec {
                operator_name: "A".to_string(),
                operator_type: "camera_noop".to_string(),
                parameters: HashMap::new(),
                inputs: HashMap::new(),
            },
            OperatorSpec {
                operator_name: "B".to_string(),
                operator_type: "xform_noop".to_string(),
                parameters: HashMap::new(),
                inputs: HashMap::from([("input".to_string(), "A".to_string())]),
            },
            OperatorSpec {
                operator_name: "C".to_string(),
                operator_type: "classify_noop".to_string(),
                parameters: HashMap::new(),
                inputs: HashMap::from([("input".to_string(), "B".to_string())]),
            },
        ],
    };

    let runtime = Runtime::default();
    let pipeline = Pipeline::build(&spec, &factory, &runtime).unwrap();
    assert!(pipeline.start().unwrap());
    assert_eq!(*order_started.lock(), vec!["C", "B", "A"]);
    assert!(pipeline.stop());
    assert_eq!(*order_stopped.lock(), vec!["A", "B", "C"]);
}

struct LifecycleProbe {
    name: String,
    started: std::sync::Arc<parking_lot::Mutex<Vec<String>>>,
    stopped: std::sync::Arc<parking_lot::Mutex<Vec<String>>>,
}

impl camflow::OperatorLogic for LifecycleProbe {
    fn init(&mut self) -> bool {
        self.started.lock().push(self.name.clone());
        true
    }

    fn process(&mut self, io: &mut camflow::operator::OperatorIo<'_>) {
        if let Some(frame) = io.get_frame("input") {
            io.push_frame("output", frame);
        }
    }

    fn on_stop(&mut self, _io: &mut camflow::operator::OperatorOnStopIo<'_>) -> bool {
        self.stopped.lock().push(self.name.clone());
        true
    }
}
