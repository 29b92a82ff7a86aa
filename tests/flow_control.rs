//! `Camera -> FlowControlEntrance(3) -> Throttler(5fps) -> FlowControlExit -> Sink`,
//! checking the token budget is never exceeded and every frame reaching the
//! sink carries no outstanding token.

use camflow::flow_control::FlowControlEntrance;
use camflow::operator::Operator;
use camflow::operators::{Camera, FakeCameraSource, FlowControlEntranceOp, FlowControlExitOp, Throttler};
use camflow::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn entrance_budget_is_never_exceeded_and_sink_never_sees_a_token() {
    let camera = Operator::new(
        "camera",
        "Camera",
        &[],
        &["output"],
        Box::new(Camera::new(
            "cam",
            Box::new(FakeCameraSource::new(8, 8, 3, None)),
            30.0,
            false,
        )),
    );

    let entrance = Arc::new(FlowControlEntrance::new(3));
    let entrance_op = Operator::new(
        "entrance",
        "FlowControlEntrance",
        &["input"],
        &["output"],
        Box::new(FlowControlEntranceOp::new(Arc::clone(&entrance))),
    );
    entrance_op
        .set_source("input", camera.sink("output").unwrap())
        .unwrap();

    let throttler = Operator::new(
        "throttler",
        "Throttler",
        &["input"],
        &["output"],
        Box::new(Throttler::new(5.0)),
    );
    throttler
        .set_source("input", entrance_op.sink("output").unwrap())
        .unwrap();

    let exit = Operator::new(
        "exit",
        "FlowControlExit",
        &["input"],
        &["output"],
        Box::new(FlowControlExitOp::new()),
    );
    exit.set_source("input", throttler.sink("output").unwrap()).unwrap();
    let sink_reader = exit.sink("output").unwrap().subscribe(Some(256));

    let pipeline = Pipeline::from_operators(vec![camera, entrance_op, throttler, exit]).unwrap();
    assert!(pipeline.start().unwrap());

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut max_outstanding = 0usize;
    let mut received = 0usize;
    while std::time::Instant::now() < deadline {
        if let Some(frame) = sink_reader.pop(Some(Duration::from_millis(50))) {
            assert!(!frame.has_token(), "sink must never see an un-released token");
            received += 1;
        }
        max_outstanding = max_outstanding.max(entrance.outstanding_count());
        assert!(entrance.outstanding_count() <= 3);
    }

    pipeline.stop();
    assert!(max_outstanding <= 3);
    assert!(received > 0, "throttled sink should have received at least one frame");
}
