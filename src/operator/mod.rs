//! The operator execution loop.
//!
//! Split into a harness (this module's [`Operator`], which owns the
//! wiring, the worker thread and the bookkeeping) and a trait
//! ([`OperatorLogic`]) that each derived operator kind implements — a
//! narrow trait object standing in for per-kind `init`/`process`/`on_stop`
//! bodies.

use crate::error::{SafError, SafResult, WiringError};
use crate::frame::Frame;
use crate::stream::{Stream, StreamReader};
use crate::time::TimePoint;
use log::{error, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SOURCE_POP_TIMEOUT: Duration = Duration::from_millis(15);
const TRAILING_WINDOW: usize = 25;

/// The per-tick view an [`OperatorLogic`] implementation gets of its
/// sources and sinks while `process` runs. Consuming a cached source entry
/// or pushing to a sink never blocks.
pub struct OperatorIo<'a> {
    cache: &'a mut HashMap<String, Frame>,
    sinks: &'a HashMap<String, Arc<Stream>>,
    block_on_push: bool,
    pushed_stop: &'a mut bool,
}

impl<'a> OperatorIo<'a> {
    /// Test-only constructor letting derived-operator unit tests (in
    /// `crate::operators::*`) drive a single `process` tick without going
    /// through a full `Operator` worker thread.
    #[cfg(test)]
    pub(crate) fn for_test(
        cache: &'a mut HashMap<String, Frame>,
        sinks: &'a HashMap<String, Arc<Stream>>,
        block_on_push: bool,
        pushed_stop: &'a mut bool,
    ) -> Self {
        Self {
            cache,
            sinks,
            block_on_push,
            pushed_stop,
        }
    }

    /// Consumes and returns this tick's cached frame for `source_name`, if
    /// any was popped.
    pub fn get_frame(&mut self, source_name: &str) -> Option<Frame> {
        self.cache.remove(source_name)
    }

    /// Pushes `frame` to the named sink. Pushing a stop frame marks this
    /// operator as having seen the terminal frame — the worker loop
    /// terminates once the current `process` call returns.
    pub fn push_frame(&mut self, sink_name: &str, frame: Frame) {
        if frame.is_stop_frame() {
            *self.pushed_stop = true;
        }
        match self.sinks.get(sink_name) {
            Some(sink) => sink.push(frame, self.block_on_push),
            None => error!("push to undeclared sink {sink_name:?} ignored"),
        }
    }
}

/// The sink-only view an [`OperatorLogic`] gets during [`OperatorLogic::on_stop`]:
/// the per-tick source cache is gone (the loop has already exited), but a
/// few operators need to flush state to their sink on teardown — e.g.
/// [`crate::operators::Buffer`] draining its remaining frames.
pub struct OperatorOnStopIo<'a> {
    sinks: &'a HashMap<String, Arc<Stream>>,
    block_on_push: bool,
}

impl<'a> OperatorOnStopIo<'a> {
    #[cfg(test)]
    pub(crate) fn for_test(sinks: &'a HashMap<String, Arc<Stream>>, block_on_push: bool) -> Self {
        Self { sinks, block_on_push }
    }

    pub fn push_frame(&mut self, sink_name: &str, frame: Frame) {
        match self.sinks.get(sink_name) {
            Some(sink) => sink.push(frame, self.block_on_push),
            None => error!("push to undeclared sink {sink_name:?} ignored"),
        }
    }
}

/// The virtual part of an operator: what each derived operator kind
/// (Camera, ImageTransformer, Throttler, ...) implements. `Send` because it
/// runs on the operator's dedicated worker thread.
pub trait OperatorLogic: Send {
    /// Called once before the loop starts. `false` refuses to start:
    /// initialization failure is fatal to the operator and surfaces
    /// through `Operator::start` returning an error.
    fn init(&mut self) -> bool;

    /// Invoked once per tick with whatever sources delivered a frame this
    /// tick (possibly none, for a source operator like Camera; possibly a
    /// partial set, if some sources timed out).
    fn process(&mut self, io: &mut OperatorIo<'_>);

    /// Cleanup after the loop exits. `false` is logged but does not change
    /// `Operator::stop`'s idempotent contract. Runs after the substrate has
    /// already forwarded the generic stop frame (if that's why the loop
    /// exited), so anything pushed here trails it on the sink stream.
    fn on_stop(&mut self, io: &mut OperatorOnStopIo<'_>) -> bool;
}

struct LatencyStats {
    num_processed: u64,
    avg_processing_ms: f64,
    trailing_window: VecDeque<f64>,
    trailing_sum_ms: f64,
    queue_latency_sum_ms: f64,
    num_queue_samples: u64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            num_processed: 0,
            avg_processing_ms: 0.0,
            trailing_window: VecDeque::with_capacity(TRAILING_WINDOW),
            trailing_sum_ms: 0.0,
            queue_latency_sum_ms: 0.0,
            num_queue_samples: 0,
        }
    }

    fn record_processing(&mut self, ms: f64) {
        self.num_processed += 1;
        self.avg_processing_ms +=
            (ms - self.avg_processing_ms) / self.num_processed as f64;

        self.trailing_window.push_back(ms);
        self.trailing_sum_ms += ms;
        if self.trailing_window.len() > TRAILING_WINDOW {
            if let Some(evicted) = self.trailing_window.pop_front() {
                self.trailing_sum_ms -= evicted;
            }
        }
    }

    fn record_queue_latency(&mut self, ms: f64) {
        self.queue_latency_sum_ms += ms;
        self.num_queue_samples += 1;
    }

    fn avg_processing_latency_ms(&self) -> f64 {
        self.avg_processing_ms
    }

    fn trailing_avg_processing_latency_ms(&self) -> f64 {
        if self.trailing_window.is_empty() {
            0.0
        } else {
            self.trailing_sum_ms / self.trailing_window.len() as f64
        }
    }

    fn avg_queue_latency_ms(&self) -> f64 {
        if self.num_queue_samples == 0 {
            0.0
        } else {
            self.queue_latency_sum_ms / self.num_queue_samples as f64
        }
    }
}

/// The concrete runtime unit of computation:
/// named input/output maps, a worker thread, started/stopped state,
/// latency accumulators, a block-on-push policy, and a kind tag. Owns its
/// sink streams; source streams are bound by [`Operator::set_source`]
/// before [`Operator::start`].
pub struct Operator {
    name: String,
    kind: &'static str,
    declared_sources: HashSet<String>,
    sources: Mutex<HashMap<String, Arc<Stream>>>,
    sinks: HashMap<String, Arc<Stream>>,
    source_readers: Mutex<HashMap<String, Arc<StreamReader>>>,
    logic: Mutex<Box<dyn OperatorLogic>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    block_on_push: AtomicBool,
    latency: Mutex<LatencyStats>,
    start_time: Mutex<Option<Instant>>,
}

impl Operator {
    pub fn new(
        name: impl Into<String>,
        kind: &'static str,
        source_names: &[&str],
        sink_names: &[&str],
        logic: Box<dyn OperatorLogic>,
    ) -> Arc<Self> {
        let sinks = sink_names
            .iter()
            .map(|n| (n.to_string(), Stream::new(n.to_string())))
            .collect();
        Arc::new(Self {
            name: name.into(),
            kind,
            declared_sources: source_names.iter().map(|s| s.to_string()).collect(),
            sources: Mutex::new(HashMap::new()),
            sinks,
            source_readers: Mutex::new(HashMap::new()),
            logic: Mutex::new(logic),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            block_on_push: AtomicBool::new(false),
            latency: Mutex::new(LatencyStats::new()),
            start_time: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn set_block_on_push(&self, block: bool) {
        self.block_on_push.store(block, Ordering::Relaxed);
    }

    /// Binds `name` (must have been declared at construction) to a
    /// producer's sink stream.
    pub fn set_source(&self, name: &str, stream: Arc<Stream>) -> SafResult<()> {
        if !self.declared_sources.contains(name) {
            return Err(SafError::Wiring(WiringError::UnknownSource {
                operator: self.name.clone(),
                port: name.to_string(),
            }));
        }
        self.sources.lock().insert(name.to_string(), stream);
        Ok(())
    }

    /// Returns this operator's owned sink stream by name.
    pub fn sink(&self, name: &str) -> SafResult<Arc<Stream>> {
        self.sinks.get(name).cloned().ok_or_else(|| {
            SafError::Wiring(WiringError::UnknownSink {
                operator: self.name.clone(),
                port: name.to_string(),
            })
        })
    }

    pub fn declared_source_names(&self) -> impl Iterator<Item = &str> {
        self.declared_sources.iter().map(String::as_str)
    }

    pub fn declared_sink_names(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    /// Declared source names with no bound stream yet, i.e. never passed
    /// to [`Operator::set_source`]. Used both by `start()` (fail fast at
    /// start time) and by [`crate::pipeline::Pipeline::build`] (fail fast
    /// at construction time, before any operator in the pipeline starts).
    pub fn unbound_sources(&self) -> Vec<String> {
        let sources = self.sources.lock();
        self.declared_sources
            .iter()
            .filter(|name| !sources.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    pub fn avg_processing_latency_ms(&self) -> f64 {
        self.latency.lock().avg_processing_latency_ms()
    }

    pub fn trailing_avg_processing_latency_ms(&self) -> f64 {
        self.latency.lock().trailing_avg_processing_latency_ms()
    }

    pub fn avg_queue_latency_ms(&self) -> f64 {
        self.latency.lock().avg_queue_latency_ms()
    }

    /// Lifetime throughput: frames processed divided by elapsed time since
    /// `start()`.
    pub fn historical_process_fps(&self) -> f64 {
        let num_processed = self.latency.lock().num_processed;
        match *self.start_time.lock() {
            Some(t0) if num_processed > 0 => {
                let elapsed_s = t0.elapsed().as_secs_f64();
                if elapsed_s > 0.0 {
                    num_processed as f64 / elapsed_s
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Verifies every declared source has been bound, subscribes to each
    /// with `buf_size`, spawns the worker thread, and transitions to the
    /// started state. Fails fast with `WiringError::UnboundSource` if a
    /// source was declared at construction but never wired via
    /// `set_source` — otherwise `run_loop`'s "no sources bound" path
    /// (meant for source operators like Camera) would mistake a missing
    /// binding for "no sources declared" and busy-spin `process` forever.
    pub fn start(self: &Arc<Self>, buf_size: usize) -> SafResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SafError::AlreadyStarted);
        }

        if let Some(unbound) = self.unbound_sources().into_iter().next() {
            self.started.store(false, Ordering::Release);
            return Err(SafError::Wiring(WiringError::UnboundSource {
                operator: self.name.clone(),
                port: unbound,
            }));
        }

        if !self.logic.lock().init() {
            self.started.store(false, Ordering::Release);
            return Err(SafError::InitFailed);
        }

        let sources = self.sources.lock();
        let mut readers = HashMap::with_capacity(sources.len());
        for (name, stream) in sources.iter() {
            readers.insert(name.clone(), stream.subscribe(Some(buf_size)));
        }
        drop(sources);
        *self.source_readers.lock() = readers;
        *self.start_time.lock() = Some(Instant::now());

        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("op-{}", self.name))
            .spawn(move || this.run_loop())
            .expect("failed to spawn operator worker thread");
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            if !self.started.load(Ordering::Acquire) {
                break;
            }

            let readers = self.source_readers.lock();
            if readers.is_empty() {
                drop(readers);
                let mut pushed_stop = false;
                let mut empty_cache = HashMap::new();
                self.run_process_tick(&mut empty_cache, &mut pushed_stop);
                if pushed_stop {
                    break;
                }
                continue;
            }

            let mut cache = HashMap::with_capacity(readers.len());
            let mut saw_stop = false;
            for (name, reader) in readers.iter() {
                if let Some(frame) = reader.pop(Some(SOURCE_POP_TIMEOUT)) {
                    if frame.is_stop_frame() {
                        saw_stop = true;
                        break;
                    }
                    if let Some(capture_time) = frame.capture_time() {
                        let queue_ms =
                            capture_time.elapsed_until(TimePoint::now()).as_secs_f64() * 1000.0;
                        self.latency.lock().record_queue_latency(queue_ms);
                    }
                    cache.insert(name.clone(), frame);
                }
            }
            drop(readers);

            if saw_stop {
                let mut stop_frame = Frame::new();
                stop_frame.set_stop_frame(true);
                for sink in self.sinks.values() {
                    sink.push(stop_frame.clone(), false);
                }
                break;
            }

            if cache.is_empty() {
                // Every bound source timed out this tick; skip process()
                // rather than invoke it with an empty batch.
                continue;
            }

            let mut pushed_stop = false;
            self.run_process_tick(&mut cache, &mut pushed_stop);
            if pushed_stop {
                break;
            }
        }
    }

    fn run_process_tick(&self, cache: &mut HashMap<String, Frame>, pushed_stop: &mut bool) {
        let block_on_push = self.block_on_push.load(Ordering::Relaxed);
        let mut io = OperatorIo {
            cache,
            sinks: &self.sinks,
            block_on_push,
            pushed_stop,
        };
        let start = Instant::now();
        self.logic.lock().process(&mut io);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.latency.lock().record_processing(elapsed_ms);
    }

    /// Stops each owned sink stream (unblocking downstream pops) and each
    /// source reader (unblocking our own pops), joins the worker, invokes
    /// `on_stop`, and drops the source readers. Idempotent: calling on an
    /// unstarted operator is a warning no-op.
    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::AcqRel) {
            warn!("stop() called on operator {:?} that was not started", self.name);
            return true;
        }

        for sink in self.sinks.values() {
            sink.stop();
        }
        for reader in self.source_readers.lock().values() {
            reader.stop();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let mut on_stop_io = OperatorOnStopIo {
            sinks: &self.sinks,
            block_on_push: self.block_on_push.load(Ordering::Relaxed),
        };
        let ok = self.logic.lock().on_stop(&mut on_stop_io);
        if !ok {
            warn!("on_stop() reported failure for operator {:?}", self.name);
        }
        self.source_readers.lock().clear();
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct PassThrough {
        processed: Arc<AtomicUsize>,
    }

    impl OperatorLogic for PassThrough {
        fn init(&mut self) -> bool {
            true
        }
        fn process(&mut self, io: &mut OperatorIo<'_>) {
            if let Some(frame) = io.get_frame("input") {
                self.processed.fetch_add(1, Ordering::SeqCst);
                io.push_frame("output", frame);
            }
        }
        fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
            true
        }
    }

    struct FailInit;
    impl OperatorLogic for FailInit {
        fn init(&mut self) -> bool {
            false
        }
        fn process(&mut self, _io: &mut OperatorIo<'_>) {}
        fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
            true
        }
    }

    #[test]
    fn set_source_rejects_undeclared_name() {
        let op = Operator::new(
            "a",
            "Test",
            &["input"],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let stray = Stream::new("s");
        assert!(op.set_source("not-declared", stray).is_err());
    }

    #[test]
    fn start_fails_when_a_declared_source_was_never_bound() {
        let op = Operator::new(
            "a",
            "Test",
            &["input"],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        // "input" is declared but set_source was never called for it.
        let err = op.start(16).unwrap_err();
        assert!(matches!(
            err,
            SafError::Wiring(WiringError::UnboundSource { ref operator, ref port })
                if operator == "a" && port == "input"
        ));
        assert!(!op.is_started());
    }

    #[test]
    fn start_fails_when_init_fails() {
        let op = Operator::new("a", "Test", &[], &["output"], Box::new(FailInit));
        assert!(op.start(16).is_err());
        assert!(!op.is_started());
    }

    #[test]
    fn double_start_is_already_started_error() {
        let op = Operator::new(
            "a",
            "Test",
            &[],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        op.start(16).unwrap();
        assert!(matches!(op.start(16), Err(SafError::AlreadyStarted)));
        op.stop();
    }

    #[test]
    fn stopping_unstarted_operator_is_a_noop() {
        let op = Operator::new(
            "a",
            "Test",
            &[],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        assert!(op.stop());
    }

    #[test]
    fn forwards_frames_source_to_sink() {
        let upstream = Stream::new("up");
        let counter = Arc::new(AtomicUsize::new(0));
        let op = Operator::new(
            "a",
            "Test",
            &["input"],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::clone(&counter),
            }),
        );
        op.set_source("input", Arc::clone(&upstream)).unwrap();
        let downstream_reader = op.sink("output").unwrap().subscribe(None);

        op.start(16).unwrap();
        let mut f = Frame::new();
        f.set_capture_time(TimePoint::now());
        f.set_frame_id(1);
        upstream.push(f, false);

        let received = downstream_reader.pop(Some(Duration::from_millis(500)));
        assert!(received.is_some());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        upstream.stop();
        op.stop();
    }

    #[test]
    fn stop_frame_terminates_loop_and_forwards() {
        let upstream = Stream::new("up");
        let op = Operator::new(
            "a",
            "Test",
            &["input"],
            &["output"],
            Box::new(PassThrough {
                processed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        op.set_source("input", Arc::clone(&upstream)).unwrap();
        let downstream_reader = op.sink("output").unwrap().subscribe(None);

        op.start(16).unwrap();
        let mut stop = Frame::new();
        stop.set_stop_frame(true);
        upstream.push(stop, false);

        let received = downstream_reader.pop(Some(Duration::from_millis(500))).unwrap();
        assert!(received.is_stop_frame());
        op.stop();
    }
}
