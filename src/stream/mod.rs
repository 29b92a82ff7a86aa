//! The one-producer/many-consumer pub-sub primitive: a [`Stream`] fans a
//! frame out to every [`StreamReader`] subscribed to it, each reader owning
//! its own bounded queue, mutex and pair of not-empty/not-full condvars so
//! independent readers never contend with each other.

use crate::frame::Frame;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_MAX_BUFFER_SIZE: usize = 16;
/// EWMA smoothing factor for the push/pop rate trackers.
const EWMA_ALPHA: f64 = 0.1;

struct ReaderState {
    queue: VecDeque<Frame>,
    stopped: bool,
}

/// A per-consumer bounded FIFO, with its own lock and not-empty/not-full
/// condition variables so that independent readers never contend with each
/// other.
pub struct StreamReader {
    state: Mutex<ReaderState>,
    not_empty: Condvar,
    not_full: Condvar,
    max_buffer_size: usize,
    stopped: AtomicBool,
    created_at: Instant,
    num_pushed: AtomicU64,
    num_popped: AtomicU64,
    rates: Mutex<RateTracker>,
}

struct RateTracker {
    running_push_ms: f64,
    running_pop_ms: f64,
    last_push_ms: f64,
    last_pop_ms: f64,
    first_pop_ms: Option<f64>,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            running_push_ms: 0.0,
            running_pop_ms: 0.0,
            last_push_ms: 0.0,
            last_pop_ms: 0.0,
            first_pop_ms: None,
        }
    }

    fn record_push(&mut self, now_ms: f64) {
        let delta = now_ms - self.last_push_ms;
        if self.last_push_ms > 0.0 {
            self.running_push_ms = EWMA_ALPHA * delta + (1.0 - EWMA_ALPHA) * self.running_push_ms;
        }
        self.last_push_ms = now_ms;
    }

    fn record_pop(&mut self, now_ms: f64) {
        if self.first_pop_ms.is_none() {
            self.first_pop_ms = Some(now_ms);
        }
        let delta = now_ms - self.last_pop_ms;
        if self.last_pop_ms > 0.0 {
            self.running_pop_ms = EWMA_ALPHA * delta + (1.0 - EWMA_ALPHA) * self.running_pop_ms;
        }
        self.last_pop_ms = now_ms;
    }

    fn push_fps(&self) -> f64 {
        if self.running_push_ms > 0.0 {
            1000.0 / self.running_push_ms
        } else {
            0.0
        }
    }

    fn pop_fps(&self) -> f64 {
        if self.running_pop_ms > 0.0 {
            1000.0 / self.running_pop_ms
        } else {
            0.0
        }
    }
}

impl StreamReader {
    fn new(max_buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReaderState {
                queue: VecDeque::with_capacity(max_buffer_size),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_buffer_size,
            stopped: AtomicBool::new(false),
            created_at: Instant::now(),
            num_pushed: AtomicU64::new(0),
            num_popped: AtomicU64::new(0),
            rates: Mutex::new(RateTracker::new()),
        })
    }

    fn now_ms(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64() * 1000.0
    }

    /// Called only by the parent [`Stream`]. If `block`, waits while the
    /// queue is full until either space appears or the reader stops; if
    /// not blocking and full, drops the frame — logged as a warning, or as
    /// an error if the frame still holds a flow-control token. A
    /// stopped reader still accepts non-blocking pushes while it has
    /// capacity: `Operator::stop` stops every sink stream before calling
    /// `OperatorLogic::on_stop`, and `on_stop` implementations (e.g.
    /// `Buffer`'s end-of-stream flush) must still be able to deliver their
    /// remaining frames downstream.
    pub(crate) fn push(&self, frame: Frame, block: bool) {
        let mut state = self.state.lock();
        if state.queue.len() >= self.max_buffer_size {
            if block {
                while state.queue.len() >= self.max_buffer_size && !state.stopped {
                    self.not_full.wait(&mut state);
                }
                if state.stopped {
                    return;
                }
            } else {
                if frame.has_token() {
                    error!(
                        "dropping flow-control-token-bearing frame from a full, non-blocking stream reader"
                    );
                } else {
                    warn!("stream reader queue full, dropping frame");
                }
                return;
            }
        }
        state.queue.push_back(frame);
        self.num_pushed.fetch_add(1, Ordering::Relaxed);
        self.rates.lock().record_push(self.now_ms());
        drop(state);
        self.not_empty.notify_one();
    }

    /// Blocks until a frame is available, the reader is stopped, or (if
    /// `timeout` is `Some`) the timeout elapses. `None` on timeout or stop.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.queue.pop_front() {
                self.num_popped.fetch_add(1, Ordering::Relaxed);
                self.rates.lock().record_pop(self.now_ms());
                drop(state);
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.stopped {
                return None;
            }
            match timeout {
                Some(d) => {
                    let result = self.not_empty.wait_for(&mut state, d);
                    if result.timed_out() && state.queue.is_empty() {
                        return None;
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Unblocks any pending push/pop so that `Operator::stop` can join its
    /// worker thread without risk of deadlock.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn push_fps(&self) -> f64 {
        self.rates.lock().push_fps()
    }

    pub fn pop_fps(&self) -> f64 {
        self.rates.lock().pop_fps()
    }

    /// Lifetime average pop rate: frames popped divided by elapsed time
    /// since the first pop.
    pub fn historical_fps(&self) -> f64 {
        let rates = self.rates.lock();
        match rates.first_pop_ms {
            Some(first) if self.now_ms() > first => {
                let elapsed_s = (self.now_ms() - first) / 1000.0;
                self.num_popped.load(Ordering::Relaxed) as f64 / elapsed_s
            }
            _ => 0.0,
        }
    }

    pub fn num_pushed(&self) -> u64 {
        self.num_pushed.load(Ordering::Relaxed)
    }

    pub fn num_popped(&self) -> u64 {
        self.num_popped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named, one-producer/many-consumer channel of [`Frame`]s. Each [`Stream::subscribe`] call registers an independent
/// [`StreamReader`]; [`Stream::push`] fans a frame out to all of them.
pub struct Stream {
    name: String,
    readers: Mutex<Vec<Arc<StreamReader>>>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            readers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new reader with its own queue depth, default 16.
    pub fn subscribe(self: &Arc<Self>, max_buffer_size: Option<usize>) -> Arc<StreamReader> {
        let reader = StreamReader::new(max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE));
        self.readers.lock().push(Arc::clone(&reader));
        reader
    }

    /// Removes `reader`; it becomes invalid for future pushes from this
    /// stream (existing `Arc` handles elsewhere still work for draining).
    pub fn unsubscribe(&self, reader: &Arc<StreamReader>) {
        let mut readers = self.readers.lock();
        readers.retain(|r| !Arc::ptr_eq(r, reader));
    }

    /// Fan-out push: 0 readers drops with a debug log; 1 reader moves the
    /// frame; N readers deep-copy into each.
    pub fn push(&self, frame: Frame, block: bool) {
        let readers = self.readers.lock();
        match readers.len() {
            0 => {
                debug!("stream {:?} has no readers, dropping frame", self.name);
            }
            1 => {
                readers[0].push(frame, block);
            }
            _ => {
                for reader in readers.iter().take(readers.len() - 1) {
                    reader.push(frame.clone(), block);
                }
                readers[readers.len() - 1].push(frame, block);
            }
        }
    }

    /// Stops every registered reader, unblocking any pending push/pop.
    pub fn stop(&self) {
        for reader in self.readers.lock().iter() {
            reader.stop();
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_push_single_reader_moves_frame() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(None);
        let mut f = Frame::new();
        f.set_frame_id(1);
        stream.push(f, false);
        let popped = reader.pop(None).unwrap();
        assert_eq!(popped.frame_id(), Some(1));
    }

    #[test]
    fn push_with_no_readers_drops_silently() {
        let stream = Stream::new("s");
        stream.push(Frame::new(), false);
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn fan_out_delivers_independent_copies() {
        let stream = Stream::new("s");
        let r1 = stream.subscribe(None);
        let r2 = stream.subscribe(None);
        let mut f = Frame::new();
        f.set("x", 7i32);
        stream.push(f, false);
        assert_eq!(r1.pop(None).unwrap().get::<i32>("x").unwrap(), 7);
        assert_eq!(r2.pop(None).unwrap().get::<i32>("x").unwrap(), 7);
    }

    #[test]
    fn delivery_order_matches_arrival_order() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(None);
        for i in 0..5u64 {
            let mut f = Frame::new();
            f.set_frame_id(i);
            stream.push(f, false);
        }
        for i in 0..5u64 {
            assert_eq!(reader.pop(None).unwrap().frame_id(), Some(i));
        }
    }

    #[test]
    fn stop_unblocks_pop() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(None);
        stream.stop();
        assert!(reader.pop(None).is_none());
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(None);
        let start = Instant::now();
        assert!(reader.pop(Some(Duration::from_millis(15))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn unsubscribe_removes_reader_from_fanout() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(None);
        stream.unsubscribe(&reader);
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn non_blocking_push_drops_when_full() {
        let stream = Stream::new("s");
        let reader = stream.subscribe(Some(2));
        for _ in 0..5 {
            stream.push(Frame::new(), false);
        }
        assert_eq!(reader.len(), 2);
    }
}
