//! End-to-end flow control.
//!
//! A [`FlowControlEntrance`] bounds the number of frames simultaneously in
//! flight to a fixed token budget; a paired [`FlowControlExit`] releases
//! those tokens once a frame leaves the guarded segment. The mutex +
//! condvar pairing mirrors [`crate::stream::StreamReader`]'s own
//! blocking-queue shape, using `parking_lot` instead of `std::sync` the way
//! the rest of this crate does on hot paths.
//!
//! The back-reference a [`FlowControlToken`] carries is a `Weak` pointer
//! into the entrance: relation and lookup, never ownership. A token can
//! outlive its entrance (e.g. a frame stuck in a buffer past pipeline
//! teardown) without keeping the entrance's resources alive, and cannot be
//! used to extend the entrance's lifetime.

use log::{error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Back-reference a [`crate::frame::Frame`] carries while it is inside a
/// flow-controlled segment. Opaque; frames only ever pass it to
/// [`FlowControlExit::release`] or have it set by [`FlowControlEntrance`].
#[derive(Clone)]
pub struct FlowControlToken {
    entrance: Weak<Inner>,
    frame_id: u64,
}

impl std::fmt::Debug for FlowControlToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControlToken")
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

impl PartialEq for FlowControlToken {
    fn eq(&self, other: &Self) -> bool {
        self.frame_id == other.frame_id && Weak::ptr_eq(&self.entrance, &other.entrance)
    }
}

impl FlowControlToken {
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Releases this token back to the issuing entrance, if it still
    /// exists. A no-op if the entrance has already been torn down — the
    /// whole point of the weak back-reference is that this can never be a
    /// use-after-free.
    pub fn release(&self) {
        if let Some(inner) = self.entrance.upgrade() {
            inner.release(self.frame_id);
        } else {
            warn!(
                "released flow-control token {} after its entrance was dropped",
                self.frame_id
            );
        }
    }
}

struct Inner {
    budget: u32,
    available: Mutex<u32>,
    not_empty: Condvar,
    outstanding: Mutex<BTreeSet<u64>>,
    stopped: std::sync::atomic::AtomicBool,
    next_frame_id: AtomicU64,
}

impl Inner {
    fn release(&self, frame_id: u64) {
        let mut outstanding = self.outstanding.lock();
        if !outstanding.remove(&frame_id) {
            // Double release, or a release for a frame this entrance never
            // stamped. This is a logic error in an operator, not a
            // transient condition.
            error!(
                "flow-control release for frame {frame_id} that was not outstanding"
            );
            return;
        }
        drop(outstanding);
        let mut available = self.available.lock();
        *available += 1;
        self.not_empty.notify_one();
    }
}

/// Owns a fixed token budget. For each non-stop frame it
/// admits: acquires one token (blocking until one is free), stamps the
/// frame with a [`FlowControlToken`], and records the frame as outstanding.
pub struct FlowControlEntrance {
    inner: Arc<Inner>,
}

impl FlowControlEntrance {
    /// `budget` must be greater than zero.
    pub fn new(budget: u32) -> Self {
        assert!(budget > 0, "flow-control token budget must be > 0");
        Self {
            inner: Arc::new(Inner {
                budget,
                available: Mutex::new(budget),
                not_empty: Condvar::new(),
                outstanding: Mutex::new(BTreeSet::new()),
                stopped: std::sync::atomic::AtomicBool::new(false),
                next_frame_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn budget(&self) -> u32 {
        self.inner.budget
    }

    /// Number of tokens currently checked out.
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Acquires one token, blocking while the budget is exhausted, then
    /// stamps `frame` and registers it as outstanding. Returns `None` if
    /// [`Self::stop`] was called while waiting — the caller (the
    /// `FlowControlEntrance` operator wrapper) should treat that as "stop
    /// propagating, abandon the frame".
    pub fn admit(&self, frame: &mut crate::frame::Frame) -> Option<()> {
        let mut available = self.inner.available.lock();
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return None;
            }
            if *available > 0 {
                break;
            }
            self.inner.not_empty.wait(&mut available);
        }
        *available -= 1;
        drop(available);

        let frame_id = frame
            .frame_id()
            .unwrap_or_else(|| self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed));
        self.inner.outstanding.lock().insert(frame_id);
        frame.stamp_token(FlowControlToken {
            entrance: Arc::downgrade(&self.inner),
            frame_id,
        });
        Some(())
    }

    /// Releases the token held for `frame_id`, if any, and wakes one
    /// waiter. Any operator holding a token may call this directly — e.g. a
    /// `Throttler` releasing tokens for frames it drops.
    pub fn release(&self, frame_id: u64) {
        self.inner.release(frame_id);
    }

    /// Wakes every blocked [`Self::admit`] call so that `Operator::stop`
    /// can join the worker thread.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _guard = self.inner.available.lock();
        self.inner.not_empty.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

/// Stateless apart from the routing of frames back to the issuing entrance
///. Releases a frame's token and clears the stamp before
/// forwarding.
#[derive(Default)]
pub struct FlowControlExit;

impl FlowControlExit {
    pub fn new() -> Self {
        Self
    }

    /// If `frame` carries a token, releases it and clears the stamp.
    /// No-op for frames that never entered a flow-controlled segment, and
    /// for stop frames.
    pub fn pass(&self, frame: &mut crate::frame::Frame) {
        if frame.is_stop_frame() {
            return;
        }
        if let Some(token) = frame.take_token() {
            token.release();
        }
    }
}

/// Process-wide lookup of live [`FlowControlEntrance`]s, keyed by the
/// operator name they were constructed for. Carried on
/// [`crate::context::Runtime`] so [`crate::pipeline::Pipeline::stop`] can
/// unblock every entrance's blocked `admit` calls *before* joining operator
/// worker threads — otherwise a `FlowControlEntranceOp` stuck waiting for a
/// token would make `Operator::stop`'s join hang forever.
#[derive(Clone, Default)]
pub struct FlowControlRegistry {
    entrances: Arc<Mutex<HashMap<String, Arc<FlowControlEntrance>>>>,
}

impl FlowControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operator_name: impl Into<String>, entrance: Arc<FlowControlEntrance>) {
        self.entrances.lock().insert(operator_name.into(), entrance);
    }

    pub fn get(&self, operator_name: &str) -> Option<Arc<FlowControlEntrance>> {
        self.entrances.lock().get(operator_name).cloned()
    }

    /// Wakes every registered entrance's blocked `admit` callers. Idempotent.
    pub fn stop_all(&self) {
        for entrance in self.entrances.lock().values() {
            entrance.stop();
        }
    }
}

impl std::fmt::Debug for FlowControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControlRegistry")
            .field("len", &self.entrances.lock().len())
            .finish()
    }
}
