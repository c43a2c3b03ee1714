//! C6: serializes outcomes from however many parser threads are running into the single
//! user-supplied sink, while maintaining the progress bookkeeping the executor's contract
//! promises callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::decode::decode_frame;
use crate::testcase::ProgressSink;
use crate::wire::ParsedFrame;

struct Inner<S> {
    sink: S,
    stopped: bool,
}

/// A cheaply-clonable handle; every parser thread gets its own clone and calls [`Forwarder::forward`]
/// as frames arrive. All clones share one underlying mutex, so outcomes from different workers never
/// interleave inside the sink (property I5).
pub struct Forwarder<S: ProgressSink> {
    inner: Arc<Mutex<Inner<S>>>,
    total_in_worker: HashMap<usize, usize>,
    grand_total: usize,
    start: Instant,
}

impl<S: ProgressSink> Clone for Forwarder<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            total_in_worker: self.total_in_worker.clone(),
            grand_total: self.grand_total,
            start: self.start,
        }
    }
}

impl<S: ProgressSink> Forwarder<S> {
    pub fn new(sink: S, total_in_worker: HashMap<usize, usize>, grand_total: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sink,
                stopped: false,
            })),
            total_in_worker,
            grand_total,
            start: Instant::now(),
        }
    }

    /// Stop forwarding further outcomes. Called on every live forwarder when the parent hits an
    /// unrecoverable error, so in-flight outcomes get dropped instead of half-applied.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
    }

    /// Records progress for `frame`'s test, then decodes and forwards it (and any nested
    /// sub-tests) into the wrapped sink. No-op if [`Forwarder::stop`] was already called.
    pub fn forward(&self, worker_id: usize, frame: ParsedFrame) {
        let mut guard = self.inner.lock();
        if guard.stopped {
            return;
        }

        let test_id = frame.outcome.test_id.clone();
        let elapsed = self.start.elapsed().as_secs_f64();
        let total_in_worker = *self.total_in_worker.get(&worker_id).unwrap_or(&0);

        guard.sink.start_time().insert(test_id.clone(), elapsed);
        guard
            .sink
            .worker_progress()
            .entry(worker_id)
            .or_default()
            .push(test_id.clone());
        let done_in_worker = guard.sink.worker_progress()[&worker_id].len();
        let done_global: usize = guard.sink.worker_progress().values().map(Vec::len).sum();
        guard.sink.progress_info().insert(
            test_id.clone(),
            format!(
                "{worker_id}: {done_in_worker}/{total_in_worker} {done_global}/{} ({elapsed:.2}s) ({test_id})",
                self.grand_total,
            ),
        );

        decode_frame(frame, &mut guard.sink);
    }
}
