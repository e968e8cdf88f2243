use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives the fraction of a read that has completed, in `[0, 1]`.
///
/// Called from rayon worker threads, possibly out of order.
pub trait ProgressSink: Sync {
    fn report(&self, fraction: f32);
}

impl<F> ProgressSink for F
where
    F: Fn(f32) + Sync,
{
    fn report(&self, fraction: f32) {
        self(fraction)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f32) {}
}

/// Counts finished chunks and reports the running fraction.
pub(crate) struct ChunkCounter<'a> {
    done: AtomicUsize,
    total: usize,
    sink: &'a dyn ProgressSink,
}

impl<'a> ChunkCounter<'a> {
    pub(crate) fn new(total: usize, sink: &'a dyn ProgressSink) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total: total.max(1),
            sink,
        }
    }

    pub(crate) fn finish_one(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink.report(done.min(self.total) as f32 / self.total as f32);
    }
}
