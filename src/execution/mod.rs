//! Explicit execution context for asynchronous device work.
//!
//! Models the accelerator scheduling contract used by the structure search:
//! work is *pushed* onto ordered streams and the orchestrating thread only
//! suspends at explicit barriers (`Stream::wait`, `ExecutionContext::wait_complete`),
//! never at arbitrary points. Each stream preserves submission order, so a
//! helper can submit "accumulate histograms" followed by "score candidates"
//! without an intervening sync.
//!
//! There is no cancellation: once submitted, a job runs to completion.

mod stream;

pub use stream::Stream;

use std::sync::{Arc, Mutex, Weak};

use stream::StreamCore;

/// Device identifier within an execution context.
pub type DeviceId = usize;

/// Execution context owning the device set and the streams handed out to
/// components.
///
/// One context lives per training process and is passed explicitly into
/// every component that submits device work. `wait_complete` is the global
/// barrier required between "submit scores" and "read best split": result
/// buffers are reused across depths, so a read-after-submit race would
/// corrupt the next submission.
pub struct ExecutionContext {
    device_count: usize,
    streams: Mutex<Vec<Weak<StreamCore>>>,
}

impl ExecutionContext {
    /// Create a context for `device_count` devices.
    pub fn new(device_count: usize) -> Self {
        assert!(device_count > 0, "execution context needs at least one device");
        Self {
            device_count,
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Number of devices in this context.
    #[inline]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Request a new ordered stream.
    ///
    /// The stream stays registered with the context for the lifetime of the
    /// returned handle, so `wait_complete` covers it.
    pub fn request_stream(&self) -> Stream {
        let stream = Stream::spawn();
        let mut streams = self.streams.lock().expect("stream registry poisoned");
        // Drop registrations whose streams have already shut down.
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(stream.core()));
        stream
    }

    /// Block until every stream handed out by this context has drained.
    pub fn wait_complete(&self) {
        let cores: Vec<Arc<StreamCore>> = {
            let streams = self.streams.lock().expect("stream registry poisoned");
            streams.iter().filter_map(Weak::upgrade).collect()
        };
        for core in cores {
            core.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stream_preserves_submission_order() {
        let ctx = ExecutionContext::new(1);
        let stream = ctx.request_stream();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.submit(move || log.lock().unwrap().push(i));
        }
        stream.wait();

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn wait_complete_covers_all_streams() {
        let ctx = ExecutionContext::new(2);
        let a = ctx.request_stream();
        let b = ctx.request_stream();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            a.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            let c = Arc::clone(&counter);
            b.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        ctx.wait_complete();

        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn wait_on_idle_stream_returns() {
        let ctx = ExecutionContext::new(1);
        let stream = ctx.request_stream();
        stream.wait();
        ctx.wait_complete();
    }
}
