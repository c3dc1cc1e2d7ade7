//! Ordered asynchronous work streams.
//!
//! A stream is a FIFO job queue drained by a dedicated worker thread.
//! `submit` never blocks; `wait` blocks until every submitted job has run.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared state between a stream handle and its worker thread.
pub(super) struct StreamCore {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl StreamCore {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn enqueue(&self) {
        *self.pending.lock().expect("stream state poisoned") += 1;
    }

    fn finish(&self) {
        let mut pending = self.pending.lock().expect("stream state poisoned");
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until the stream has no pending jobs.
    pub(super) fn wait(&self) {
        let mut pending = self.pending.lock().expect("stream state poisoned");
        while *pending > 0 {
            pending = self
                .drained
                .wait(pending)
                .expect("stream state poisoned");
        }
    }
}

/// Handle to an ordered asynchronous stream.
///
/// Dropping the handle shuts the worker down after it drains the queue.
pub struct Stream {
    core: Arc<StreamCore>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(super) fn spawn() -> Self {
        let core = Arc::new(StreamCore::new());
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name("symboost-stream".to_owned())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                    worker_core.finish();
                }
            })
            .expect("failed to spawn stream worker");

        Self {
            core,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub(super) fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }

    /// Submit a job; runs after all previously submitted jobs.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue();
        self.sender
            .as_ref()
            .expect("stream already shut down")
            .send(Box::new(job))
            .expect("stream worker terminated");
    }

    /// Block until every submitted job has completed.
    pub fn wait(&self) {
        self.core.wait();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain remaining jobs and exit.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
