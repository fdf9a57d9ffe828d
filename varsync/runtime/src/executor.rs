//! Serialized access to a runtime that must not be called concurrently.
//!
//! One worker thread owns the runtime. Callers on any thread submit closures
//! and block on a reply channel, so calls against one session are linearized
//! without a global lock. Calling [`Executor::execute`] from inside a job
//! deadlocks.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use crate::error::SyncError;

type Job<R> = Box<dyn FnOnce(&mut R) + Send>;

pub struct Executor<R> {
    tx: Option<Sender<Job<R>>>,
    worker: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> Executor<R> {
    pub fn spawn(label: &str, mut runtime: R) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<R>>();
        let worker = thread::Builder::new()
            .name(format!("varsync-exec-{label}"))
            .spawn(move || {
                for job in rx {
                    job(&mut runtime);
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn execute<T, F>(&self, job: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut R) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.submit(move |runtime| {
            let _ = reply_tx.send(job(runtime));
        })?;
        reply_rx.recv().map_err(|_| SyncError::ExecutorClosed)
    }

    pub fn submit<F>(&self, job: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut R) + Send + 'static,
    {
        self.tx
            .as_ref()
            .ok_or(SyncError::ExecutorClosed)?
            .send(Box::new(job))
            .map_err(|_| SyncError::ExecutorClosed)
    }
}

impl<R> Drop for Executor<R> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("executor worker panicked");
        }
    }
}
