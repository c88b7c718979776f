//! Blocking worker pool
//!
//! Jobs run on tokio's blocking thread pool and are handed back to the
//! owning thread through a channel. Each finished job signals the shared
//! [`Notifier`] so the owning thread's event loop wakes up and calls
//! [`BlockingPool::finished`].

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::runtime::{Builder, Runtime};

use super::error::{IoError, IoResult};
use super::notify::Notifier;

/// Unit of work for a [`BlockingPool`]
pub trait Job: Send + 'static {
    type Output;

    /// Runs on a worker thread
    fn run(&mut self);

    /// Runs on the owning thread once `run` has returned
    fn done(self) -> Self::Output;
}

/// Bounded pool of threads for blocking syscalls
pub struct BlockingPool<J: Job> {
    runtime: Option<Runtime>,
    tx: Sender<J>,
    rx: Receiver<J>,
    notifier: Arc<Notifier>,
    workers: usize,
    outstanding: usize,
}

impl<J: Job> BlockingPool<J> {
    /// Create a pool of at most `workers` threads named `name`
    pub fn new(name: &str, workers: usize, notifier: Arc<Notifier>) -> IoResult<Self> {
        let workers = workers.max(1);
        let runtime = Builder::new_current_thread()
            .max_blocking_threads(workers)
            .thread_name(name)
            .build()
            .map_err(|source| IoError::Setup {
                op: "worker pool",
                source,
            })?;
        let (tx, rx) = unbounded();

        tracing::info!(name, workers, "blocking pool started");
        Ok(Self {
            runtime: Some(runtime),
            tx,
            rx,
            notifier,
            workers,
            outstanding: 0,
        })
    }

    /// Queue a job; it runs as soon as a worker is free
    pub fn submit(&mut self, mut job: J) {
        let Some(runtime) = self.runtime.as_ref() else {
            panic!("job submitted to a stopped pool");
        };
        let tx = self.tx.clone();
        let notifier = self.notifier.clone();
        runtime.spawn_blocking(move || {
            job.run();
            // The receiver lives as long as the pool, which outlives its jobs
            let _ = tx.send(job);
            notifier.notify();
        });
        self.outstanding += 1;
    }

    /// Run `done` for every job that has finished, passing each output to `f`
    pub fn finished(&mut self, mut f: impl FnMut(J::Output)) -> usize {
        let mut n = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.outstanding -= 1;
            f(job.done());
            n += 1;
        }
        n
    }

    /// Jobs submitted whose `done` has not run yet
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop the pool, joining its threads
    ///
    /// Running jobs are waited for; queued jobs that have not started are
    /// dropped without running.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            drop(runtime);
            tracing::debug!(outstanding = self.outstanding, "blocking pool stopped");
        }
    }
}

impl<J: Job> Drop for BlockingPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
