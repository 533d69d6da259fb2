// Copyright (c) 2024-present, c0-multiset contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A shared-queue worker pool for deferred work
///
/// Deferred multiset destruction and other cleanup is posted here so it
/// never runs on the critical path of the thread dropping the last
/// reference.
///
/// Dropping the queue drains outstanding jobs and joins the workers.
/// Every [`WorkSender`] handed out must be dropped first, so the queue
/// has to outlive the multisets finalized against it.
pub struct WorkQueue {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawns `threads` workers draining one shared queue.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();

                #[allow(clippy::expect_used)]
                std::thread::Builder::new()
                    .name(format!("c0ms-wq-{i}"))
                    .spawn(move || run_jobs(&rx))
                    .expect("failed to spawn workqueue thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Returns a submission handle that can be stored away from the queue.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn sender(&self) -> WorkSender {
        #[allow(clippy::expect_used)]
        WorkSender(self.tx.as_ref().expect("queue is live").clone())
    }

    /// Posts a job.
    pub fn queue<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.sender().queue(job);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit
        drop(self.tx.take());

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// A cloneable submission handle to a [`WorkQueue`]
#[derive(Clone)]
pub struct WorkSender(Sender<Job>);

impl WorkSender {
    /// Posts a job; runs it inline if the workers are already gone.
    pub fn queue<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Err(e) = self.0.send(Box::new(job)) {
            log::warn!("workqueue is gone, running job inline");
            (e.into_inner())();
        }
    }
}

fn run_jobs(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
}
