// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread completing backend jobs asynchronously.
//!
//! Jobs are executed in submission order. The result of each job is written once to its
//! completion slot, which the [`WorkerPromise`] returned at submission reads back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use crate::encoder::stateless::BackendPromise;
use crate::encoder::stateless::StatelessBackendError;
use crate::encoder::stateless::StatelessBackendResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkQueue {
    jobs: VecDeque<Job>,
    running: bool,
}

/// Result of a single job, written by the worker thread only.
struct CompletionSlot<T> {
    result: Mutex<Option<StatelessBackendResult<T>>>,
    done: Condvar,
}

impl<T> CompletionSlot<T> {
    fn complete(&self, result: StatelessBackendResult<T>) {
        *self.result.lock().unwrap() = Some(result);
        self.done.notify_all();
    }
}

fn poisoned<G>(_: PoisonError<G>) -> StatelessBackendError {
    StatelessBackendError::Fatal(anyhow::anyhow!("worker thread panicked"))
}

/// [`BackendPromise`] of a job submitted to an [`EncodeWorker`].
pub struct WorkerPromise<T> {
    slot: Arc<CompletionSlot<T>>,
}

impl<T> BackendPromise for WorkerPromise<T> {
    type Output = T;

    fn sync(self) -> StatelessBackendResult<Self::Output> {
        let mut result = self.slot.result.lock().map_err(poisoned)?;
        loop {
            if let Some(done) = result.take() {
                return done;
            }

            result = self.slot.done.wait(result).map_err(poisoned)?;
        }
    }

    fn is_ready(&self) -> bool {
        self.slot
            .result
            .lock()
            .map(|result| result.is_some())
            .unwrap_or(true)
    }
}

pub struct EncodeWorker {
    work_queue: Arc<(Mutex<WorkQueue>, Condvar)>,
    worker_thread: Option<JoinHandle<()>>,
}

impl EncodeWorker {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let work_queue = Arc::new((
            Mutex::new(WorkQueue {
                jobs: VecDeque::new(),
                running: true,
            }),
            Condvar::new(),
        ));

        let queue = work_queue.clone();
        let worker_thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::process_loop(&queue))?;

        Ok(Self {
            work_queue,
            worker_thread: Some(worker_thread),
        })
    }

    fn process_loop(queue: &(Mutex<WorkQueue>, Condvar)) {
        let (lock, wakeup) = queue;

        loop {
            let job = {
                let mut queue = lock.lock().unwrap();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }

                    if !queue.running {
                        log::debug!("encode worker exiting");
                        return;
                    }

                    queue = wakeup.wait(queue).unwrap();
                }
            };

            job();
        }
    }

    /// Queues `job` for execution on the worker thread.
    pub fn submit<T, F>(&self, job: F) -> WorkerPromise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StatelessBackendResult<T> + Send + 'static,
    {
        let slot = Arc::new(CompletionSlot {
            result: Mutex::new(None),
            done: Condvar::new(),
        });

        let completion = slot.clone();
        let (lock, wakeup) = &*self.work_queue;
        lock.lock()
            .unwrap()
            .jobs
            .push_back(Box::new(move || completion.complete(job())));
        wakeup.notify_one();

        WorkerPromise { slot }
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        let (lock, wakeup) = &*self.work_queue;
        if let Ok(mut queue) = lock.lock() {
            queue.running = false;
        }
        wakeup.notify_all();

        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_jobs_complete_in_order() {
        let worker = EncodeWorker::new("test-worker").unwrap();

        let promises: Vec<_> = (0..8u32).map(|i| worker.submit(move || Ok(i * 2))).collect();
        let results: Vec<u32> = promises.into_iter().map(|p| p.sync().unwrap()).collect();

        assert_eq!(results, [0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_promise_not_ready_until_job_runs() {
        let worker = EncodeWorker::new("test-worker").unwrap();
        let (release, gate) = mpsc::channel::<()>();

        let promise = worker.submit(move || {
            gate.recv().unwrap();
            Ok("done")
        });
        assert!(!promise.is_ready());

        release.send(()).unwrap();
        assert_eq!(promise.sync().unwrap(), "done");
    }

    #[test]
    fn test_job_error_is_forwarded() {
        let worker = EncodeWorker::new("test-worker").unwrap();

        let promise = worker.submit(|| -> StatelessBackendResult<()> {
            Err(StatelessBackendError::OutOfResources)
        });
        assert!(matches!(
            promise.sync(),
            Err(StatelessBackendError::OutOfResources)
        ));
    }

    #[test]
    fn test_pending_jobs_run_before_exit() {
        let worker = EncodeWorker::new("test-worker").unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            let _ = worker.submit(move || {
                tx.send(i).unwrap();
                Ok(())
            });
        }
        drop(worker);

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [0, 1, 2, 3]);
    }
}
