// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serialized delivery of user callbacks.
//!
//! Engine code queues closures while holding topic locks; a dedicated
//! thread drains the queue in order, so application callbacks never run
//! under an engine lock and never race with each other. When the
//! application supplies its own [`Executor`], the thread hands each task to
//! it instead of running it.

use parking_lot::{Condvar, Mutex};
use crossbeam::channel::{self, Sender};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

/// Unit of work queued for the application.
pub type Task = Box<dyn FnOnce() + Send>;

/// Application-supplied executor, called once per task and in queue order.
pub type Executor = Arc<dyn Fn(Task) + Send + Sync>;

pub(crate) struct CallbackExecutor {
    sender: Mutex<Option<Sender<Task>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CallbackExecutor {
    pub(crate) fn new(name: &str, custom: Option<Executor>) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<Task>();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let counter = pending.clone();

        let worker = std::thread::Builder::new()
            .name(format!("ds-callbacks-{}", name))
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    match &custom {
                        Some(executor) => executor(task),
                        None => task(),
                    }
                    let (count, cond) = &*counter;
                    let mut count = count.lock();
                    *count -= 1;
                    if *count == 0 {
                        cond.notify_all();
                    }
                }
                log::trace!("[EXECUTOR] stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            pending,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn queue(&self, task: Task) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            log::trace!("[EXECUTOR] dropping callback queued after shutdown");
            return;
        };
        *self.pending.0.lock() += 1;
        if tx.send(task).is_err() {
            *self.pending.0.lock() -= 1;
        }
    }

    /// Block until every task queued so far has run (or been handed to the
    /// custom executor). Returns immediately on the executor thread.
    pub(crate) fn flush(&self) {
        if std::thread::current().id() == self.worker_id {
            return;
        }
        let (count, cond) = &*self.pending;
        let mut count = count.lock();
        while *count > 0 {
            cond.wait(&mut count);
        }
    }

    /// Run the remaining tasks and stop the thread.
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if std::thread::current().id() != self.worker_id {
            if let Some(worker) = self.worker.lock().take() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_order() {
        let executor = CallbackExecutor::new("test", None).expect("executor");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            executor.queue(Box::new(move || seen.lock().push(i)));
        }
        executor.flush();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_custom_executor_receives_tasks() {
        let handed = Arc::new(Mutex::new(0usize));
        let counter = handed.clone();
        let custom: Executor = Arc::new(move |task: Task| {
            *counter.lock() += 1;
            task();
        });
        let executor = CallbackExecutor::new("custom", Some(custom)).expect("executor");

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        executor.queue(Box::new(move || *flag.lock() = true));
        executor.flush();

        assert_eq!(*handed.lock(), 1);
        assert!(*ran.lock());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let executor = CallbackExecutor::new("drain", None).expect("executor");
        let seen = Arc::new(Mutex::new(0usize));
        for _ in 0..10 {
            let seen = seen.clone();
            executor.queue(Box::new(move || *seen.lock() += 1));
        }
        executor.shutdown();
        assert_eq!(*seen.lock(), 10);

        // Late tasks are dropped.
        executor.queue(Box::new(|| panic!("must not run")));
        executor.flush();
    }
}
