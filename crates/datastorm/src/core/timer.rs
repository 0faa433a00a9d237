// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-thread timer for session retry tasks.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type TimerTask = Box<dyn FnOnce() + Send>;

/// Id of a scheduled task, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

pub(crate) struct Timer {
    inner: Arc<TimerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, TimerTask>,
    next_id: u64,
    stopped: bool,
}

impl Timer {
    pub(crate) fn new(name: &str) -> std::io::Result<Self> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });
        let shared = inner.clone();
        let worker = std::thread::Builder::new()
            .name(format!("ds-timer-{}", name))
            .spawn(move || run(&shared))?;
        Ok(Self {
            inner,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run `task` after `delay` unless cancelled first.
    pub(crate) fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerId {
        let mut state = self.inner.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        if state.stopped {
            return TimerId(id);
        }
        state.queue.push(Reverse((Instant::now() + delay, id)));
        state.tasks.insert(id, Box::new(task));
        self.inner.cond.notify_one();
        TimerId(id)
    }

    /// Cancel a pending task. Returns `false` if it already ran.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        self.inner.state.lock().tasks.remove(&id.0).is_some()
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.tasks.clear();
            state.queue.clear();
            self.inner.cond.notify_all();
        }
        if std::thread::current().id() != self.worker_id {
            if let Some(worker) = self.worker.lock().take() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: &TimerInner) {
    let mut state = inner.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let next = state.queue.peek().map(|Reverse(entry)| *entry);
        match next {
            None => inner.cond.wait(&mut state),
            Some((deadline, id)) if deadline <= Instant::now() => {
                state.queue.pop();
                if let Some(task) = state.tasks.remove(&id) {
                    drop(state);
                    task();
                    state = inner.state.lock();
                }
            }
            Some((deadline, _)) => {
                inner.cond.wait_until(&mut state, deadline);
            }
        }
    }
    log::trace!("[TIMER] stopped");
}
