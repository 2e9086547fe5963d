//! Bounded concurrent task executor.
//!
//! A fixed set of worker threads drains a bounded intake queue of
//! `(taskid, payload)` pairs. The queue holds `max_workers + overfill`
//! entries; offering a task is non-blocking and the caller is expected to
//! reject the task upstream when the offer fails. Workers live for the
//! whole process: there is no shutdown path.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::error;
use std::sync::Arc;
use std::thread;

/// Handle to the worker set and its intake queue.
pub struct TaskPool {
    queue: Sender<(i64, Vec<u8>)>,
}

impl TaskPool {
    /// Spawn `max_workers` workers over an intake queue of
    /// `max_workers + overfill` slots.
    ///
    /// Each worker calls `init` once at startup to obtain its private state
    /// and then reuses that state for every task. A failing `work` call is
    /// logged and the worker picks up the next task.
    pub fn new<S, I, W>(max_workers: usize, overfill: usize, init: I, work: W) -> TaskPool
    where
        S: 'static,
        I: Fn() -> Result<S> + Send + Sync + 'static,
        W: Fn(&mut S, i64, Vec<u8>) -> Result<()> + Send + Sync + 'static,
    {
        let (tx, rx) = bounded(max_workers + overfill);
        let init = Arc::new(init);
        let work = Arc::new(work);

        for _ in 0..max_workers {
            let rx = rx.clone();
            let init = init.clone();
            let work = work.clone();
            thread::spawn(move || worker_loop(&rx, &*init, &*work));
        }

        TaskPool { queue: tx }
    }

    /// Offer a task without blocking. Returns `false` when the queue is
    /// full; the task is not consumed in that case.
    pub fn put(&self, taskid: i64, payload: Vec<u8>) -> bool {
        self.queue.try_send((taskid, payload)).is_ok()
    }

    /// Advisory fullness test. May race with concurrent producers and
    /// consumers; [`TaskPool::put`] is the authoritative check.
    pub fn full(&self) -> bool {
        self.queue.is_full()
    }
}

fn worker_loop<S, I, W>(rx: &Receiver<(i64, Vec<u8>)>, init: &I, work: &W)
where
    I: Fn() -> Result<S>,
    W: Fn(&mut S, i64, Vec<u8>) -> Result<()>,
{
    let mut state = match init() {
        Ok(state) => Some(state),
        Err(err) => {
            error!("worker initialization failed: {:#}", err);
            None
        }
    };

    while let Ok((taskid, payload)) = rx.recv() {
        match state.as_mut() {
            Some(state) => {
                if let Err(err) = work(state, taskid, payload) {
                    error!("the worker crashed while processing task {}: {:#}", taskid, err);
                }
            }
            None => error!("worker has no module state, dropping task {}", taskid),
        }
    }
}
