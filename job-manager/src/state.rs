//! Shared bookkeeping for in-flight and completed tasks.
//!
//! Both engines touch these tables concurrently: the push engine inserts
//! pending tasks, the pull engine moves them to completed. No invariant
//! spans more than one key, so per-table locks are enough.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A task that was generated but whose result has not been seen yet.
#[derive(Clone, Debug)]
pub struct PendingTask {
    pub retries: u32,
    pub payload: Vec<u8>,
}

/// Worker and committer status recorded for a completed task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompletedRecord {
    pub worker_status: i64,
    pub commit_status: i64,
}

/// In-flight tables shared between the push and pull engines.
#[derive(Default)]
pub struct JobState {
    tasklist: Mutex<HashMap<i64, PendingTask>>,
    completed: Mutex<HashMap<i64, CompletedRecord>>,
    generation_done: AtomicBool,
}

impl JobState {
    pub fn new() -> JobState {
        JobState::default()
    }

    /// Record a freshly generated task. Called before the task ever hits
    /// the network, so a send failure cannot lose the bookkeeping.
    pub fn insert_pending(&self, taskid: i64, payload: Vec<u8>) {
        self.tasklist
            .lock()
            .insert(taskid, PendingTask { retries: 0, payload });
    }

    /// Remove and return a pending task once its result arrived.
    pub fn take_pending(&self, taskid: i64) -> Option<PendingTask> {
        self.tasklist.lock().remove(&taskid)
    }

    pub fn pending_count(&self) -> usize {
        self.tasklist.lock().len()
    }

    pub fn is_completed(&self, taskid: i64) -> bool {
        self.completed.lock().contains_key(&taskid)
    }

    pub fn record_completed(&self, taskid: i64, worker_status: i64, commit_status: i64) {
        self.completed.lock().insert(
            taskid,
            CompletedRecord {
                worker_status,
                commit_status,
            },
        );
    }

    pub fn completed_record(&self, taskid: i64) -> Option<CompletedRecord> {
        self.completed.lock().get(&taskid).copied()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// Flag that the module has no more tasks to generate.
    pub fn mark_generation_done(&self) {
        self.generation_done.store(true, Ordering::SeqCst);
    }

    pub fn generation_done(&self) -> bool {
        self.generation_done.load(Ordering::SeqCst)
    }

    /// The job is over once generation finished and every generated task
    /// has come back.
    pub fn job_done(&self) -> bool {
        self.generation_done() && self.tasklist.lock().is_empty()
    }
}
