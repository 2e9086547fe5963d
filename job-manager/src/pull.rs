//! Result collection engine.
//!
//! Drains completed results from every task manager in the fleet, feeds
//! each to the committer, and keeps the in-flight tables in step. Exits
//! once generation has finished and no task is outstanding.

use crate::config::AppSettings;
use crate::state::JobState;
use anyhow::Result;
use log::{debug, error, info, warn};
use spits::binary::CommitterHandle;
use spits::endpoint::Endpoint;
use spits::fleet::{load_fleet, Fleet};
use spits::messaging::{
    module_flags, module_status, MSG_READ_EMPTY, MSG_READ_RESULT, PULL_BACKOFF, RES_MODULE_CTXER,
    RES_MODULE_ERROR, RES_MODULE_NOANS,
};
use spits::{JobBinary, NetError};
use std::thread;

/// Destination for task results; returns the committer status code.
pub trait ResultSink {
    fn commit_task(&mut self, result: &[u8]) -> Result<i64>;
}

/// Committing backed by the job module.
pub struct ModuleResultSink<'a> {
    pub job: &'a JobBinary,
    pub handle: &'a CommitterHandle,
}

impl ResultSink for ModuleResultSink<'_> {
    fn commit_task(&mut self, result: &[u8]) -> Result<i64> {
        Ok(self.job.commit_pit(self.handle, result)?)
    }
}

/// Run the collection loop until every generated task has been committed.
pub fn run_pull_engine<S: ResultSink>(sink: &mut S, state: &JobState, settings: &AppSettings) {
    info!("committer running...");

    let mut fleet = load_fleet(&settings.nodefile).unwrap_or_else(|err| {
        warn!("could not load the list of task managers: {:#}", err);
        Fleet::default()
    });

    loop {
        fleet.refresh_from(&settings.nodefile);

        for node in fleet.iter() {
            debug!("connecting to {}...", node.name);
            let mut tm = Endpoint::new(node.address.clone(), node.port);
            if !open_for_pulling(&mut tm, settings) {
                continue;
            }

            debug!("pulling results from {}...", node.name);
            drain_results(sink, &mut tm, state, settings);
            tm.close();
            debug!("finished pulling results from {}", node.name);

            if state.job_done() {
                info!("all tasks committed");
                return;
            }
        }

        thread::sleep(PULL_BACKOFF);
    }
}

/// Open the connection and ask the task manager for results.
fn open_for_pulling(tm: &mut Endpoint, settings: &AppSettings) -> bool {
    let attempt = (|| -> Result<(), NetError> {
        tm.open(settings.conn_timeout)?;
        tm.write_i64(MSG_READ_RESULT)
    })();

    if let Err(err) = attempt {
        warn!(
            "error connecting to task manager at {}: {}",
            tm.peer_name(),
            err
        );
        tm.close();
        return false;
    }
    true
}

/// Receive and commit results until the task manager reports an empty
/// queue or the connection fails.
fn drain_results<S: ResultSink>(
    sink: &mut S,
    tm: &mut Endpoint,
    state: &JobState,
    settings: &AppSettings,
) {
    loop {
        let taskid = match tm.read_i64(settings.recv_timeout) {
            Ok(MSG_READ_EMPTY) => return,
            Ok(taskid) => taskid,
            Err(err) => {
                debug!("connection lost while pulling results: {}", err);
                return;
            }
        };

        let received = (|| -> Result<(i64, Vec<u8>), NetError> {
            let status = tm.read_i64(settings.recv_timeout)?;
            let size = tm.read_i64(settings.recv_timeout)?;
            if size < 0 {
                return Err(NetError::Protocol(format!("negative result size {}", size)));
            }
            let bytes = tm.read(size as usize, settings.recv_timeout)?;
            // Confirm receipt before committing; from here on the result
            // is this process's responsibility.
            tm.write_i64(MSG_READ_RESULT)?;
            Ok((status, bytes))
        })();

        let (status, bytes) = match received {
            Ok(frame) => frame,
            Err(err) => {
                warn!("error while receiving task {}: {}", taskid, err);
                return;
            }
        };

        commit_result(sink, state, taskid, status, &bytes);
    }
}

/// Bookkeeping and committer hand-off for one received result.
pub(crate) fn commit_result<S: ResultSink>(
    sink: &mut S,
    state: &JobState,
    taskid: i64,
    status: i64,
    bytes: &[u8],
) {
    match module_flags(status) {
        RES_MODULE_ERROR => error!("the remote worker crashed while executing task {}", taskid),
        RES_MODULE_NOANS => error!("task {} did not push any result", taskid),
        RES_MODULE_CTXER => error!("context verification failed for task {}", taskid),
        _ => {}
    }
    if module_status(status) != 0 {
        error!(
            "the task {} was not successfully executed, worker returned {}",
            taskid,
            module_status(status)
        );
    }

    let duplicate = state.is_completed(taskid);
    if duplicate {
        warn!("the task {} was received more than once", taskid);
    }

    let pending = state.take_pending(taskid);
    if pending.is_none() && !duplicate {
        // Neither in flight nor completed: the result is a stray. Commit
        // it anyway and let the committer decide.
        error!("the task {} was not in the working list", taskid);
    }

    let commit_status = match sink.commit_task(bytes) {
        Ok(status) => status,
        Err(err) => {
            error!("the committer failed for task {}: {:#}", taskid, err);
            -1
        }
    };
    if commit_status != 0 {
        error!(
            "the task {} was not successfully committed, committer returned {}",
            taskid, commit_status
        );
    }

    state.record_completed(taskid, status, commit_status);
}
