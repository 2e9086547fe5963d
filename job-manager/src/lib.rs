//! Job manager: generates, dispatches, collects and commits tasks.

pub mod config;
pub mod pull;
pub mod push;
pub mod state;

use crate::config::AppSettings;
use crate::pull::{run_pull_engine, ModuleResultSink};
use crate::push::{run_push_engine, ModuleTaskSource};
use crate::state::JobState;
use anyhow::{anyhow, Result};
use log::{info, warn};
use spits::endpoint::Endpoint;
use spits::fleet::load_fleet;
use spits::messaging::MSG_TERMINATE;
use spits::JobBinary;
use std::sync::Arc;
use std::thread;

/// Drive one job: run both engines against the fleet, then close out the
/// job with the committer. Returns the final job status and the aggregate
/// result bytes, if the module produced any.
pub fn run(
    job: &Arc<JobBinary>,
    settings: &AppSettings,
    margs: &[String],
) -> Result<(i64, Option<Vec<u8>>)> {
    let state = Arc::new(JobState::new());

    info!("starting job manager...");
    let jm_handle = job.job_manager_new(margs)?;
    let push_thread = {
        let job = job.clone();
        let state = state.clone();
        let settings = settings.clone();
        thread::spawn(move || {
            let mut source = ModuleTaskSource {
                job: &job,
                handle: &jm_handle,
            };
            run_push_engine(&mut source, &state, &settings);
        })
    };

    info!("starting committer...");
    let co_handle = job.committer_new(margs)?;
    let pull_thread = {
        let job = job.clone();
        let state = state.clone();
        let settings = settings.clone();
        thread::spawn(move || {
            {
                let mut sink = ModuleResultSink {
                    job: &job,
                    handle: &co_handle,
                };
                run_pull_engine(&mut sink, &state, &settings);
            }
            // Hand the committer back for the final commit.
            co_handle
        })
    };

    push_thread
        .join()
        .map_err(|_| anyhow!("the push engine panicked"))?;
    let co_handle = pull_thread
        .join()
        .map_err(|_| anyhow!("the pull engine panicked"))?;

    info!("committing job...");
    let (status, result) = job.commit_job(&co_handle)?;
    Ok((status, result))
}

/// Send a termination message to every task manager in the node list.
pub fn kill_task_managers(settings: &AppSettings) {
    info!("killing task managers...");

    let fleet = match load_fleet(&settings.nodefile) {
        Ok(fleet) => fleet,
        Err(err) => {
            warn!("could not load the list of task managers: {:#}", err);
            return;
        }
    };

    for node in fleet.iter() {
        let mut tm = Endpoint::new(node.address.clone(), node.port);
        let sent = tm
            .open(settings.conn_timeout)
            .and_then(|_| tm.write_i64(MSG_TERMINATE));
        if let Err(err) = sent {
            warn!(
                "error connecting to task manager at {}: {}",
                tm.peer_name(),
                err
            );
        }
        tm.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_kill_pass_sends_terminate_to_every_node() {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let second = TcpListener::bind("127.0.0.1:0").unwrap();

        let mut nodefile = tempfile::NamedTempFile::new().unwrap();
        writeln!(nodefile, "node 127.0.0.1:{}", first.local_addr().unwrap().port()).unwrap();
        writeln!(nodefile, "node 127.0.0.1:{}", second.local_addr().unwrap().port()).unwrap();

        let expect_terminate = |listener: TcpListener| {
            thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut conn = Endpoint::from_tcp(stream, "jm", 0);
                conn.read_i64(Some(Duration::from_secs(5))).unwrap()
            })
        };
        let first = expect_terminate(first);
        let second = expect_terminate(second);

        let mut settings = AppSettings::default();
        settings.nodefile = nodefile.path().to_path_buf();
        settings.conn_timeout = Some(Duration::from_secs(5));
        kill_task_managers(&settings);

        assert_eq!(first.join().unwrap(), MSG_TERMINATE);
        assert_eq!(second.join().unwrap(), MSG_TERMINATE);
    }

    #[test]
    fn test_kill_pass_survives_dead_nodes() {
        let gone = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = gone.local_addr().unwrap().port();
        drop(gone);

        let mut nodefile = tempfile::NamedTempFile::new().unwrap();
        writeln!(nodefile, "node 127.0.0.1:{}", port).unwrap();

        let mut settings = AppSettings::default();
        settings.nodefile = nodefile.path().to_path_buf();
        settings.conn_timeout = Some(Duration::from_millis(200));
        kill_task_managers(&settings);
    }
}
