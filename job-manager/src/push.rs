//! Task dispatch engine.
//!
//! Generates tasks from the job module and distributes them across the
//! fleet, walking the node list in file order. Each cycle re-reads the
//! node list, offers tasks to every task manager that will take them, and
//! sleeps briefly before the next round. A task the fleet rejects stays in
//! the carry buffer and is offered again to the next task manager.

use crate::config::AppSettings;
use crate::state::JobState;
use anyhow::Result;
use log::{debug, error, info, warn};
use spits::endpoint::Endpoint;
use spits::fleet::{load_fleet, Fleet};
use spits::messaging::{MSG_SEND_FULL, MSG_SEND_MORE, MSG_SEND_RJCT, MSG_SEND_TASK, PUSH_BACKOFF};
use spits::{JobBinary, NetError};
use spits::binary::JobManagerHandle;
use std::thread;

/// Source of task payloads; `None` ends generation.
pub trait TaskSource {
    fn next_task(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Task generation backed by the job module.
pub struct ModuleTaskSource<'a> {
    pub job: &'a JobBinary,
    pub handle: &'a JobManagerHandle,
}

impl TaskSource for ModuleTaskSource<'_> {
    fn next_task(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.job.next_task(self.handle)?)
    }
}

/// Run the dispatch loop until the module stops generating tasks.
pub fn run_push_engine<S: TaskSource>(source: &mut S, state: &JobState, settings: &AppSettings) {
    info!("job manager running...");

    let mut fleet = load_fleet(&settings.nodefile).unwrap_or_else(|err| {
        warn!("could not load the list of task managers: {:#}", err);
        Fleet::default()
    });

    // Task ids are assigned by pre-increment, so the first task is 1.
    let mut taskid: i64 = 0;
    let mut held: Option<Vec<u8>> = None;

    loop {
        // Reload the node list every cycle so task managers can be added
        // on the fly.
        fleet.refresh_from(&settings.nodefile);

        for node in fleet.iter() {
            debug!("connecting to {}...", node.name);
            let mut tm = Endpoint::new(node.address.clone(), node.port);
            if !open_for_pushing(&mut tm, settings) {
                continue;
            }

            debug!("pushing tasks to {}...", node.name);
            let finished = push_tasks(source, &mut tm, state, &mut taskid, &mut held, settings);
            tm.close();
            debug!("finished pushing tasks to {}", node.name);

            if finished {
                info!("all tasks generated");
                state.mark_generation_done();
                return;
            }
        }

        thread::sleep(PUSH_BACKOFF);
    }
}

/// Open the connection and ask whether the task manager takes tasks.
fn open_for_pushing(tm: &mut Endpoint, settings: &AppSettings) -> bool {
    let attempt = (|| -> Result<i64, NetError> {
        tm.open(settings.conn_timeout)?;
        tm.write_i64(MSG_SEND_TASK)?;
        tm.read_i64(settings.recv_timeout)
    })();

    match attempt {
        Ok(MSG_SEND_MORE) => return true,
        Ok(MSG_SEND_FULL) => debug!("task manager at {} is full", tm.peer_name()),
        Ok(other) => error!(
            "unknown response {:#x} from the task manager at {}",
            other,
            tm.peer_name()
        ),
        Err(err) => warn!(
            "error connecting to task manager at {}: {}",
            tm.peer_name(),
            err
        ),
    }

    tm.close();
    false
}

/// Push tasks to one task manager until it is full, rejects, or the module
/// runs out of tasks. Returns `true` when generation finished.
fn push_tasks<S: TaskSource>(
    source: &mut S,
    tm: &mut Endpoint,
    state: &JobState,
    taskid: &mut i64,
    held: &mut Option<Vec<u8>>,
    settings: &AppSettings,
) -> bool {
    loop {
        if held.is_none() {
            // Only generate once the previous task has found a home.
            *taskid += 1;
            let payload = match source.next_task() {
                Ok(Some(payload)) => payload,
                Ok(None) => return true,
                Err(err) => {
                    error!("task generation failed: {:#}", err);
                    return true;
                }
            };

            // Bookkeeping goes in before the bytes go out.
            state.insert_pending(*taskid, payload.clone());
            *held = Some(payload);
            debug!("generated task {}", *taskid);
        }

        debug!("pushing task {}...", *taskid);
        let response = (|| -> Result<i64, NetError> {
            let payload = held.as_deref().unwrap_or(&[]);
            tm.write_i64(*taskid)?;
            tm.write_i64(payload.len() as i64)?;
            tm.write(payload)?;
            tm.read_i64(settings.recv_timeout)
        })();

        match response {
            // Task accepted, keep pushing.
            Ok(MSG_SEND_MORE) => *held = None,
            // Task accepted, but the task manager is now full.
            Ok(MSG_SEND_FULL) => {
                *held = None;
                return false;
            }
            // Task refused; keep it for another task manager.
            Ok(MSG_SEND_RJCT) => {
                warn!(
                    "task manager at {} rejected task {}",
                    tm.peer_name(),
                    *taskid
                );
                return false;
            }
            Ok(other) => {
                error!(
                    "unknown response {:#x} from the task manager at {}",
                    other,
                    tm.peer_name()
                );
                return false;
            }
            Err(err) => {
                // Connection trouble; the task stays held for the next TM.
                debug!("connection lost while pushing task {}: {}", *taskid, err);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};
    use pretty_assertions::assert_eq;
    use spits::messaging::MSG_READ_RESULT;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    struct ScriptedSource {
        tasks: Vec<Vec<u8>>,
    }

    impl TaskSource for ScriptedSource {
        fn next_task(&mut self) -> Result<Option<Vec<u8>>> {
            if self.tasks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.tasks.remove(0)))
            }
        }
    }

    fn test_settings(nodefile: &std::path::Path) -> AppSettings {
        let mut settings = AppSettings::default();
        settings.nodefile = nodefile.to_path_buf();
        settings.conn_timeout = Some(Duration::from_secs(5));
        settings.recv_timeout = Some(Duration::from_secs(5));
        settings
    }

    fn write_nodefile(port: u16) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node 127.0.0.1:{}", port).unwrap();
        file
    }

    /// A task manager that accepts every task and records what it saw.
    fn accepting_tm(listener: TcpListener, seen: Sender<(i64, Vec<u8>)>) {
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut conn = Endpoint::from_tcp(stream, "jm", 0);
                if conn.read_i64(Some(Duration::from_secs(5))).is_err() {
                    continue;
                }
                conn.write_i64(MSG_SEND_MORE).unwrap();
                loop {
                    let taskid = match conn.read_i64(Some(Duration::from_secs(1))) {
                        Ok(id) => id,
                        Err(_) => break,
                    };
                    let size = conn.read_i64(Some(Duration::from_secs(5))).unwrap();
                    let payload = conn
                        .read(size as usize, Some(Duration::from_secs(5)))
                        .unwrap();
                    let _ = seen.send((taskid, payload));
                    conn.write_i64(MSG_SEND_MORE).unwrap();
                }
            }
        });
    }

    #[test]
    fn test_push_three_tasks_to_one_tm() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodefile = write_nodefile(port);

        let (seen_tx, seen_rx) = unbounded();
        accepting_tm(listener, seen_tx);

        let state = Arc::new(JobState::new());
        let mut source = ScriptedSource {
            tasks: vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()],
        };
        run_push_engine(&mut source, &state, &test_settings(nodefile.path()));

        let mut seen = Vec::new();
        while let Ok(task) = seen_rx.try_recv() {
            seen.push(task);
        }
        assert_eq!(
            seen,
            vec![
                (1, b"a".to_vec()),
                (2, b"bb".to_vec()),
                (3, b"ccc".to_vec())
            ]
        );

        assert!(state.generation_done());
        assert_eq!(state.pending_count(), 3);
    }

    #[test]
    fn test_rejected_task_is_offered_again() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodefile = write_nodefile(port);

        let (seen_tx, seen_rx) = unbounded();
        thread::spawn(move || {
            // First connection: accept the handshake, reject the task.
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Endpoint::from_tcp(stream, "jm", 0);
            assert_eq!(
                conn.read_i64(Some(Duration::from_secs(5))).unwrap(),
                MSG_SEND_TASK
            );
            conn.write_i64(MSG_SEND_MORE).unwrap();
            let taskid = conn.read_i64(Some(Duration::from_secs(5))).unwrap();
            let size = conn.read_i64(Some(Duration::from_secs(5))).unwrap();
            conn.read(size as usize, Some(Duration::from_secs(5)))
                .unwrap();
            seen_tx.send(taskid).unwrap();
            conn.write_i64(MSG_SEND_RJCT).unwrap();
            conn.close();

            // Later connections accept everything.
            accepting_tm(listener, {
                let (tx, rx) = unbounded();
                thread::spawn({
                    let seen_tx = seen_tx.clone();
                    move || {
                        while let Ok((taskid, _)) = rx.recv() {
                            let _ = seen_tx.send(taskid);
                        }
                    }
                });
                tx
            });
        });

        let state = Arc::new(JobState::new());
        let mut source = ScriptedSource {
            tasks: vec![b"one".to_vec(), b"two".to_vec()],
        };
        run_push_engine(&mut source, &state, &test_settings(nodefile.path()));

        let mut seen = Vec::new();
        while let Ok(taskid) = seen_rx.recv_timeout(Duration::from_millis(200)) {
            seen.push(taskid);
        }
        // Task 1 was rejected once and re-offered with the same id.
        assert_eq!(seen, vec![1, 1, 2]);
        assert_eq!(state.pending_count(), 2);
    }

    #[test]
    fn test_tm_full_on_handshake_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodefile = write_nodefile(port);

        thread::spawn(move || {
            // Refuse the first connection, accept from then on.
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Endpoint::from_tcp(stream, "jm", 0);
            let _ = conn.read_i64(Some(Duration::from_secs(5)));
            conn.write_i64(MSG_SEND_FULL).unwrap();
            conn.close();

            let (tx, _rx) = unbounded();
            accepting_tm(listener, tx);
        });

        let state = Arc::new(JobState::new());
        let mut source = ScriptedSource {
            tasks: vec![b"t".to_vec()],
        };
        run_push_engine(&mut source, &state, &test_settings(nodefile.path()));
        assert!(state.generation_done());
    }

    #[test]
    fn test_unexpected_handshake_reply_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodefile = write_nodefile(port);

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Endpoint::from_tcp(stream, "jm", 0);
            let _ = conn.read_i64(Some(Duration::from_secs(5)));
            conn.write_i64(MSG_READ_RESULT).unwrap();
            conn.close();

            let (tx, _rx) = unbounded();
            accepting_tm(listener, tx);
        });

        let state = Arc::new(JobState::new());
        let mut source = ScriptedSource { tasks: vec![] };
        run_push_engine(&mut source, &state, &test_settings(nodefile.path()));
        assert!(state.generation_done());
    }
}
