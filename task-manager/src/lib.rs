//! Task manager: accepts tasks, runs them concurrently, returns results.

pub mod config;
pub mod cqueue;
pub mod server;

use crate::config::AppSettings;
use crate::cqueue::{CompletedTask, CompletionQueue};
use crate::server::{serve_connection, ConnOutcome};
use anyhow::Result;
use log::{error, info, warn};
use spits::errors::NetError;
use spits::messaging::{module_flags, RES_MODULE_CTXER, RES_MODULE_NOANS};
use spits::{JobBinary, Listener, TaskPool};
use std::process;
use std::sync::Arc;

/// Wire the pool, the completion queue and the listener together, then
/// serve until the process is terminated.
pub fn run(job: Arc<JobBinary>, settings: &AppSettings) -> Result<()> {
    let queue = CompletionQueue::new();

    let pool = {
        let init_job = job.clone();
        let init_args = settings.module_args.clone();
        let work_job = job.clone();
        let work_queue = queue.clone();
        Arc::new(TaskPool::new(
            settings.workers,
            settings.overfill,
            move || -> Result<spits::binary::WorkerHandle> {
                info!("initializing worker...");
                Ok(init_job.worker_new(&init_args)?)
            },
            move |worker: &mut spits::binary::WorkerHandle, taskid: i64, payload: Vec<u8>| -> Result<()> {
                info!("processing task {}...", taskid);
                let result = work_job.worker_run(worker, taskid, &payload)?;
                info!("task {} processed", taskid);

                match module_flags(result.status) {
                    RES_MODULE_NOANS => error!("task {} did not push any result", taskid),
                    RES_MODULE_CTXER => error!("context verification failed for task {}", taskid),
                    _ => {}
                }

                // Flagged results are delivered too, so the job manager
                // sees the failure instead of waiting forever.
                work_queue.push(CompletedTask {
                    taskid,
                    status: result.status,
                    payload: result.payload,
                });
                Ok(())
            },
        ))
    };

    info!("starting network listener...");
    let recv_timeout = settings.recv_timeout;
    let listener = {
        let pool = pool.clone();
        let queue = queue.clone();
        Listener::new(
            settings.address.clone(),
            settings.port,
            move |mut conn, peer_addr, peer_port| {
                info!("connected to {}:{}", peer_addr, peer_port);

                match serve_connection(&mut conn, &*pool, &queue, recv_timeout) {
                    Ok(ConnOutcome::Terminate) => {
                        info!("received a kill signal from {}:{}", peer_addr, peer_port);
                        process::exit(0);
                    }
                    Ok(ConnOutcome::Served) => {}
                    Err(NetError::Closed) => info!(
                        "connection to {}:{} closed from the other side",
                        peer_addr, peer_port
                    ),
                    Err(NetError::Timeout) => {
                        warn!("connection to {}:{} timed out", peer_addr, peer_port)
                    }
                    Err(err) => warn!(
                        "error occurred while serving {}:{}: {}",
                        peer_addr, peer_port, err
                    ),
                }

                conn.close();
                info!("connection to {}:{} closed", peer_addr, peer_port);
            },
        )
    };

    listener.start()?;
    info!("waiting for work...");
    listener.join();
    Ok(())
}
