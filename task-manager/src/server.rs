//! Connection server: one request dialog per accepted connection.
//!
//! Each connection carries exactly one opcode and its dialog: a task
//! intake loop, a result egress loop, or a termination order. The dispatch
//! reports termination as an outcome instead of exiting itself, so the
//! state machine stays testable; the process exit happens in the
//! connection callback.

use crate::cqueue::{CompletedTask, CompletionQueue};
use log::{info, warn};
use spits::endpoint::Endpoint;
use spits::errors::NetError;
use spits::messaging::{
    MSG_READ_EMPTY, MSG_READ_RESULT, MSG_SEND_FULL, MSG_SEND_MORE, MSG_SEND_RJCT, MSG_SEND_TASK,
    MSG_TERMINATE,
};
use spits::TaskPool;
use std::time::Duration;

/// What the connection asked of this process.
#[derive(Debug, PartialEq)]
pub enum ConnOutcome {
    /// The dialog ran to its end.
    Served,
    /// The peer ordered an immediate shutdown.
    Terminate,
}

/// Where accepted tasks go. The pool implements this; tests substitute
/// their own to pin down the full/reject edge cases.
pub trait TaskIntake {
    /// Advisory fullness test.
    fn full(&self) -> bool;
    /// Non-blocking offer; `false` means the task was not taken.
    fn put(&self, taskid: i64, payload: Vec<u8>) -> bool;
}

impl TaskIntake for TaskPool {
    fn full(&self) -> bool {
        TaskPool::full(self)
    }

    fn put(&self, taskid: i64, payload: Vec<u8>) -> bool {
        TaskPool::put(self, taskid, payload)
    }
}

/// Serve one connection: read the opcode and run its dialog.
pub fn serve_connection<I: TaskIntake>(
    conn: &mut Endpoint,
    intake: &I,
    queue: &CompletionQueue,
    recv_timeout: Option<Duration>,
) -> Result<ConnOutcome, NetError> {
    let mtype = conn.read_i64(recv_timeout)?;

    match mtype {
        MSG_TERMINATE => Ok(ConnOutcome::Terminate),
        MSG_SEND_TASK => {
            receive_tasks(conn, intake, recv_timeout)?;
            Ok(ConnOutcome::Served)
        }
        MSG_READ_RESULT => {
            send_results(conn, queue, recv_timeout)?;
            Ok(ConnOutcome::Served)
        }
        other => {
            // A wrong-sized frame may be trashing the stream; just close.
            warn!("unknown message {:#x} received", other);
            Ok(ConnOutcome::Served)
        }
    }
}

/// Intake dialog: ask for tasks while there is room, then report full.
fn receive_tasks<I: TaskIntake>(
    conn: &mut Endpoint,
    intake: &I,
    recv_timeout: Option<Duration>,
) -> Result<(), NetError> {
    while !intake.full() {
        conn.write_i64(MSG_SEND_MORE)?;
        let taskid = conn.read_i64(recv_timeout)?;
        let size = conn.read_i64(recv_timeout)?;
        if size < 0 {
            return Err(NetError::Protocol(format!("negative task size {}", size)));
        }
        let payload = conn.read(size as usize, recv_timeout)?;
        info!("received task {} from {}", taskid, conn.peer_name());

        if !intake.put(taskid, payload) {
            // The pool filled up between the test and the offer.
            warn!("rejecting task {} because the pool is full", taskid);
            conn.write_i64(MSG_SEND_RJCT)?;
        }
    }

    conn.write_i64(MSG_SEND_FULL)?;
    Ok(())
}

/// Egress dialog: stream queued results, one acknowledgment each.
fn send_results(
    conn: &mut Endpoint,
    queue: &CompletionQueue,
    recv_timeout: Option<Duration>,
) -> Result<(), NetError> {
    while let Some(task) = queue.try_pop() {
        info!("sending task {} to {}...", task.taskid, conn.peer_name());

        if let Err(err) = send_one(conn, &task, recv_timeout) {
            // The puller never confirmed this one; put it back so the
            // next puller sees it.
            let taskid = task.taskid;
            queue.push(task);
            info!("task {} put back in the queue", taskid);
            return Err(err);
        }
    }

    conn.write_i64(MSG_READ_EMPTY)?;
    Ok(())
}

fn send_one(
    conn: &mut Endpoint,
    task: &CompletedTask,
    recv_timeout: Option<Duration>,
) -> Result<(), NetError> {
    conn.write_i64(task.taskid)?;
    conn.write_i64(task.status)?;
    conn.write_i64(task.payload.len() as i64)?;
    conn.write(&task.payload)?;

    let ack = conn.read_i64(recv_timeout)?;
    if ack != MSG_READ_RESULT {
        return Err(NetError::Protocol(format!(
            "unexpected acknowledgment {:#x} while sending results",
            ack
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;

    const T: Option<Duration> = Some(Duration::from_secs(5));

    /// Scripted intake with a fixed capacity.
    struct FakeIntake {
        slots: Mutex<Vec<(i64, Vec<u8>)>>,
        capacity: usize,
        // When set, put() fails even though full() said otherwise.
        lie_about_room: bool,
    }

    impl FakeIntake {
        fn with_capacity(capacity: usize) -> FakeIntake {
            FakeIntake {
                slots: Mutex::new(vec![]),
                capacity,
                lie_about_room: false,
            }
        }
    }

    impl TaskIntake for FakeIntake {
        fn full(&self) -> bool {
            self.slots.lock().unwrap().len() >= self.capacity
        }

        fn put(&self, taskid: i64, payload: Vec<u8>) -> bool {
            if self.lie_about_room {
                return false;
            }
            let mut slots = self.slots.lock().unwrap();
            if slots.len() >= self.capacity {
                return false;
            }
            slots.push((taskid, payload));
            true
        }
    }

    fn pair() -> (Endpoint, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            Endpoint::from_tcp(stream, peer.ip().to_string(), i32::from(peer.port()))
        });
        let mut client = Endpoint::new("127.0.0.1", port);
        client.open(T).unwrap();
        (client, server.join().unwrap())
    }

    #[test]
    fn test_terminate_is_reported_not_served() {
        let (mut jm, mut tm) = pair();
        let server = thread::spawn(move || {
            let queue = CompletionQueue::new();
            serve_connection(&mut tm, &FakeIntake::with_capacity(1), &queue, T)
        });

        jm.write_i64(MSG_TERMINATE).unwrap();
        assert_eq!(server.join().unwrap().unwrap(), ConnOutcome::Terminate);
    }

    #[test]
    fn test_unknown_opcode_closes_quietly() {
        let (mut jm, mut tm) = pair();
        let server = thread::spawn(move || {
            let queue = CompletionQueue::new();
            serve_connection(&mut tm, &FakeIntake::with_capacity(1), &queue, T)
        });

        jm.write_i64(0x0BAD).unwrap();
        assert_eq!(server.join().unwrap().unwrap(), ConnOutcome::Served);
    }

    #[test]
    fn test_intake_until_full() {
        let (mut jm, mut tm) = pair();
        let intake = FakeIntake::with_capacity(2);

        let server = thread::spawn(move || {
            let queue = CompletionQueue::new();
            let outcome = serve_connection(&mut tm, &intake, &queue, T);
            (outcome, intake)
        });

        jm.write_i64(MSG_SEND_TASK).unwrap();
        // First task.
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_MORE);
        jm.write_i64(1).unwrap();
        jm.write_i64(1).unwrap();
        jm.write(b"a").unwrap();
        // Second task; an empty payload is legal.
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_MORE);
        jm.write_i64(2).unwrap();
        jm.write_i64(0).unwrap();
        // The pool is now full.
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_FULL);

        let (outcome, intake) = server.join().unwrap();
        assert_eq!(outcome.unwrap(), ConnOutcome::Served);
        assert_eq!(
            *intake.slots.lock().unwrap(),
            vec![(1, b"a".to_vec()), (2, vec![])]
        );
    }

    #[test]
    fn test_reject_when_offer_fails_after_accept() {
        let (mut jm, mut tm) = pair();
        let intake = FakeIntake {
            slots: Mutex::new(vec![]),
            capacity: 1,
            lie_about_room: true,
        };

        let server = thread::spawn(move || {
            let queue = CompletionQueue::new();
            serve_connection(&mut tm, &intake, &queue, T)
        });

        jm.write_i64(MSG_SEND_TASK).unwrap();
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_MORE);
        jm.write_i64(1).unwrap();
        jm.write_i64(1).unwrap();
        jm.write(b"x").unwrap();
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_RJCT);
        // The protocol does not recover from a reject; close our side.
        jm.close();

        // The server keeps asking and then fails on the closed socket.
        match server.join().unwrap() {
            Err(NetError::Closed) | Err(NetError::Io(_)) => {}
            other => panic!("expected a connection failure, got {:?}", other),
        }
    }

    #[test]
    fn test_egress_streams_until_empty() {
        let (mut jm, mut tm) = pair();
        let queue = CompletionQueue::new();
        queue.push(CompletedTask {
            taskid: 1,
            status: 0,
            payload: b"res".to_vec(),
        });
        queue.push(CompletedTask {
            taskid: 2,
            status: -1,
            payload: vec![],
        });

        let server = thread::spawn(move || {
            let intake = FakeIntake::with_capacity(1);
            let outcome = serve_connection(&mut tm, &intake, &queue, T);
            (outcome, queue)
        });

        jm.write_i64(MSG_READ_RESULT).unwrap();

        assert_eq!(jm.read_i64(T).unwrap(), 1);
        assert_eq!(jm.read_i64(T).unwrap(), 0);
        assert_eq!(jm.read_i64(T).unwrap(), 3);
        assert_eq!(jm.read(3, T).unwrap(), b"res");
        jm.write_i64(MSG_READ_RESULT).unwrap();

        assert_eq!(jm.read_i64(T).unwrap(), 2);
        assert_eq!(jm.read_i64(T).unwrap(), -1);
        assert_eq!(jm.read_i64(T).unwrap(), 0);
        jm.write_i64(MSG_READ_RESULT).unwrap();

        assert_eq!(jm.read_i64(T).unwrap(), MSG_READ_EMPTY);

        let (outcome, queue) = server.join().unwrap();
        assert_eq!(outcome.unwrap(), ConnOutcome::Served);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bad_ack_requeues_the_result() {
        let (mut jm, mut tm) = pair();
        let queue = CompletionQueue::new();
        queue.push(CompletedTask {
            taskid: 7,
            status: 0,
            payload: b"keep me".to_vec(),
        });

        let server = thread::spawn(move || {
            let intake = FakeIntake::with_capacity(1);
            let outcome = serve_connection(&mut tm, &intake, &queue, T);
            (outcome, queue)
        });

        jm.write_i64(MSG_READ_RESULT).unwrap();
        assert_eq!(jm.read_i64(T).unwrap(), 7);
        jm.read_i64(T).unwrap();
        let size = jm.read_i64(T).unwrap();
        jm.read(size as usize, T).unwrap();
        // Acknowledge with the wrong opcode.
        jm.write_i64(MSG_SEND_MORE).unwrap();

        let (outcome, queue) = server.join().unwrap();
        match outcome {
            Err(NetError::Protocol(_)) => {}
            other => panic!("expected a protocol violation, got {:?}", other),
        }
        // The unconfirmed result is back in the queue.
        assert_eq!(queue.try_pop().unwrap().taskid, 7);
    }

    #[test]
    fn test_full_dialog_over_uds() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tm.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut tm = Endpoint::from_unix(stream, "jm");
            let intake = FakeIntake::with_capacity(1);
            let queue = CompletionQueue::new();
            let outcome = serve_connection(&mut tm, &intake, &queue, T);
            (outcome, intake)
        });

        let mut jm = Endpoint::new(path.to_string_lossy(), 0);
        jm.open(T).unwrap();
        jm.write_i64(MSG_SEND_TASK).unwrap();
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_MORE);
        jm.write_i64(1).unwrap();
        jm.write_i64(4).unwrap();
        jm.write(b"task").unwrap();
        assert_eq!(jm.read_i64(T).unwrap(), MSG_SEND_FULL);

        let (outcome, intake) = server.join().unwrap();
        assert_eq!(outcome.unwrap(), ConnOutcome::Served);
        assert_eq!(*intake.slots.lock().unwrap(), vec![(1, b"task".to_vec())]);
    }
}
