//! Completion queue: results waiting to be pulled by the job manager.

use crossbeam_channel::{unbounded, Receiver, Sender};

/// One finished task, ready for delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedTask {
    pub taskid: i64,
    pub status: i64,
    pub payload: Vec<u8>,
}

/// Thread-safe FIFO between the pool workers (producers) and the
/// connection handlers (consumers). A result whose delivery fails is
/// pushed back at the tail, which preserves at-least-once delivery but
/// not overall ordering.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: Sender<CompletedTask>,
    rx: Receiver<CompletedTask>,
}

impl CompletionQueue {
    pub fn new() -> CompletionQueue {
        let (tx, rx) = unbounded();
        CompletionQueue { tx, rx }
    }

    pub fn push(&self, task: CompletedTask) {
        // Cannot fail: the queue owns both ends of the channel.
        self.tx
            .send(task)
            .expect("completion queue disconnected");
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<CompletedTask> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        CompletionQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(taskid: i64) -> CompletedTask {
        CompletedTask {
            taskid,
            status: 0,
            payload: vec![],
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = CompletionQueue::new();
        queue.push(task(1));
        queue.push(task(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().taskid, 1);
        assert_eq!(queue.try_pop().unwrap().taskid, 2);
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_to_the_tail() {
        let queue = CompletionQueue::new();
        queue.push(task(1));
        queue.push(task(2));

        let failed = queue.try_pop().unwrap();
        queue.push(failed);
        assert_eq!(queue.try_pop().unwrap().taskid, 2);
        assert_eq!(queue.try_pop().unwrap().taskid, 1);
    }
}
