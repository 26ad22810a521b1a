//! The bounded queue between setup workers and LLM workers.
//!
//! Capacity is fixed at twice the LLM pool size: enough buffering to hide
//! setup stalls, small enough to cap the number of snapshot directories on
//! disk. A full queue blocks the producing setup worker, which is the
//! back-pressure path.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

/// A work-tree copy pinned to one commit, owned by exactly one LLM worker
/// once received.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub token: String,
    pub review_id: String,
    pub patch_num: usize,
    pub commit_hash: String,
}

pub struct SnapshotQueue {
    sender: Sender<Snapshot>,
    receiver: Receiver<Snapshot>,
    closed: AtomicBool,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl SnapshotQueue {
    pub fn new(capacity: usize) -> SnapshotQueue {
        let (sender, receiver) = bounded(capacity);
        SnapshotQueue {
            sender,
            receiver,
            closed: AtomicBool::new(false),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Returns `false` if the queue was
    /// closed before the snapshot could be enqueued (shutdown); the caller
    /// still owns the snapshot in that case and must clean it up.
    pub fn put(&self, mut snapshot: Snapshot) -> bool {
        // Count the snapshot before it becomes visible to consumers, so a
        // fast consumer's task_done cannot race the increment.
        *self.outstanding.lock().unwrap() += 1;

        loop {
            if self.closed.load(Ordering::Relaxed) {
                self.task_done();
                return false;
            }
            match self
                .sender
                .send_timeout(snapshot, Duration::from_millis(200))
            {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => snapshot = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.task_done();
                    return false;
                }
            }
        }
    }

    /// Blocks until a snapshot is available or the timeout elapses.
    pub fn get(&self, timeout: Duration) -> Option<Snapshot> {
        match self.receiver.recv_timeout(timeout) {
            Ok(snapshot) => Some(snapshot),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Acknowledges that a received snapshot has been fully processed.
    pub fn task_done(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks until every enqueued snapshot has been consumed and
    /// acknowledged. Test helper.
    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.idle.wait(outstanding).unwrap();
        }
    }

    /// Unblocks producers during shutdown; subsequent `put` calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    fn snapshot(n: usize) -> Snapshot {
        Snapshot {
            path: PathBuf::from(format!("/tmp/wt-1.{n:012}")),
            token: "tok".to_string(),
            review_id: "rid".to_string(),
            patch_num: n,
            commit_hash: format!("{n:040}"),
        }
    }

    #[test]
    fn put_blocks_when_full_until_a_consumer_drains() {
        let queue = Arc::new(SnapshotQueue::new(2));
        assert!(queue.put(snapshot(1)));
        assert!(queue.put(snapshot(2)));

        let third_done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let third_done = Arc::clone(&third_done);
            std::thread::spawn(move || {
                assert!(queue.put(snapshot(3)));
                third_done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(150));
        assert!(
            !third_done.load(Ordering::SeqCst),
            "put beyond capacity should block"
        );

        let got = queue.get(Duration::from_secs(1)).unwrap();
        assert_eq!(got.patch_num, 1);

        producer.join().unwrap();
        assert!(third_done.load(Ordering::SeqCst));
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let queue = SnapshotQueue::new(4);
        assert!(queue.get(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn snapshots_come_out_in_order() {
        let queue = SnapshotQueue::new(4);
        for n in 1..=3 {
            assert!(queue.put(snapshot(n)));
        }
        for n in 1..=3 {
            assert_eq!(queue.get(Duration::ZERO).unwrap().patch_num, n);
        }
    }

    #[test]
    fn wait_idle_returns_after_all_acks() {
        let queue = Arc::new(SnapshotQueue::new(4));
        assert!(queue.put(snapshot(1)));
        assert!(queue.put(snapshot(2)));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                while queue.get(Duration::from_millis(50)).is_some() {
                    queue.task_done();
                }
            })
        };

        queue.wait_idle();
        assert!(queue.is_empty());
        consumer.join().unwrap();
    }

    #[test]
    fn close_unblocks_a_full_put() {
        let queue = Arc::new(SnapshotQueue::new(1));
        assert!(queue.put(snapshot(1)));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.put(snapshot(2)))
        };

        std::thread::sleep(Duration::from_millis(100));
        queue.close();

        assert!(!producer.join().unwrap(), "put should fail after close");
    }
}
