//! Per-device dedicated single-thread task pool. See spec.md §4.7, §5.
//!
//! All GPU commands for one device are issued from this one thread into
//! that device's single in-order queue — the concurrency model the rest
//! of the crate (and the process-wide `ProgramCache`) is built around.

use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::tile::{CancelFlag, DeviceTask};

enum Message {
    Task(DeviceTask),
    Barrier(SyncSender<()>),
    Shutdown,
}

/// A dedicated background worker thread for one device. `task_add`
/// enqueues work; the dispatch closure given to [`Worker::spawn`] routes
/// each `DeviceTask` to `film_convert`, `shader`, or `path_trace` by
/// `task.kind`.
pub struct Worker {
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    current_cancel: Arc<Mutex<Option<CancelFlag>>>,
}

impl Worker {
    pub fn spawn<F>(mut dispatch: F) -> Self
    where
        F: FnMut(&mut DeviceTask) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Message>();
        let current_cancel = Arc::new(Mutex::new(None));
        let worker_cancel = current_cancel.clone();

        let handle = std::thread::Builder::new()
            .name("pathtrace-device-worker".into())
            .spawn(move || {
                let current_cancel = worker_cancel;
                for message in receiver {
                    match message {
                        Message::Task(mut task) => {
                            *current_cancel.lock().unwrap() = Some(task.cancel.clone());
                            dispatch(&mut task);
                            *current_cancel.lock().unwrap() = None;
                        }
                        Message::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                        Message::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn device worker thread");

        Self {
            sender,
            handle: Some(handle),
            current_cancel,
        }
    }

    /// Enqueue a task. Runs on the worker thread, after everything
    /// already queued ahead of it.
    pub fn task_add(&self, task: DeviceTask) {
        let _ = self.sender.send(Message::Task(task));
    }

    /// Block until every task enqueued before this call has finished.
    /// A zero-capacity rendezvous channel is the barrier: the worker
    /// only acks it once every earlier message has been processed, since
    /// the channel preserves send order.
    pub fn task_wait(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(0);
        if self.sender.send(Message::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Signal cancellation to whichever task is currently running, if
    /// any. The per-sample/per-tile inner loop is what actually notices
    /// via `get_cancel()`; this does not interrupt an in-flight kernel
    /// launch (spec.md §5).
    pub fn task_cancel(&self) {
        if let Some(cancel) = self.current_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{RenderTile, TaskKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dummy_task(kind: TaskKind, cancel: CancelFlag) -> DeviceTask {
        DeviceTask {
            kind,
            num_samples: 1,
            need_finish_queue: false,
            cancel,
            acquire_tile: Box::new(|| None),
            release_tile: Box::new(|_: RenderTile| {}),
            update_progress: Box::new(|_| {}),
        }
    }

    #[test]
    fn tasks_run_in_order_on_the_worker_thread() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let worker = Worker::spawn(move |task| {
            order_clone.lock().unwrap().push(task.kind);
        });

        worker.task_add(dummy_task(TaskKind::Shader, CancelFlag::new()));
        worker.task_add(dummy_task(TaskKind::PathTrace, CancelFlag::new()));
        worker.task_wait();

        assert_eq!(*order.lock().unwrap(), vec![TaskKind::Shader, TaskKind::PathTrace]);
    }

    #[test]
    fn task_cancel_trips_the_running_tasks_flag() {
        let seen_cancel = Arc::new(AtomicUsize::new(0));
        let seen_cancel_clone = seen_cancel.clone();
        let worker = Worker::spawn(move |task| {
            // Give task_cancel a chance to land before we check.
            std::thread::sleep(std::time::Duration::from_millis(20));
            if task.cancel.is_cancelled() {
                seen_cancel_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let cancel = CancelFlag::new();
        worker.task_add(dummy_task(TaskKind::PathTrace, cancel));
        worker.task_cancel();
        worker.task_wait();

        assert_eq!(seen_cancel.load(Ordering::SeqCst), 1);
    }
}
