//! Single-threaded work queue.
//!
//! Every mutation of socket, server and transaction state runs as a task on
//! the scheduler's dispatch thread. Tasks may be posted from any thread; they
//! run exactly once, in the order they were posted.
//!
//! ```text
//!   worker threads ──post──┐
//!   app threads   ──post──┼──► [ queue ] ──► dispatch thread ──► task(&mut S)
//!   dispatch      ──post──┘
//! ```
//!
//! A failing task (an `Err` return or a panic) is reported to the
//! [`SchedulerDelegate`] and the loop carries on with the next task.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info};

use crate::error::SchedulerError;

/// A unit of work run on the dispatch thread against its state.
pub type Task<S> = Box<dyn FnOnce(&mut S) -> anyhow::Result<()> + Send>;

enum Message<S> {
    Run(Task<S>),
    Stop,
}

/// Receives the failures of posted tasks and the stop notification.
pub trait SchedulerDelegate: Send {
    fn on_task_error(&mut self, error: anyhow::Error);

    fn on_stopped(&mut self) {}
}

/// Delegate that reports task failures through `tracing`.
#[derive(Debug, Default)]
pub struct TracingDelegate;

impl SchedulerDelegate for TracingDelegate {
    fn on_task_error(&mut self, error: anyhow::Error) {
        error!(error = %error, "scheduled task failed");
    }

    fn on_stopped(&mut self) {
        info!("dispatch loop stopped");
    }
}

/// Cloneable, thread-safe entry point for posting tasks.
pub struct SchedulerHandle<S> {
    tx: UnboundedSender<Message<S>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SchedulerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: 'static> SchedulerHandle<S> {
    /// Enqueues `task` for the dispatch thread.
    ///
    /// Returns `false` when the dispatch loop is gone; the task is dropped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) -> anyhow::Result<()> + Send + 'static,
    {
        self.tx.send(Message::Run(Box::new(task))).is_ok()
    }
}

/// Owner of the task queue and of the dispatch thread.
pub struct Scheduler<S> {
    handle: SchedulerHandle<S>,
    inbox: Mutex<Option<UnboundedReceiver<Message<S>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Default for Scheduler<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Scheduler<S> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: SchedulerHandle { tx },
            inbox: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        self.handle.clone()
    }

    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) -> anyhow::Result<()> + Send + 'static,
    {
        self.handle.post(task)
    }

    /// Starts draining the queue on a dedicated thread.
    ///
    /// `init` builds the dispatch-thread state on that thread, so `S` itself
    /// never has to cross threads. Fails if the queue is already being
    /// drained, by a previous `start` or by [`run_until_idle`](Self::run_until_idle).
    pub fn start<F, D>(&self, init: F, mut delegate: D) -> Result<(), SchedulerError>
    where
        F: FnOnce(SchedulerHandle<S>) -> S + Send + 'static,
        D: SchedulerDelegate + 'static,
    {
        let mut rx = lock(&self.inbox)
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;
        let handle = self.handle.clone();

        let worker = thread::Builder::new()
            .name("sluice-dispatch".to_string())
            .spawn(move || {
                let mut state = init(handle);
                debug!("dispatch loop started");

                // blocks while idle, wakes on every post
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Run(task) => run_task(&mut state, task, &mut delegate),
                        Message::Stop => break,
                    }
                }

                delegate.on_stopped();
            })
            .map_err(SchedulerError::Spawn)?;

        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    /// Asks the dispatch loop to exit once everything posted before this call has run.
    pub fn stop(&self) {
        let _ = self.handle.tx.send(Message::Stop);
    }

    /// Waits for the dispatch thread to exit. No-op if it was never started.
    pub fn join(&self) -> Result<(), SchedulerError> {
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => worker.join().map_err(|_| SchedulerError::Panicked),
            None => Ok(()),
        }
    }

    /// Runs queued tasks on the calling thread until the queue is empty.
    ///
    /// Tasks posted by the tasks being run are picked up in the same call.
    /// Returns how many tasks ran. Only available while the scheduler has
    /// not been started on its own thread.
    pub fn run_until_idle(
        &self,
        state: &mut S,
        delegate: &mut dyn SchedulerDelegate,
    ) -> Result<usize, SchedulerError> {
        let mut inbox = lock(&self.inbox);
        let rx = inbox.as_mut().ok_or(SchedulerError::AlreadyStarted)?;

        let mut ran = 0;
        while let Ok(message) = rx.try_recv() {
            match message {
                Message::Run(task) => {
                    run_task(state, task, delegate);
                    ran += 1;
                }
                Message::Stop => {
                    delegate.on_stopped();
                    break;
                }
            }
        }
        Ok(ran)
    }
}

fn run_task<S>(state: &mut S, task: Task<S>, delegate: &mut dyn SchedulerDelegate) {
    match panic::catch_unwind(AssertUnwindSafe(|| task(state))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => delegate.on_task_error(e),
        Err(payload) => delegate.on_task_error(anyhow::anyhow!(
            "task panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        errors: Vec<String>,
        stopped: bool,
    }

    impl SchedulerDelegate for Collect {
        fn on_task_error(&mut self, error: anyhow::Error) {
            self.errors.push(error.to_string());
        }

        fn on_stopped(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn tasks_posted_by_tasks_run_in_the_same_pump() {
        let scheduler = Scheduler::<Vec<u32>>::new();
        let handle = scheduler.handle();
        scheduler.post(move |log| {
            log.push(1);
            handle.post(|log| {
                log.push(3);
                Ok(())
            });
            Ok(())
        });
        scheduler.post(|log| {
            log.push(2);
            Ok(())
        });

        let mut log = Vec::new();
        let mut delegate = Collect::default();
        let ran = scheduler.run_until_idle(&mut log, &mut delegate).unwrap();

        assert_eq!(ran, 3);
        assert_eq!(log, vec![1, 2, 3]);
    }

    #[test]
    fn panic_payload_is_reported() {
        let scheduler = Scheduler::<()>::new();
        scheduler.post(|_| panic!("boom"));

        let mut delegate = Collect::default();
        scheduler.run_until_idle(&mut (), &mut delegate).unwrap();

        assert_eq!(delegate.errors, vec!["task panicked: boom".to_string()]);
    }
}
