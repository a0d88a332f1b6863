use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use crate::pool::task::TaskProgress;
use crate::pool::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    /// the result was retrieved through [TaskHandle::result]
    Collected,
}

enum Slot<O> {
    Queued,
    Running,
    Finished(Result<O, TaskError>),
    Collected,
}
impl<O> Slot<O> {
    fn state(&self) -> TaskState {
        match self {
            Slot::Queued => TaskState::Queued,
            Slot::Running => TaskState::Running,
            Slot::Finished(_) => TaskState::Finished,
            Slot::Collected => TaskState::Collected,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Slot::Queued | Slot::Running)
    }
}

/// The pool-owned per-submission state, shared between the worker executing the task and the
///  [TaskHandle] returned to the submitter.
pub(crate) struct Completion<O> {
    slot: Mutex<Slot<O>>,
    changed: Condvar,
    progress: TaskProgress,
}

impl<O> Completion<O> {
    pub(crate) fn new() -> Completion<O> {
        Completion {
            slot: Mutex::new(Slot::Queued),
            changed: Condvar::new(),
            progress: TaskProgress::default(),
        }
    }

    pub(crate) fn progress(&self) -> &TaskProgress {
        &self.progress
    }

    pub(crate) fn mark_running(&self) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, Slot::Queued) {
            *slot = Slot::Running;
        }
    }

    pub(crate) fn finish(&self, result: Result<O, TaskError>) {
        if result.is_ok() {
            self.progress.set(1.0);
        }

        let mut slot = self.slot.lock().unwrap();
        if slot.is_pending() {
            *slot = Slot::Finished(result);
        }
        self.changed.notify_all();
    }
}

/// Completion handle for a single task submission
pub struct TaskHandle<O> {
    completion: Arc<Completion<O>>,
}

impl<O> TaskHandle<O> {
    pub(crate) fn new(completion: Arc<Completion<O>>) -> TaskHandle<O> {
        TaskHandle { completion }
    }

    pub fn state(&self) -> TaskState {
        self.completion.slot.lock().unwrap().state()
    }

    pub fn is_done(&self) -> bool {
        !self.completion.slot.lock().unwrap().is_pending()
    }

    pub fn progress(&self) -> f64 {
        self.completion.progress.get()
    }

    /// block until the task finished
    pub fn wait(&self) {
        let slot = self.completion.slot.lock().unwrap();
        let _finished = self.completion.changed
            .wait_while(slot, |s| s.is_pending())
            .unwrap();
    }

    /// block until the task finished or the timeout elapsed, returning `true` if it finished
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let slot = self.completion.slot.lock().unwrap();
        let (slot, _) = self.completion.changed
            .wait_timeout_while(slot, timeout, |s| s.is_pending())
            .unwrap();
        !slot.is_pending()
    }

    /// Wait for the task to finish and take its result. The result can be taken only once,
    ///  subsequent calls fail with [TaskError::IllegalState].
    pub fn result(&self) -> Result<O, TaskError> {
        let slot = self.completion.slot.lock().unwrap();
        let mut slot = self.completion.changed
            .wait_while(slot, |s| s.is_pending())
            .unwrap();

        match std::mem::replace(&mut *slot, Slot::Collected) {
            Slot::Finished(result) => result,
            _ => Err(TaskError::IllegalState("task result was already collected")),
        }
    }
}
