//! A bounded pool of persistent worker threads.
//!
//! The pool never runs more than `max_active` tasks at a time. Workers that finish a task return
//!  to an idle cache of at most `max_idle` workers and are torn down if the cache is full, so the
//!  number of threads grows with load up to the cap and shrinks back to the retained baseline.
//!
//! Submission is either non-blocking (returning `None` if all workers are busy) or blocking
//!  (waiting for a worker to be returned), which gives callers explicit control over
//!  backpressure.

mod executor;
mod handle;
mod task;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use executor::{Job, TaskExecutor};
use handle::Completion;

pub use handle::{TaskHandle, TaskState};
pub use task::{Task, TaskProgress};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task parameters: {0}")]
    InvalidParams(String),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("the pool is shut down")]
    ShutDown,
    #[error("task executor {0} terminated unexpectedly")]
    ExecutorLost(u64),
    #[error("could not start a worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct PoolState {
    idle: Vec<TaskExecutor>,
    num_active: usize,
    next_executor_id: u64,
    shut_down: bool,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    executor_returned: Condvar,
}

impl PoolShared {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Called by a worker after it finished its job. Returns `false` if the worker is not
    ///  retained and should terminate.
    fn return_executor(&self, executor: TaskExecutor) -> bool {
        let mut state = self.state.lock().unwrap();
        state.num_active -= 1;

        let retained = !state.shut_down && state.idle.len() < self.config.max_idle;
        if retained {
            trace!("returning executor {} to the idle cache of pool {}", executor.id(), self.config.name);
            state.idle.push(executor);
        }
        else {
            debug!("idle cache of pool {} is full: tearing down executor {}", self.config.name, executor.id());
        }

        self.executor_returned.notify_one();
        retained
    }

    fn release_unused_slot(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_active -= 1;
        self.executor_returned.notify_one();
    }
}

pub struct TaskExecutionPool {
    shared: Arc<PoolShared>,
}

impl TaskExecutionPool {
    pub fn new(config: PoolConfig) -> anyhow::Result<TaskExecutionPool> {
        config.validate()?;
        info!("initializing task pool {} with up to {} active and {} idle workers", config.name, config.max_active, config.max_idle);

        Ok(TaskExecutionPool {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    num_active: 0,
                    next_executor_id: 0,
                    shut_down: false,
                }),
                executor_returned: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn num_active(&self) -> usize {
        self.shared.state.lock().unwrap().num_active
    }

    pub fn num_idle(&self) -> usize {
        self.shared.state.lock().unwrap().idle.len()
    }

    /// Submit a task for execution.
    ///
    /// If a worker is available (or can be started without exceeding the pool's cap), the task
    ///  is dispatched immediately. Otherwise this returns `Ok(None)` if `allow_blocking` is
    ///  `false`, or waits until a worker is returned to the pool if it is `true`.
    pub fn do_task<T: Task>(&self, task: Arc<T>, params: T::Params, allow_blocking: bool) -> Result<Option<TaskHandle<T::Output>>, TaskError> {
        task.validate_params(&params)?;

        let executor = match self.acquire_executor(allow_blocking)? {
            Some(executor) => executor,
            None => {
                debug!("pool {} is saturated: not dispatching task {}", self.name(), task.name());
                return Ok(None);
            }
        };

        let completion = Arc::new(Completion::new());

        let job_completion = completion.clone();
        let job: Job = Box::new(move || {
            job_completion.mark_running();
            let outcome = catch_unwind(AssertUnwindSafe(|| task.execute(params, job_completion.progress())));
            let result = match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => {
                    debug!("task {} failed: {:#}", task.name(), e);
                    Err(TaskError::Failed(e))
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    warn!("task {} panicked: {}", task.name(), msg);
                    Err(TaskError::Panicked(msg))
                }
            };
            job_completion.finish(result);
        });

        if let Err(e) = executor.assign(job) {
            // the job was dropped with the failed send
            self.shared.release_unused_slot();
            return Err(e);
        }

        Ok(Some(TaskHandle::new(completion)))
    }

    fn acquire_executor(&self, allow_blocking: bool) -> Result<Option<TaskExecutor>, TaskError> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.shut_down {
                return Err(TaskError::ShutDown);
            }

            if state.num_active < self.shared.config.max_active {
                state.num_active += 1;
                if let Some(executor) = state.idle.pop() {
                    return Ok(Some(executor));
                }

                let id = state.next_executor_id;
                state.next_executor_id += 1;
                return match TaskExecutor::spawn(self.shared.clone(), id) {
                    Ok(executor) => Ok(Some(executor)),
                    Err(e) => {
                        state.num_active -= 1;
                        Err(e)
                    }
                };
            }

            if !allow_blocking {
                return Ok(None);
            }

            trace!("pool {} is saturated: waiting for a worker to be returned", self.shared.config.name);
            state = self.shared.executor_returned.wait(state).unwrap();
        }
    }

    /// Tears down idle workers and rejects further submissions, including blocked ones. Running
    ///  tasks complete normally, and their workers terminate afterwards.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        for executor in state.idle.drain(..) {
            executor.shut_down();
        }
        self.shared.executor_returned.notify_all();
        info!("shut down task pool {}", self.shared.config.name);
    }
}

impl Drop for TaskExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    }
    else {
        "<non-string panic payload>".to_string()
    }
}
