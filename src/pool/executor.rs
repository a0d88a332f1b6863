use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use crate::pool::{PoolShared, TaskError};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum ExecutorCommand {
    Run(Job),
    Shutdown,
}

/// A persistent worker thread bound to one pool. It is either idle (waiting for its next
///  assignment) or running exactly one job, after which it hands itself back to the pool.
#[derive(Clone)]
pub(crate) struct TaskExecutor {
    id: u64,
    commands: UnboundedSender<ExecutorCommand>,
}

impl TaskExecutor {
    pub(crate) fn spawn(pool: Arc<PoolShared>, id: u64) -> Result<TaskExecutor, TaskError> {
        let (commands, receiver) = unbounded_channel();
        let executor = TaskExecutor { id, commands };

        let worker = executor.clone();
        std::thread::Builder::new()
            .name(format!("{}-{}", pool.name(), id))
            .spawn(move || worker.run(receiver, pool))?;

        debug!("spawned task executor {}", id);
        Ok(executor)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn assign(&self, job: Job) -> Result<(), TaskError> {
        self.commands.send(ExecutorCommand::Run(job))
            .map_err(|_| TaskError::ExecutorLost(self.id))
    }

    pub(crate) fn shut_down(&self) {
        // the worker may have terminated already, which is fine
        let _ = self.commands.send(ExecutorCommand::Shutdown);
    }

    fn run(self, mut commands: UnboundedReceiver<ExecutorCommand>, pool: Arc<PoolShared>) {
        trace!("task executor {} waiting for work", self.id);

        while let Some(command) = commands.blocking_recv() {
            match command {
                ExecutorCommand::Run(job) => {
                    job();
                    if !pool.return_executor(self.clone()) {
                        break;
                    }
                }
                ExecutorCommand::Shutdown => {
                    break;
                }
            }
        }

        debug!("task executor {} terminated", self.id);
    }
}
