//! Drives receiving for all live conduits.
//!
//! A single monitor thread scans the [ConduitRegistry] round robin and dispatches a receive
//!  operation for each conduit that does not have one in progress. Receive operations run in a
//!  small pool of fixed size, which bounds the number of concurrent receive operations
//!  independently of the number of open conduits. When the pool is saturated, the monitor
//!  waits for a receive operation to finish before dispatching the next.

mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::conduit::{ConduitError, ReceiveClaim};
use crate::config::MonitorConfig;
use crate::pool::{Task, TaskError, TaskExecutionPool, TaskProgress};

pub use registry::ConduitRegistry;

struct ReceiveTask;

impl Task for ReceiveTask {
    type Params = ReceiveClaim;
    type Output = ();

    fn name(&self) -> &str {
        "receive"
    }

    fn validate_params(&self, claim: &ReceiveClaim) -> Result<(), TaskError> {
        if !claim.conduit().is_connected() {
            return Err(TaskError::InvalidParams(format!("conduit #{} is closed", claim.conduit().id())));
        }
        Ok(())
    }

    fn execute(&self, claim: ReceiveClaim, _progress: &TaskProgress) -> anyhow::Result<()> {
        match claim.receive() {
            Ok(()) => Ok(()),
            // closed concurrently
            Err(ConduitError::NotConnected) => Ok(()),
            Err(e) => {
                debug!("receive failed for conduit #{}: {}", claim.conduit().id(), e);
                Err(e.into())
            }
        }
    }
}

pub struct ConduitMonitor {
    shut_down: Arc<AtomicBool>,
    pool: Arc<TaskExecutionPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConduitMonitor {
    pub fn start(registry: Arc<ConduitRegistry>, config: &MonitorConfig) -> anyhow::Result<ConduitMonitor> {
        config.validate()?;

        let pool = Arc::new(TaskExecutionPool::new(config.receiver_pool_config())?);
        let shut_down = Arc::new(AtomicBool::new(false));

        let thread = {
            let pool = pool.clone();
            let shut_down = shut_down.clone();
            let scan_pause = config.scan_pause;
            std::thread::Builder::new()
                .name("conduit-monitor".to_string())
                .spawn(move || Self::run(registry, pool, shut_down, scan_pause))?
        };

        info!("started conduit monitor with {} receive workers", config.receiver_pool_size);
        Ok(ConduitMonitor {
            shut_down,
            pool,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(registry: Arc<ConduitRegistry>, pool: Arc<TaskExecutionPool>, shut_down: Arc<AtomicBool>, scan_pause: Duration) {
        let task = Arc::new(ReceiveTask);
        let mut index = 0;

        while !shut_down.load(Ordering::Acquire) {
            let conduit = match registry.get(index) {
                Some(conduit) => conduit,
                None => {
                    index = 0;
                    std::thread::sleep(scan_pause);
                    continue;
                }
            };
            index += 1;

            let claim = match conduit.try_claim_receive() {
                Some(claim) => claim,
                None => continue,
            };

            match pool.do_task(task.clone(), claim, true) {
                Ok(_) => {}
                Err(TaskError::ShutDown) => break,
                Err(TaskError::InvalidParams(msg)) => trace!("skipping receive: {}", msg),
                Err(e) => warn!("could not dispatch receive for conduit #{}: {}", conduit.id(), e),
            }
        }

        debug!("conduit monitor terminated");
    }

    /// Stop scanning and shut down the receive workers. Receive operations in progress are
    ///  completed.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down conduit monitor");

        // wakes up the monitor thread if it waits for a worker
        self.pool.shutdown();

        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("conduit monitor thread panicked");
            }
        }
    }
}

impl Drop for ConduitMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
