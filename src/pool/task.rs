use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use crate::pool::TaskError;

/// A unit of work that can be dispatched to a [crate::pool::TaskExecutionPool].
///
/// Parameters are validated when the task is submitted, so invalid parameters are reported to
///  the submitting code rather than surfacing as a failed execution. Each submission moves its
///  parameters into the pool, and the returned [crate::pool::TaskHandle] tracks that
///  submission's state, so a single task instance can be submitted many times concurrently.
pub trait Task: Send + Sync + 'static {
    type Params: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn validate_params(&self, _params: &Self::Params) -> Result<(), TaskError> {
        Ok(())
    }

    fn execute(&self, params: Self::Params, progress: &TaskProgress) -> anyhow::Result<Self::Output>;
}

/// Fractional progress of a running task between 0.0 and 1.0, shared between the task and its
///  handle
#[derive(Clone, Debug, Default)]
pub struct TaskProgress {
    bits: Arc<AtomicU64>,
}

impl TaskProgress {
    pub fn set(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        self.bits.store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
