use std::fmt::{Display, Formatter};
use anyhow::bail;
use crate::util::safe_converter::SafeCast;

/// A running total that does not overflow when fed with `u64` increments for the lifetime of a
///  process. It is used for traffic statistics only, never for protocol decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnboundedCounter {
    total: u128,
}

impl UnboundedCounter {
    pub fn new() -> UnboundedCounter {
        Self::default()
    }

    pub fn add(&mut self, n: u64) -> u128 {
        // 2^64 increments of u64::MAX still fit into a u128
        self.total = self.total.saturating_add(n.safe_cast());
        self.total
    }

    pub fn subtract(&mut self, n: u64) -> anyhow::Result<u128> {
        match self.total.checked_sub(n.safe_cast()) {
            Some(total) => {
                self.total = total;
                Ok(total)
            }
            None => bail!("subtracting {} from counter value {} would make it negative", n, self.total),
        }
    }

    pub fn value(&self) -> u128 {
        self.total
    }
}

impl Display for UnboundedCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.total)
    }
}
