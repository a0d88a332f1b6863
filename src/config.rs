use std::time::Duration;
use anyhow::bail;
use crate::codec::{CodecKind, MAX_FRAGMENT_SIZE};

pub struct ConduitConfig {
    /// This is the maximum payload size of a single data fragment. A conduit over a UDP channel
    ///  sends each fragment in a datagram of its own, so the fragment size plus the codec's
    ///  header length must fit into the payload of a single datagram on all routes between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, that payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4. Over TCP, bigger fragments reduce header overhead.
    pub fragment_size: usize,

    /// the codec a new conduit starts with - it can be replaced at runtime
    pub codec: CodecKind,

    /// the number of bytes read from the channel in a single read call
    pub read_chunk_size: usize,
    /// Reading from the channel stops while this many unparsed bytes are buffered, so a single
    ///  receive operation can not hog a worker for a fast sender
    pub max_buffered_raw_bytes: usize,

    /// the lag estimate a conduit starts with before it has observed any fragment arrivals
    pub initial_lag: Duration,
    /// lower bound for the lag estimate - fragments extracted from the same read have zero
    ///  inter-arrival gap
    pub min_lag: Duration,

    /// Without progress for `lag estimate * timeout_multiplier`, a poll counts as a timeout.
    pub timeout_multiplier: u32,
    /// The conduit fails when it observed more than this many consecutive timeouts...
    pub max_timeouts: u32,
    /// ... and no fragment arrived for at least this long.
    pub min_timeout: Duration,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        ConduitConfig {
            fragment_size: 4096,
            codec: CodecKind::Plain,
            read_chunk_size: 64*1024,
            max_buffered_raw_bytes: 1024*1024,
            initial_lag: Duration::from_millis(50),
            min_lag: Duration::from_millis(1),
            timeout_multiplier: 20,
            max_timeouts: 3,
            min_timeout: Duration::from_secs(10),
        }
    }
}

impl ConduitConfig {
    /// settings for a conduit over UDP with end-to-end full Ethernet MTU
    pub fn default_udp_ipv4() -> ConduitConfig {
        ConduitConfig {
            fragment_size: 1472 - 40,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_size == 0 || self.fragment_size > MAX_FRAGMENT_SIZE {
            bail!("fragment size must be between 1 and {}, was {}", MAX_FRAGMENT_SIZE, self.fragment_size);
        }
        if self.read_chunk_size < self.fragment_size + self.codec.create().header_len() {
            bail!("read chunk size {} must hold at least one complete fragment", self.read_chunk_size);
        }
        if self.max_buffered_raw_bytes < self.read_chunk_size {
            bail!("max buffered raw bytes {} must not be smaller than the read chunk size {}", self.max_buffered_raw_bytes, self.read_chunk_size);
        }
        if self.min_lag.is_zero() {
            bail!("minimum lag must be positive");
        }
        if self.initial_lag < self.min_lag {
            bail!("initial lag {:?} is smaller than the minimum lag {:?}", self.initial_lag, self.min_lag);
        }
        if self.timeout_multiplier == 0 {
            bail!("timeout multiplier must be positive");
        }
        Ok(())
    }
}

pub struct PoolConfig {
    /// prefix for worker thread names
    pub name: String,
    /// absolute upper bound for the number of concurrently executing tasks
    pub max_active: usize,
    /// the number of idle workers kept for reuse - workers in excess of this number are torn
    ///  down when they become idle
    pub max_idle: usize,
}

impl PoolConfig {
    pub fn new(name: &str, max_active: usize, max_idle: usize) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            max_active,
            max_idle,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_active == 0 {
            bail!("pool {} must allow at least one active worker", self.name);
        }
        if self.max_idle > self.max_active {
            bail!("pool {} retains up to {} idle workers, but allows only {} active workers", self.name, self.max_idle, self.max_active);
        }
        Ok(())
    }
}

pub struct MonitorConfig {
    /// the number of receive operations that may run concurrently, regardless of the number
    ///  of open conduits
    pub receiver_pool_size: usize,
    /// pause after each complete pass over all registered conduits
    pub scan_pause: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            receiver_pool_size: 4,
            scan_pause: Duration::from_millis(5),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receiver_pool_size == 0 {
            bail!("receiver pool size must be positive");
        }
        Ok(())
    }

    pub fn receiver_pool_config(&self) -> PoolConfig {
        PoolConfig::new("conduit-receiver", self.receiver_pool_size, self.receiver_pool_size)
    }
}
