use std::sync::Arc;
use std::time::Duration;
use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{ByteChannel, ChannelRead};
use crate::codec::{CodecError, Extraction, Fragment, FragmentCodec, MAX_FRAGMENT_SIZE};
use crate::config::ConduitConfig;
use crate::conduit::inbound::{InboundBundle, Insertion};
use crate::conduit::stats::ConduitStats;
use crate::conduit::ConduitError;
use crate::util::rolling_data::RollingData;
use crate::util::safe_converter::SafeCast;

/// A bundle's deadline is based on at least this many outstanding fragments
const MIN_DEADLINE_FRAGMENTS: u32 = 5;

type BundleKey = (u64, u64);

/// The protocol state of a conduit, protected by a single lock because writing and receiving
///  both send fragments and update counters.
pub(super) struct ConduitInner {
    config: Arc<ConduitConfig>,
    channel: Box<dyn ByteChannel>,
    codec: Arc<dyn FragmentCodec>,
    fragment_size: usize,
    closed: bool,

    /// bytes read from the channel but not parsed into fragments yet
    raw: BytesMut,
    read_chunk: Vec<u8>,
    send_buf: BytesMut,

    /// bundles that were sent but not acknowledged by the peer yet
    outbound: FxHashMap<BundleKey, Vec<Fragment>>,
    inbound: FxHashMap<BundleKey, InboundBundle>,

    generation: u64,
    next_bundle_id: u64,

    /// inter-arrival gaps between extracted fragments, in seconds
    arrival_gaps: RollingData<5>,
    last_arrival: Option<Instant>,
    /// the reference point for the timeout policy: the last fragment arrival or the last
    ///  write, whichever is later
    last_progress: Instant,
    num_timeouts: u32,

    pub stats: ConduitStats,
}

impl ConduitInner {
    pub fn new(config: Arc<ConduitConfig>, channel: Box<dyn ByteChannel>, generation: u64) -> ConduitInner {
        ConduitInner {
            codec: config.codec.create(),
            fragment_size: config.fragment_size,
            closed: false,
            raw: BytesMut::with_capacity(config.read_chunk_size),
            read_chunk: vec![0; config.read_chunk_size],
            send_buf: BytesMut::with_capacity(config.fragment_size + 64),
            outbound: FxHashMap::default(),
            inbound: FxHashMap::default(),
            generation,
            next_bundle_id: 1,
            arrival_gaps: RollingData::new(config.initial_lag.as_secs_f64()),
            last_arrival: None,
            last_progress: Instant::now(),
            num_timeouts: 0,
            stats: ConduitStats::default(),
            channel,
            config,
        }
    }

    pub fn codec(&self) -> &Arc<dyn FragmentCodec> {
        &self.codec
    }

    pub fn set_codec(&mut self, codec: Arc<dyn FragmentCodec>) {
        debug!("switching codec from {:?} to {:?}", self.codec.kind(), codec.kind());
        self.codec = codec;
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn set_fragment_size(&mut self, fragment_size: usize) -> Result<(), ConduitError> {
        if fragment_size == 0 || fragment_size > MAX_FRAGMENT_SIZE {
            return Err(CodecError::InvalidFragmentSize(fragment_size).into());
        }
        debug!("changing fragment size from {} to {}", self.fragment_size, fragment_size);
        self.fragment_size = fragment_size;
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        debug!("advanced to generation {}", self.generation);
        self.generation
    }

    pub fn has_raw_input(&self) -> bool {
        !self.raw.is_empty()
    }

    pub fn num_unacknowledged(&self) -> usize {
        self.outbound.len()
    }

    /// the current lag estimate, never below the configured minimum
    pub fn lag_estimate(&self) -> Duration {
        // the cached sum can drift slightly below zero after evicting the last non-zero gap
        Duration::from_secs_f64(self.arrival_gaps.mean().max(0.0))
            .max(self.config.min_lag)
    }

    pub fn write_bundle(&mut self, buf: &[u8], flush_immediately: bool) -> Result<(), ConduitError> {
        if self.closed {
            return Err(ConduitError::NotConnected);
        }

        let bundle_id = self.next_bundle_id;
        let fragments = self.codec.decompose(buf, self.fragment_size, self.generation, bundle_id)?;
        self.next_bundle_id += 1;

        trace!("sending bundle {} with {} data fragments", bundle_id, fragments.len() - 1);
        for fragment in &fragments {
            Self::send_fragment(self.codec.as_ref(), self.channel.as_mut(), &mut self.send_buf, &mut self.stats, fragment)?;
        }

        if self.outbound.is_empty() {
            self.last_progress = Instant::now();
        }
        self.outbound.insert((self.generation, bundle_id), fragments);
        self.stats.bundles_sent.add(1);

        if flush_immediately {
            self.channel.flush()?;
        }
        Ok(())
    }

    fn send_fragment(codec: &dyn FragmentCodec, channel: &mut dyn ByteChannel, send_buf: &mut BytesMut, stats: &mut ConduitStats, fragment: &Fragment) -> Result<(), ConduitError> {
        send_buf.clear();
        codec.ser(fragment, send_buf);
        channel.write_fragment(&send_buf[..])?;

        stats.bytes_sent.add(send_buf.len().safe_cast());
        stats.packets_sent.add(1);
        Ok(())
    }

    fn send_control(&mut self, fragment: Fragment) -> Result<(), ConduitError> {
        Self::send_fragment(self.codec.as_ref(), self.channel.as_mut(), &mut self.send_buf, &mut self.stats, &fragment)?;
        self.channel.flush()?;
        Ok(())
    }

    /// Read what is available from the channel and process all complete fragments, passing
    ///  reassembled bundles to `deliver` in completion order.
    pub fn receive(&mut self, deliver: &mut dyn FnMut(Bytes)) -> Result<(), ConduitError> {
        if self.closed {
            return Err(ConduitError::NotConnected);
        }

        let end_of_stream = self.fill_raw_buffer()?;

        let now = Instant::now();
        let num_extracted = self.internal_read(now, deliver)?;
        self.purge_inbound(now);

        if end_of_stream {
            return Err(ConduitError::EndOfStream);
        }

        if num_extracted > 0 {
            self.num_timeouts = 0;
        }
        else if self.has_outstanding_bundles() {
            self.check_timeout(now)?;
        }
        Ok(())
    }

    /// returns `true` if the peer closed the channel
    fn fill_raw_buffer(&mut self) -> Result<bool, ConduitError> {
        while self.raw.len() < self.config.max_buffered_raw_bytes {
            match self.channel.read_available(&mut self.read_chunk)? {
                ChannelRead::Data(n) => {
                    trace!("read {} bytes from {}", n, self.channel.description());
                    self.raw.extend_from_slice(&self.read_chunk[..n]);
                    self.stats.bytes_received.add(n.safe_cast());
                }
                ChannelRead::Nothing => return Ok(false),
                ChannelRead::EndOfStream => {
                    debug!("end of stream on {}", self.channel.description());
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// extract and process fragments while complete fragments are buffered, returning the
    ///  number of fragments extracted
    fn internal_read(&mut self, now: Instant, deliver: &mut dyn FnMut(Bytes)) -> Result<usize, ConduitError> {
        let mut num_extracted = 0;

        while !self.raw.is_empty() {
            match self.codec.extract(&self.raw) {
                Extraction::Fragment { fragment, consumed } => {
                    self.raw.advance(consumed);
                    self.stats.packets_received.add(1);
                    self.on_fragment_arrival(now);
                    num_extracted += 1;

                    if Self::is_control(&fragment) {
                        self.on_control_fragment(fragment)?;
                    }
                    else {
                        self.on_bundle_fragment(fragment, now, deliver)?;
                    }
                }
                Extraction::Incomplete => break,
                Extraction::Malformed { skip, reason } => {
                    warn!("dropping {} bytes from {}: {}", skip, self.channel.description(), reason);
                    self.raw.advance(skip);
                }
            }
        }
        Ok(num_extracted)
    }

    /// Fragment id 0 is shared by headers and acks / naks. Control fragments have a length that
    ///  is not a valid fragment count.
    fn is_control(fragment: &Fragment) -> bool {
        fragment.fragment_id() == 0
            && fragment.generation() != 0
            && fragment.message_id() != 0
            && fragment.length() <= Fragment::ACK_LENGTH
    }

    fn on_fragment_arrival(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival {
            self.arrival_gaps.add_value(now.saturating_duration_since(prev).as_secs_f64());
        }
        self.last_arrival = Some(now);
        self.last_progress = now;
    }

    fn on_control_fragment(&mut self, fragment: Fragment) -> Result<(), ConduitError> {
        let key = fragment.bundle_key();

        if fragment.length() < Fragment::ACK_LENGTH {
            warn!("peer could not process bundle {:?} - retransmission is not supported", key);
            return Ok(());
        }

        if self.outbound.remove(&key).is_some() {
            trace!("bundle {:?} was acknowledged", key);
            return self.send_control(Fragment::ack(key.0, key.1));
        }

        if self.inbound.remove(&key).is_some() {
            trace!("ack for bundle {:?} was acknowledged", key);
            return Ok(());
        }

        trace!("ignoring ack for unknown bundle {:?}", key);
        Ok(())
    }

    fn on_bundle_fragment(&mut self, fragment: Fragment, now: Instant, deliver: &mut dyn FnMut(Bytes)) -> Result<(), ConduitError> {
        let key = fragment.bundle_key();

        if fragment.fragment_id() == 0 && fragment.length() <= 0 {
            // neither a header nor a valid ack / nak, and never answered
            warn!("dropping control fragment with length {} for invalid bundle {:?}", fragment.length(), key);
            return Ok(());
        }

        let lag = self.lag_estimate();

        let bundle = self.inbound.entry(key)
            .or_insert_with(|| InboundBundle::new(now, now + lag * MIN_DEADLINE_FRAGMENTS));

        if bundle.complete {
            if bundle.ack_sent {
                debug!("duplicate fragment #{} for completed bundle {:?} - sending ack again", fragment.fragment_id(), key);
                return self.send_control(Fragment::ack(key.0, key.1));
            }
            return Ok(());
        }

        match bundle.insert(fragment) {
            Insertion::Added => {}
            Insertion::Duplicate => {
                trace!("ignoring duplicate fragment for bundle {:?}", key);
                return Ok(());
            }
            Insertion::Invalid(reason) => {
                return self.reject_bundle(key, &reason);
            }
        }

        bundle.last_arrival = now;
        let num_remaining = bundle.num_missing().unwrap_or(0);
        let num_remaining = u32::try_from(num_remaining).unwrap_or(u32::MAX).max(MIN_DEADLINE_FRAGMENTS);
        bundle.deadline = now + lag * num_remaining;

        if !bundle.is_collected() {
            return Ok(());
        }

        let fragments = bundle.take_fragments();
        match self.codec.recombine(fragments) {
            Ok(buf) => {
                bundle.complete = true;
                self.send_control(Fragment::ack(key.0, key.1))?;
                if let Some(bundle) = self.inbound.get_mut(&key) {
                    bundle.ack_sent = true;
                }

                debug!("received bundle {:?} with {} bytes", key, buf.len());
                self.stats.bundles_received.add(1);
                deliver(buf);
                Ok(())
            }
            Err(e) => self.reject_bundle(key, &e.to_string()),
        }
    }

    /// Discard an inbound bundle and nak it. Keys with a zero component can not be told apart
    ///  from invalid control fragments by the peer, so they are never nak'ed.
    fn reject_bundle(&mut self, key: BundleKey, reason: &str) -> Result<(), ConduitError> {
        warn!("discarding bundle {:?}: {}", key, reason);
        self.inbound.remove(&key);

        if key.0 == 0 || key.1 == 0 {
            return Ok(());
        }
        self.send_control(Fragment::nak(key.0, key.1))
    }

    /// Drop completed bundles past their deadline, and incomplete bundles that received no
    ///  fragment for half the minimum timeout.
    ///
    /// Every fragment arrival is also progress for the timeout policy, so an incomplete bundle
    ///  is always discarded before it could make the conduit fail: a stalled inbound bundle
    ///  only costs the bundle, while a stalled outbound bundle is fatal.
    fn purge_inbound(&mut self, now: Instant) {
        let max_silence = self.config.min_timeout / 2;
        self.inbound.retain(|key, bundle| {
            if bundle.complete {
                if now >= bundle.deadline {
                    trace!("dropping completed bundle {:?} without ack for the ack", key);
                    return false;
                }
            }
            else if now.saturating_duration_since(bundle.last_arrival) > max_silence {
                warn!("discarding incomplete bundle {:?}: {:?} missing fragments are overdue", key, bundle.num_missing());
                return false;
            }
            else if now >= bundle.deadline {
                trace!("bundle {:?} is overdue", key);
            }
            true
        });
    }

    #[cfg(test)]
    pub fn inbound_deadline(&self, key: BundleKey) -> Option<Instant> {
        self.inbound.get(&key)
            .map(|b| b.deadline)
    }

    fn has_outstanding_bundles(&self) -> bool {
        !self.outbound.is_empty() || self.inbound.values().any(|b| !b.complete)
    }

    fn check_timeout(&mut self, now: Instant) -> Result<(), ConduitError> {
        let elapsed = now.saturating_duration_since(self.last_progress);
        if elapsed <= self.lag_estimate() * self.config.timeout_multiplier {
            return Ok(());
        }

        self.num_timeouts += 1;
        debug!("no progress for {:?}, timeout #{}", elapsed, self.num_timeouts);

        if self.num_timeouts > self.config.max_timeouts && elapsed > self.config.min_timeout {
            return Err(ConduitError::Timeout { elapsed });
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.channel.close() {
            debug!("error closing {}: {}", self.channel.description(), e);
        }
        self.outbound.clear();
        self.inbound.clear();
        self.raw.clear();
    }
}
