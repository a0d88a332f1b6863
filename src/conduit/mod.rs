//! A conduit turns a non-blocking byte channel into reliable delivery of *bundles*, i.e.
//!  application buffers of arbitrary size.
//!
//! Each bundle is identified by the sending conduit's generation and a bundle id, decomposed
//!  into fragments by the active [FragmentCodec] and transmitted fragment by fragment. The
//!  receiving conduit collects fragments in any order, recombines the bundle once it is
//!  complete, acknowledges it and makes it available for [Conduit::read]:
//!
//! ```ascii
//! sender                                  receiver
//!   |--- header, data #1 .. data #n  ------->|   collect, recombine, enqueue
//!   |<-------------------------------- ack --|
//!   |--- ack (for the ack) ----------------->|   forget the bundle
//! ```
//!
//! Acks are fragments with id 0 and length 0, naks have negative length. They share fragment
//!  id 0 with bundle headers, see [Fragment].
//!
//! There is no retransmission: if the peer does not make progress for too long, the conduit
//!  fails with [ConduitError::Timeout] and closes, and the application needs to establish a new
//!  connection.
//!
//! Receiving is driven from the outside, typically by a [crate::monitor::ConduitMonitor] that
//!  calls [Conduit::receive] for all registered conduits.

mod inbound;
mod inner;
mod stats;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, SystemTime};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug_span, info, trace, warn};

use crate::channel::ByteChannel;
use crate::codec::{CodecError, CodecKind, FragmentCodec};
use crate::config::ConduitConfig;
use crate::monitor::ConduitRegistry;
use inner::ConduitInner;

pub use stats::ConduitStatsSnapshot;

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("conduit is not connected")]
    NotConnected,
    #[error("no progress for {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("the peer closed the channel")]
    EndOfStream,
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("bundle of {needed} bytes does not fit into a buffer of {available} bytes")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("bundle is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

impl ConduitError {
    /// Fatal errors leave the conduit in an undefined protocol state, so it is closed
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConduitError::Timeout { .. } | ConduitError::EndOfStream | ConduitError::Io(_))
    }
}

pub struct Conduit {
    id: u64,
    description: String,
    inner: Mutex<ConduitInner>,

    /// reassembled bundles in completion order, separate from `inner` so that readers never
    ///  wait for a receive operation
    ready: Mutex<VecDeque<Bytes>>,
    input_available: Condvar,

    connected: AtomicBool,
    receive_in_progress: AtomicBool,
    registry: Weak<ConduitRegistry>,
}

impl Conduit {
    /// Create a conduit over an already connected channel and register it with the registry.
    pub fn new(registry: &Arc<ConduitRegistry>, channel: impl ByteChannel, config: Arc<ConduitConfig>) -> anyhow::Result<Arc<Conduit>> {
        config.validate()?;

        let generation = Self::generation_from_timestamp()?;
        let description = channel.description();

        let conduit = Arc::new(Conduit {
            id: registry.next_id(),
            description,
            inner: Mutex::new(ConduitInner::new(config, Box::new(channel), generation)),
            ready: Default::default(),
            input_available: Condvar::new(),
            connected: AtomicBool::new(true),
            receive_in_progress: AtomicBool::new(false),
            registry: Arc::downgrade(registry),
        });

        info!("opened conduit #{} on {} with generation {:x}", conduit.id, conduit.description, generation);
        registry.register(conduit.clone());
        Ok(conduit)
    }

    /// The upper 48 bits are a millisecond timestamp so that a restarted process uses a higher
    ///  generation, the lower 16 bits are random to separate conduits opened in the same
    ///  millisecond.
    fn generation_from_timestamp() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if raw > 0xffff_ffff_ffff {
            anyhow::bail!("system clock is in the future");
        }
        Ok(((raw as u64) << 16) | rand::random::<u16>() as u64)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn check_connected(&self) -> Result<(), ConduitError> {
        if self.is_connected() {
            Ok(())
        }
        else {
            Err(ConduitError::NotConnected)
        }
    }

    /// Close the conduit if the operation failed in a way that leaves it unusable. This must be
    ///  called without holding the `inner` lock.
    fn close_on_fatal<T>(&self, result: Result<T, ConduitError>) -> Result<T, ConduitError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("closing conduit #{} on {}: {}", self.id, self.description, e);
                self.close();
            }
        }
        result
    }

    /// Send a buffer as a single bundle. Fragments are written to the channel immediately, but
    ///  a buffering channel may hold them back until it is flushed.
    pub fn write(&self, buf: &[u8], flush_immediately: bool) -> Result<(), ConduitError> {
        self.check_connected()?;
        let result = self.inner.lock().unwrap().write_bundle(buf, flush_immediately);
        self.close_on_fatal(result)
    }

    pub fn write_str(&self, s: &str, flush_immediately: bool) -> Result<(), ConduitError> {
        self.write(s.as_bytes(), flush_immediately)
    }

    /// Process whatever the channel has available without blocking: reassemble bundles, handle
    ///  acks and check for timeouts.
    ///
    /// Only one receive operation may run for a conduit at any given time, see
    ///  [Conduit::try_claim_receive].
    pub fn receive(&self) -> Result<(), ConduitError> {
        self.check_connected()?;

        let span = debug_span!("receive", conduit = self.id);
        let _entered = span.enter();

        let result = self.inner.lock().unwrap().receive(&mut |bundle| self.enqueue(bundle));
        self.close_on_fatal(result)
    }

    fn enqueue(&self, bundle: Bytes) {
        self.ready.lock().unwrap().push_back(bundle);
        self.input_available.notify_all();
    }

    /// a reassembled bundle is available for reading
    pub fn has_input(&self) -> bool {
        !self.ready.lock().unwrap().is_empty()
    }

    /// bytes were received that are not part of a complete fragment yet
    pub fn has_raw_input(&self) -> bool {
        self.inner.lock().unwrap().has_raw_input()
    }

    /// Take the oldest reassembled bundle. Bundles that were reassembled before the conduit
    ///  was closed can still be read after closing.
    pub fn read(&self) -> Result<Option<Bytes>, ConduitError> {
        let mut ready = self.ready.lock().unwrap();
        match ready.pop_front() {
            Some(bundle) => Ok(Some(bundle)),
            None => {
                self.check_connected()?;
                Ok(None)
            }
        }
    }

    /// Copy the oldest reassembled bundle into `buf`, returning its length. If the buffer is
    ///  too small, the bundle stays queued.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<Option<usize>, ConduitError> {
        let mut ready = self.ready.lock().unwrap();
        let needed = match ready.front() {
            Some(bundle) => bundle.len(),
            None => {
                self.check_connected()?;
                return Ok(None);
            }
        };

        if needed > buf.len() {
            return Err(ConduitError::BufferTooSmall { needed, available: buf.len() });
        }
        if let Some(bundle) = ready.pop_front() {
            buf[..needed].copy_from_slice(&bundle);
        }
        Ok(Some(needed))
    }

    /// Take the oldest reassembled bundle as a string. A bundle that is not valid UTF-8 stays
    ///  queued.
    pub fn read_string(&self) -> Result<Option<String>, ConduitError> {
        let mut ready = self.ready.lock().unwrap();
        let s = match ready.front() {
            Some(bundle) => std::str::from_utf8(bundle)?.to_string(),
            None => {
                self.check_connected()?;
                return Ok(None);
            }
        };
        ready.pop_front();
        Ok(Some(s))
    }

    /// Block until a bundle is available for reading, the conduit is closed or the timeout
    ///  elapses. Returns `true` if a bundle is available.
    pub fn wait_for_input(&self, timeout: Duration) -> bool {
        let ready = self.ready.lock().unwrap();
        let (ready, _) = self.input_available
            .wait_timeout_while(ready, timeout, |r| r.is_empty() && self.is_connected())
            .unwrap();
        !ready.is_empty()
    }

    pub fn set_codec(&self, codec: Arc<dyn FragmentCodec>) {
        self.inner.lock().unwrap().set_codec(codec);
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.inner.lock().unwrap().codec().kind()
    }

    pub fn fragment_size(&self) -> usize {
        self.inner.lock().unwrap().fragment_size()
    }

    pub fn set_fragment_size(&self, fragment_size: usize) -> Result<(), ConduitError> {
        self.inner.lock().unwrap().set_fragment_size(fragment_size)
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation()
    }

    /// Switch to the next generation, e.g. after re-negotiating the connection. Bundles sent
    ///  afterwards can not be confused with those of the previous generation.
    pub fn advance_generation(&self) -> u64 {
        self.inner.lock().unwrap().advance_generation()
    }

    pub fn lag_estimate(&self) -> Duration {
        self.inner.lock().unwrap().lag_estimate()
    }

    /// number of sent bundles that were not acknowledged by the peer yet
    pub fn num_unacknowledged(&self) -> usize {
        self.inner.lock().unwrap().num_unacknowledged()
    }

    pub fn bytes_sent(&self) -> u128 {
        self.inner.lock().unwrap().stats.bytes_sent.value()
    }

    pub fn bytes_received(&self) -> u128 {
        self.inner.lock().unwrap().stats.bytes_received.value()
    }

    pub fn packets_sent(&self) -> u128 {
        self.inner.lock().unwrap().stats.packets_sent.value()
    }

    pub fn packets_received(&self) -> u128 {
        self.inner.lock().unwrap().stats.packets_received.value()
    }

    pub fn bundles_sent(&self) -> u128 {
        self.inner.lock().unwrap().stats.bundles_sent.value()
    }

    pub fn bundles_received(&self) -> u128 {
        self.inner.lock().unwrap().stats.bundles_received.value()
    }

    pub fn stats(&self) -> ConduitStatsSnapshot {
        self.inner.lock().unwrap().stats.snapshot()
    }

    /// Close the channel, discard all protocol state and deregister the conduit. Closing is
    ///  irreversible, and subsequent calls have no effect.
    pub fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("closing conduit #{} on {}", self.id, self.description);
        self.inner.lock().unwrap().close();

        // wake up readers waiting for input
        drop(self.ready.lock().unwrap());
        self.input_available.notify_all();

        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }

    /// Mark the conduit as having a receive operation in progress. Returns `None` if a receive
    ///  operation is in progress already, and the claim is released when the returned value is
    ///  dropped.
    pub fn try_claim_receive(self: &Arc<Self>) -> Option<ReceiveClaim> {
        self.receive_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReceiveClaim { conduit: self.clone() })
    }

    pub fn is_receive_in_progress(&self) -> bool {
        self.receive_in_progress.load(Ordering::Acquire)
    }
}

/// Exclusive permission to run a receive operation on a conduit
pub struct ReceiveClaim {
    conduit: Arc<Conduit>,
}

impl ReceiveClaim {
    pub fn conduit(&self) -> &Arc<Conduit> {
        &self.conduit
    }

    pub fn receive(&self) -> Result<(), ConduitError> {
        self.conduit.receive()
    }
}

impl Drop for ReceiveClaim {
    fn drop(&mut self) {
        trace!("releasing receive claim for conduit #{}", self.conduit.id);
        self.conduit.receive_in_progress.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use bytes::BytesMut;
    use rstest::rstest;
    use tokio::time::Instant;
    use crate::channel::{ChannelRead, MemoryChannel, MockByteChannel};
    use crate::codec::{Extraction, Fragment};

    fn test_config() -> Arc<ConduitConfig> {
        Arc::new(ConduitConfig::default())
    }

    fn test_buf(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn open_pair(config: Arc<ConduitConfig>) -> (Arc<ConduitRegistry>, Arc<Conduit>, Arc<Conduit>) {
        let registry = ConduitRegistry::new();
        let (a, b) = MemoryChannel::pair();
        let a = Conduit::new(&registry, a, config.clone()).unwrap();
        let b = Conduit::new(&registry, b, config).unwrap();
        (registry, a, b)
    }

    /// a conduit on one end of a memory channel, with the raw other end for the test to play
    ///  the peer
    fn open_with_raw_peer(kind: CodecKind) -> (Arc<ConduitRegistry>, Arc<Conduit>, MemoryChannel) {
        let registry = ConduitRegistry::new();
        let (channel, peer) = MemoryChannel::pair();
        let config = ConduitConfig {
            codec: kind,
            ..ConduitConfig::default()
        };
        let conduit = Conduit::new(&registry, channel, Arc::new(config)).unwrap();
        (registry, conduit, peer)
    }

    fn send_raw(peer: &mut MemoryChannel, kind: CodecKind, fragment: &Fragment) {
        let mut buf = BytesMut::new();
        kind.create().ser(fragment, &mut buf);
        peer.write_fragment(&buf).unwrap();
    }

    /// all fragments the peer received so far
    fn received_raw(peer: &mut MemoryChannel, kind: CodecKind) -> Vec<Fragment> {
        let mut raw = vec![0u8; 1024*1024];
        let len = match peer.read_available(&mut raw).unwrap() {
            ChannelRead::Data(n) => n,
            _ => 0,
        };

        let codec = kind.create();
        let mut result = Vec::new();
        let mut offs = 0;
        while offs < len {
            match codec.extract(&raw[offs..len]) {
                Extraction::Fragment { fragment, consumed } => {
                    result.push(fragment);
                    offs += consumed;
                }
                other => panic!("unexpected extraction result {:?}", other),
            }
        }
        result
    }

    fn is_ack(fragment: &Fragment) -> bool {
        fragment.fragment_id() == 0 && fragment.length() == Fragment::ACK_LENGTH
    }

    fn is_nak(fragment: &Fragment) -> bool {
        fragment.fragment_id() == 0 && fragment.length() < Fragment::ACK_LENGTH
    }

    #[test]
    fn test_write_50_bytes() {
        let (_registry, a, b) = open_pair(test_config());
        let data = test_buf(50);

        a.write(&data, true).unwrap();
        assert!(!b.has_input());
        assert_eq!(a.num_unacknowledged(), 1);

        b.receive().unwrap();
        assert!(b.has_input());
        assert!(!b.has_raw_input());
        assert_eq!(b.read().unwrap().unwrap().as_ref(), data.as_slice());
        assert!(!b.has_input());
        assert_eq!(b.read().unwrap(), None);

        // ack
        a.receive().unwrap();
        assert_eq!(a.num_unacknowledged(), 0);
        // ack for the ack
        b.receive().unwrap();

        assert_eq!(a.stats(), ConduitStatsSnapshot {
            bytes_sent: 2*26 + 50 + 26,
            bytes_received: 26,
            packets_sent: 3,
            packets_received: 1,
            bundles_sent: 1,
            bundles_received: 0,
        });
        assert_eq!(b.stats(), ConduitStatsSnapshot {
            bytes_sent: 26,
            bytes_received: 2*26 + 50 + 26,
            packets_sent: 1,
            packets_received: 3,
            bundles_sent: 0,
            bundles_received: 1,
        });
    }

    #[rstest]
    #[case::large(CodecKind::Plain, 100_000, 4096)]
    #[case::exact_multiple(CodecKind::Plain, 4096*3, 4096)]
    #[case::checksummed(CodecKind::Checksummed, 100_000, 1000)]
    #[case::single_fragment(CodecKind::Checksummed, 1, 4096)]
    fn test_round_trip(#[case] kind: CodecKind, #[case] len: usize, #[case] fragment_size: usize) {
        let config = Arc::new(ConduitConfig {
            codec: kind,
            fragment_size,
            ..ConduitConfig::default()
        });
        let (_registry, a, b) = open_pair(config);
        let data = test_buf(len);

        a.write(&data, false).unwrap();
        a.write_str("second", false).unwrap();

        while b.has_raw_input() || !b.has_input() || b.bundles_received() < 2 {
            b.receive().unwrap();
        }
        assert_eq!(b.read().unwrap().unwrap().as_ref(), data.as_slice());
        assert_eq!(b.read_string().unwrap(), Some("second".to_string()));
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::header_last(vec![1, 2, 3, 4, 0])]
    #[case::shuffled(vec![2, 0, 4, 1, 3])]
    fn test_order_independent_reassembly(#[values(CodecKind::Plain, CodecKind::Checksummed)] kind: CodecKind, #[case] order: Vec<usize>) {
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        let data = test_buf(10);
        let fragments = kind.create().decompose(&data, 3, 77, 5).unwrap();
        assert_eq!(fragments.len(), 5);

        for (n, &idx) in order.iter().enumerate() {
            assert!(!conduit.has_input());
            send_raw(&mut peer, kind, &fragments[idx]);
            conduit.receive().unwrap();
            assert_eq!(conduit.has_input(), n == order.len() - 1);
        }

        assert_eq!(conduit.read().unwrap().unwrap().as_ref(), data.as_slice());

        let sent = received_raw(&mut peer, kind);
        assert_eq!(sent, vec![Fragment::ack(77, 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_fragments() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        let fragments = kind.create().decompose(&test_buf(10), 3, 77, 5).unwrap();

        send_raw(&mut peer, kind, &fragments[0]);
        send_raw(&mut peer, kind, &fragments[1]);
        send_raw(&mut peer, kind, &fragments[1]);
        conduit.receive().unwrap();
        assert!(received_raw(&mut peer, kind).is_empty());

        for fragment in &fragments[2..] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert_eq!(received_raw(&mut peer, kind), vec![Fragment::ack(77, 5)]);

        // the bundle is retained after completion, and a duplicate is acknowledged again
        send_raw(&mut peer, kind, &fragments[3]);
        conduit.receive().unwrap();
        assert_eq!(received_raw(&mut peer, kind), vec![Fragment::ack(77, 5)]);

        assert_eq!(conduit.bundles_received(), 1);
        assert!(conduit.read().unwrap().is_some());
        assert_eq!(conduit.read().unwrap(), None);
    }

    #[test]
    fn test_ack_for_the_ack_retires_inbound_bundle() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        let fragments = kind.create().decompose(&test_buf(10), 3, 77, 5).unwrap();

        for fragment in &fragments {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert_eq!(received_raw(&mut peer, kind), vec![Fragment::ack(77, 5)]);

        send_raw(&mut peer, kind, &Fragment::ack(77, 5));
        conduit.receive().unwrap();

        // the bundle is forgotten, so a late duplicate starts a new bundle instead of triggering an ack
        send_raw(&mut peer, kind, &fragments[2]);
        conduit.receive().unwrap();
        assert!(received_raw(&mut peer, kind).is_empty());
        assert_eq!(conduit.bundles_received(), 1);
    }

    #[test]
    fn test_ack_for_unknown_bundle_is_ignored() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);

        send_raw(&mut peer, kind, &Fragment::ack(3, 4));
        send_raw(&mut peer, kind, &Fragment::nak(3, 4));
        conduit.receive().unwrap();

        assert!(conduit.is_connected());
        assert!(received_raw(&mut peer, kind).is_empty());
        assert_eq!(conduit.packets_received(), 2);
    }

    #[test]
    fn test_malformed_bytes_are_skipped() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        let data = test_buf(10);

        peer.write_fragment(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        for fragment in kind.create().decompose(&data, 4, 77, 5).unwrap() {
            send_raw(&mut peer, kind, &fragment);
        }
        conduit.receive().unwrap();

        assert_eq!(conduit.read().unwrap().unwrap().as_ref(), data.as_slice());
        assert!(!conduit.has_raw_input());
    }

    #[test]
    fn test_partial_fragment_is_buffered() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);

        let mut buf = BytesMut::new();
        for fragment in kind.create().decompose(&test_buf(10), 20, 77, 5).unwrap() {
            kind.create().ser(&fragment, &mut buf);
        }

        peer.write_fragment(&buf[..30]).unwrap();
        conduit.receive().unwrap();
        assert!(conduit.has_raw_input());
        assert!(!conduit.has_input());

        peer.write_fragment(&buf[30..]).unwrap();
        conduit.receive().unwrap();
        assert!(!conduit.has_raw_input());
        assert!(conduit.has_input());
    }

    #[test]
    fn test_checksum_failure_sends_nak() {
        let kind = CodecKind::Checksummed;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        let fragments = kind.create().decompose(&test_buf(10), 4, 77, 5).unwrap();

        send_raw(&mut peer, kind, &fragments[0]);
        send_raw(&mut peer, kind, &fragments[1]);
        send_raw(&mut peer, kind, &fragments[2].with_payload_unchecked(Bytes::from_static(&[9, 9, 9, 9])));
        send_raw(&mut peer, kind, &fragments[3]);
        conduit.receive().unwrap();

        assert!(!conduit.has_input());
        assert!(conduit.is_connected());
        let sent = received_raw(&mut peer, kind);
        assert_eq!(sent.len(), 1);
        assert!(is_nak(&sent[0]));
        assert_eq!(sent[0].bundle_key(), (77, 5));
    }

    #[test]
    fn test_fragment_beyond_declared_count_sends_nak() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);

        send_raw(&mut peer, kind, &Fragment::header(77, 5, 1, 0));
        send_raw(&mut peer, kind, &Fragment::data(77, 5, 2, Bytes::from_static(b"abc"), 0).unwrap());
        conduit.receive().unwrap();

        let sent = received_raw(&mut peer, kind);
        assert_eq!(sent.len(), 1);
        assert!(is_nak(&sent[0]));
        assert!(!is_ack(&sent[0]));
    }

    #[test]
    fn test_end_of_stream_closes_conduit() {
        let (registry, a, b) = open_pair(test_config());
        assert_eq!(registry.len(), 2);

        a.write(b"last words", true).unwrap();
        b.receive().unwrap();
        a.close();
        assert!(!a.is_connected());
        assert_eq!(registry.len(), 1);
        assert!(matches!(a.write(b"more", true), Err(ConduitError::NotConnected)));
        assert!(matches!(a.receive(), Err(ConduitError::NotConnected)));

        assert!(matches!(b.receive(), Err(ConduitError::EndOfStream)));
        assert!(!b.is_connected());
        assert!(registry.is_empty());

        // bundles received before closing can still be read
        assert_eq!(b.read_string().unwrap(), Some("last words".to_string()));
        assert!(matches!(b.read(), Err(ConduitError::NotConnected)));
        assert!(!b.wait_for_input(Duration::from_secs(10)));
    }

    #[test]
    fn test_read_into() {
        let (_registry, a, b) = open_pair(test_config());
        let data = test_buf(20);
        a.write(&data, true).unwrap();
        b.receive().unwrap();

        let mut small = [0u8; 10];
        assert!(matches!(b.read_into(&mut small), Err(ConduitError::BufferTooSmall { needed: 20, available: 10 })));
        assert!(b.has_input());

        let mut buf = [0u8; 32];
        assert_eq!(b.read_into(&mut buf).unwrap(), Some(20));
        assert_eq!(&buf[..20], data.as_slice());
        assert_eq!(b.read_into(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_read_string_invalid_utf8_stays_queued() {
        let (_registry, a, b) = open_pair(test_config());
        a.write(&[0xff, 0xfe], true).unwrap();
        b.receive().unwrap();

        assert!(matches!(b.read_string(), Err(ConduitError::InvalidUtf8(_))));
        assert_eq!(b.read().unwrap().unwrap().as_ref(), &[0xff, 0xfe]);
    }

    #[test]
    fn test_wait_for_input() {
        let (_registry, a, b) = open_pair(test_config());
        assert!(!b.wait_for_input(Duration::from_millis(1)));

        let receiver = {
            let b = b.clone();
            std::thread::spawn(move || b.wait_for_input(Duration::from_secs(10)))
        };

        a.write(b"hello", true).unwrap();
        b.receive().unwrap();
        assert!(receiver.join().unwrap());
    }

    #[test]
    fn test_reconfiguration() {
        let (_registry, a, b) = open_pair(test_config());
        assert_eq!(a.codec_kind(), CodecKind::Plain);

        a.set_codec(CodecKind::Checksummed.create());
        b.set_codec(CodecKind::Checksummed.create());
        assert_eq!(a.codec_kind(), CodecKind::Checksummed);

        assert!(a.set_fragment_size(0).is_err());
        assert!(a.set_fragment_size(100_000).is_err());
        a.set_fragment_size(7).unwrap();
        assert_eq!(a.fragment_size(), 7);

        let generation = a.generation();
        assert_eq!(a.advance_generation(), generation + 1);

        let data = test_buf(100);
        a.write(&data, true).unwrap();
        b.receive().unwrap();
        assert_eq!(b.read().unwrap().unwrap().as_ref(), data.as_slice());
        assert_eq!(a.packets_sent(), 1 + 15);
    }

    #[test]
    fn test_empty_write_is_rejected() {
        let (_registry, a, _b) = open_pair(test_config());
        assert!(matches!(a.write(&[], true), Err(ConduitError::Codec(CodecError::EmptyBuffer))));
        assert!(a.is_connected());
        assert_eq!(a.bundles_sent(), 0);
    }

    #[test]
    fn test_generation_from_timestamp() {
        let a = Conduit::generation_from_timestamp().unwrap();
        let b = Conduit::generation_from_timestamp().unwrap();
        assert!(a >> 16 <= b >> 16);
        assert!(a >> 16 > 1_600_000_000_000);
    }

    #[test]
    fn test_receive_claim() {
        let (_registry, a, _b) = open_pair(test_config());

        let claim = a.try_claim_receive().unwrap();
        assert!(a.is_receive_in_progress());
        assert!(a.try_claim_receive().is_none());
        claim.receive().unwrap();

        drop(claim);
        assert!(!a.is_receive_in_progress());
        assert!(a.try_claim_receive().is_some());
    }

    #[test]
    fn test_write_error_closes_conduit() {
        let mut channel = MockByteChannel::new();
        channel.expect_description()
            .return_const("mock".to_string());
        channel.expect_write_fragment()
            .times(1)
            .returning(|_| Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        channel.expect_close()
            .times(1)
            .returning(|| Ok(()));

        let registry = ConduitRegistry::new();
        let conduit = Conduit::new(&registry, channel, test_config()).unwrap();

        assert!(matches!(conduit.write(b"abc", true), Err(ConduitError::Io(_))));
        assert!(!conduit.is_connected());
        assert!(registry.is_empty());
        conduit.close();
    }

    #[test]
    fn test_read_error_closes_conduit() {
        let mut channel = MockByteChannel::new();
        channel.expect_description()
            .return_const("mock".to_string());
        channel.expect_read_available()
            .times(1)
            .returning(|_| Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        channel.expect_close()
            .times(1)
            .returning(|| Ok(()));

        let registry = ConduitRegistry::new();
        let conduit = Conduit::new(&registry, channel, test_config()).unwrap();

        assert!(matches!(conduit.receive(), Err(ConduitError::Io(_))));
        assert!(!conduit.is_connected());
    }

    #[test]
    fn test_raw_buffer_limit() {
        let mut channel = MockByteChannel::new();
        channel.expect_description()
            .return_const("mock".to_string());
        // garbage without a magic marker, so only the last 3 bytes of each batch are kept
        channel.expect_read_available()
            .returning(|buf| {
                buf.fill(0);
                Ok(ChannelRead::Data(buf.len()))
            });

        let registry = ConduitRegistry::new();
        let config = ConduitConfig {
            read_chunk_size: 8192,
            max_buffered_raw_bytes: 8192*4,
            ..ConduitConfig::default()
        };
        let conduit = Conduit::new(&registry, channel, Arc::new(config)).unwrap();

        // terminates although the channel never runs dry
        conduit.receive().unwrap();
        assert_eq!(conduit.bytes_received(), 8192*4);
        assert!(conduit.has_raw_input());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (_registry, a, _b) = open_pair(test_config());
        a.write(b"hello", true).unwrap();

        // the peer never answers
        tokio::time::advance(Duration::from_millis(500)).await;
        for _ in 0..10 {
            a.receive().unwrap();
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..3 {
            a.receive().unwrap();
        }
        assert!(matches!(a.receive(), Err(ConduitError::Timeout { .. })));
        assert!(!a.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_without_outstanding_bundles() {
        let (_registry, a, _b) = open_pair(test_config());

        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..10 {
            a.receive().unwrap();
        }
        assert!(a.is_connected());
    }

    /// header and first data fragment of a three fragment bundle, followed by polls a second
    ///  later that each count as a timeout
    async fn open_with_stalled_bundle(kind: CodecKind) -> (Arc<ConduitRegistry>, Arc<Conduit>, MemoryChannel, Vec<Fragment>) {
        let (registry, conduit, mut peer) = open_with_raw_peer(kind);
        let fragments = kind.create().decompose(&test_buf(10), 3, 77, 5).unwrap();

        send_raw(&mut peer, kind, &fragments[0]);
        send_raw(&mut peer, kind, &fragments[1]);
        conduit.receive().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..4 {
            conduit.receive().unwrap();
        }
        (registry, conduit, peer, fragments)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_incomplete_bundle_is_discarded_before_timeout() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer, fragments) = open_with_stalled_bundle(kind).await;

        // past the minimum timeout with a single poll
        tokio::time::advance(Duration::from_millis(9_100)).await;
        conduit.receive().unwrap();
        assert!(conduit.is_connected());

        tokio::time::advance(Duration::from_secs(60)).await;
        conduit.receive().unwrap();
        assert!(conduit.is_connected());

        // late fragments start from scratch
        for fragment in &fragments[2..] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert!(!conduit.has_input());
        assert!(conduit.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_bundle_is_discarded_after_half_the_minimum_timeout() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer, fragments) = open_with_stalled_bundle(kind).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        conduit.receive().unwrap();
        assert!(conduit.is_connected());

        for fragment in &fragments[2..] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert!(!conduit.has_input());
        assert!(received_raw(&mut peer, kind).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_bundle_completes_before_half_the_minimum_timeout() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer, fragments) = open_with_stalled_bundle(kind).await;

        tokio::time::advance(Duration::from_secs(3)).await;
        conduit.receive().unwrap();

        for fragment in &fragments[2..] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert_eq!(conduit.read().unwrap().unwrap().as_ref(), test_buf(10).as_slice());

        let sent = received_raw(&mut peer, kind);
        assert_eq!(sent.len(), 1);
        assert!(is_ack(&sent[0]));
    }

    #[rstest]
    #[case::ack_without_generation(vec![Fragment::ack(0, 5)])]
    #[case::ack_without_message_id(vec![Fragment::ack(3, 0)])]
    #[case::nak_without_generation(vec![Fragment::nak(0, 5)])]
    #[case::nak_without_message_id(vec![Fragment::nak(3, 0)])]
    #[case::invalid_bundle_without_generation(vec![
        Fragment::header(0, 5, 1, 0),
        Fragment::data(0, 5, 2, Bytes::from_static(b"abc"), 0).unwrap(),
    ])]
    fn test_no_nak_for_bundle_key_with_zero_component(#[case] fragments: Vec<Fragment>) {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);

        for fragment in &fragments {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();

        assert!(received_raw(&mut peer, kind).is_empty());
        assert!(conduit.is_connected());
        assert_eq!(conduit.packets_received(), fragments.len() as u128);
    }

    /// copies everything one conduit wrote to the other conduit, returning the number of bytes
    fn relay(from: &mut MemoryChannel, to: &mut MemoryChannel) -> usize {
        let mut buf = vec![0u8; 64*1024];
        let mut total = 0;
        while let ChannelRead::Data(n) = from.read_available(&mut buf).unwrap() {
            to.write_fragment(&buf[..n]).unwrap();
            total += n;
        }
        total
    }

    #[test]
    fn test_invalid_control_fragments_do_not_bounce_between_conduits() {
        let kind = CodecKind::Plain;
        let (_registry_a, a, mut peer_a) = open_with_raw_peer(kind);
        let (_registry_b, b, mut peer_b) = open_with_raw_peer(kind);

        send_raw(&mut peer_a, kind, &Fragment::ack(0, 5));
        send_raw(&mut peer_a, kind, &Fragment::nak(0, 5));
        send_raw(&mut peer_a, kind, &Fragment::header(0, 6, 1, 0));
        send_raw(&mut peer_a, kind, &Fragment::data(0, 6, 2, Bytes::from_static(b"abc"), 0).unwrap());

        for _ in 0..10 {
            a.receive().unwrap();
            b.receive().unwrap();
            assert_eq!(relay(&mut peer_a, &mut peer_b), 0);
            assert_eq!(relay(&mut peer_b, &mut peer_a), 0);
        }
        assert_eq!(a.packets_sent(), 0);
        assert_eq!(b.packets_sent(), 0);
        assert!(a.is_connected());
        assert!(b.is_connected());

        // regular bundles still pass the relay
        a.write(b"hello", true).unwrap();
        for _ in 0..3 {
            relay(&mut peer_a, &mut peer_b);
            b.receive().unwrap();
            relay(&mut peer_b, &mut peer_a);
            a.receive().unwrap();
        }
        assert_eq!(b.read_string().unwrap(), Some("hello".to_string()));
        assert_eq!(a.num_unacknowledged(), 0);
    }

    fn assert_lag(conduit: &Conduit, expected: Duration) {
        let actual = conduit.lag_estimate();
        let diff = if actual > expected { actual - expected } else { expected - actual };
        assert!(diff < Duration::from_micros(1), "lag estimate {:?}, expected {:?}", actual, expected);
    }

    /// one fragment every 10ms until the initial lag is evicted from the rolling window
    async fn settle_lag(conduit: &Conduit, peer: &mut MemoryChannel, kind: CodecKind) {
        send_raw(peer, kind, &Fragment::ack(3, 1));
        conduit.receive().unwrap();
        for message_id in 2..=6 {
            tokio::time::advance(Duration::from_millis(10)).await;
            send_raw(peer, kind, &Fragment::ack(3, message_id));
            conduit.receive().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_estimate_follows_arrival_gaps() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        assert_lag(&conduit, Duration::from_millis(50));

        send_raw(&mut peer, kind, &Fragment::ack(3, 1));
        conduit.receive().unwrap();
        assert_lag(&conduit, Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(10)).await;
        send_raw(&mut peer, kind, &Fragment::ack(3, 2));
        conduit.receive().unwrap();
        assert_lag(&conduit, Duration::from_millis(30));

        for message_id in 3..=6 {
            tokio::time::advance(Duration::from_millis(10)).await;
            send_raw(&mut peer, kind, &Fragment::ack(3, message_id));
            conduit.receive().unwrap();
        }
        assert_lag(&conduit, Duration::from_millis(10));

        // fragments arriving together have no gap between them
        for message_id in 7..=11 {
            send_raw(&mut peer, kind, &Fragment::ack(3, message_id));
        }
        conduit.receive().unwrap();
        assert_eq!(conduit.lag_estimate(), Duration::from_millis(1));
    }

    fn inbound_deadline(conduit: &Conduit) -> Option<Instant> {
        conduit.inner.lock().unwrap().inbound_deadline((77, 5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_deadline_scales_with_missing_fragments() {
        let kind = CodecKind::Plain;
        let (_registry, conduit, mut peer) = open_with_raw_peer(kind);
        settle_lag(&conduit, &mut peer, kind).await;

        let fragments = kind.create().decompose(&test_buf(30), 3, 77, 5).unwrap();
        assert_eq!(fragments.len(), 11);

        tokio::time::advance(Duration::from_millis(10)).await;
        send_raw(&mut peer, kind, &fragments[0]);
        conduit.receive().unwrap();
        assert_lag(&conduit, Duration::from_millis(10));
        assert_eq!(inbound_deadline(&conduit), Some(Instant::now() + conduit.lag_estimate() * 10));

        // two missing fragments, but never less than five times the lag
        tokio::time::advance(Duration::from_millis(10)).await;
        for fragment in &fragments[1..9] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert_eq!(inbound_deadline(&conduit), Some(Instant::now() + conduit.lag_estimate() * 5));

        for fragment in &fragments[9..] {
            send_raw(&mut peer, kind, fragment);
        }
        conduit.receive().unwrap();
        assert!(conduit.has_input());
    }
}
