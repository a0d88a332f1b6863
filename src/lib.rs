//! Reliable delivery of application buffers ('bundles') over non-blocking byte channels.
//!
//! A [conduit::Conduit] owns a connected [channel::ByteChannel] and splits each buffer it
//!  writes into fragments, using a [codec::FragmentCodec]. The peer conduit reassembles the
//!  fragments, acknowledges the bundle and queues it for reading.
//!
//! Fragment wire format (all numbers in network byte order):
//!
//! ```ascii
//! 0:  magic number "CNDT" (u32)
//! 4:  generation of the sending conduit (u64)
//! 12: bundle id (u64)
//! 20: fragment id (i32) - 0 for the header and for acks / naks
//! 24: length (i16) - number of data fragments for the header, payload length for data
//!      fragments, 0 for an ack, negative for a nak
//! 26: checksum (u64) - only for the checksummed codec
//! *:  payload - only for data fragments
//! ```
//!
//! Receiving is driven by a [monitor::ConduitMonitor], which runs receive operations for all
//!  conduits of a [monitor::ConduitRegistry] in a bounded [pool::TaskExecutionPool].

pub mod channel;
pub mod codec;
pub mod conduit;
pub mod config;
pub mod monitor;
pub mod pool;
pub mod util;
