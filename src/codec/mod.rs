//! Splitting outgoing buffers into fragments, reassembling fragments into bundles, and the wire
//!  form of a single fragment.
//!
//! Two variants exist, [PlainCodec] and [ChecksumCodec]. They share fragmentation logic and wire
//!  layout and differ only in the per-fragment checksum, which is why [FragmentCodec] has
//!  provided methods for everything but the checksum hooks. [CodecKind] is the factory and the
//!  tag that the connection layer exchanges with the peer.

pub mod fragment;
mod plain;
mod checksummed;

use std::fmt::Debug;
use std::sync::Arc;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub use checksummed::ChecksumCodec;
pub use fragment::{Fragment, FragmentError};
pub use plain::PlainCodec;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// 'CNDT' - marks the start of every fragment on the wire
pub const MAGIC: u32 = 0x434E_4454;

/// magic, generation, message id, fragment id, length
pub const BASE_HEADER_LEN: usize = size_of::<u32>() + 2*size_of::<u64>() + size_of::<i32>() + size_of::<i16>();

pub const MAX_FRAGMENT_SIZE: usize = i16::MAX as usize;
pub const MAX_FRAGMENTS_PER_BUNDLE: usize = i16::MAX as usize;

/// checksums are sums of payload bytes, reduced modulo 2^63
pub const CHECKSUM_MASK: u64 = (1 << 63) - 1;

pub fn add_checksums(a: u64, b: u64) -> u64 {
    // both operands are < 2^63, so this can not overflow
    ((a & CHECKSUM_MASK) + (b & CHECKSUM_MASK)) & CHECKSUM_MASK
}

pub fn payload_checksum(payload: &[u8]) -> u64 {
    payload.iter()
        .fold(0, |acc, &b| add_checksums(acc, b as u64))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot fragment an empty buffer")]
    EmptyBuffer,
    #[error("fragment size must be between 1 and {max}, was {0}", max = MAX_FRAGMENT_SIZE)]
    InvalidFragmentSize(usize),
    #[error("a buffer of {buffer_len} bytes needs more than {max} fragments of {fragment_size} bytes", max = MAX_FRAGMENTS_PER_BUNDLE)]
    TooManyFragments { buffer_len: usize, fragment_size: usize },
    #[error("fragment set has no header fragment")]
    MissingHeader,
    #[error("header declares {declared} data fragments, but {actual} are present")]
    InconsistentCount { declared: i16, actual: usize },
    #[error("fragment for message {actual} in a bundle for message {expected}")]
    MismatchedMessageId { expected: u64, actual: u64 },
    #[error("expected fragment #{expected}, found #{actual}")]
    NonSequential { expected: usize, actual: i32 },
    #[error("checksum mismatch in fragment #{fragment_id}: carried {expected}, calculated {actual}")]
    ChecksumMismatch { fragment_id: i32, expected: u64, actual: u64 },
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

impl CodecError {
    /// Protocol violations are detected while recombining received fragments, and they
    ///  invalidate the bundle. All other errors are caused by invalid arguments.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self,
            CodecError::MissingHeader
            | CodecError::InconsistentCount { .. }
            | CodecError::MismatchedMessageId { .. }
            | CodecError::NonSequential { .. }
            | CodecError::ChecksumMismatch { .. }
        )
    }
}

/// The result of trying to parse a fragment from the start of a raw receive buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Extraction {
    Fragment {
        fragment: Fragment,
        consumed: usize,
    },
    /// the buffer holds the start of a fragment, but not all of it yet
    Incomplete,
    /// The buffer does not start with a valid fragment. Discarding `skip` bytes resynchronizes
    ///  with the byte stream.
    Malformed {
        skip: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CodecKind {
    Plain = 0,
    Checksummed = 1,
}

impl CodecKind {
    pub fn create(self) -> Arc<dyn FragmentCodec> {
        match self {
            CodecKind::Plain => Arc::new(PlainCodec),
            CodecKind::Checksummed => Arc::new(ChecksumCodec),
        }
    }
}

struct WireHeader {
    generation: u64,
    message_id: u64,
    fragment_id: i32,
    length: i16,
    checksum: u64,
}

pub trait FragmentCodec: Debug + Send + Sync + 'static {
    fn kind(&self) -> CodecKind;

    /// length of a serialized fragment without its payload
    fn header_len(&self) -> usize;

    /// the checksum this variant attaches to a fragment with the given payload
    fn fragment_checksum(&self, payload: &[u8]) -> u64;

    fn put_checksum(&self, checksum: u64, buf: &mut BytesMut);

    fn try_get_checksum(&self, buf: &mut &[u8]) -> anyhow::Result<u64>;

    /// Variant-specific validation of a complete, sorted and otherwise consistent fragment set
    ///  (header first)
    fn verify(&self, fragments: &[Fragment]) -> Result<(), CodecError>;

    fn decompose(&self, buf: &[u8], fragment_size: usize, generation: u64, message_id: u64) -> Result<Vec<Fragment>, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::EmptyBuffer);
        }
        if fragment_size == 0 || fragment_size > MAX_FRAGMENT_SIZE {
            return Err(CodecError::InvalidFragmentSize(fragment_size));
        }

        let num_data_fragments = buf.len().div_ceil(fragment_size);
        if num_data_fragments > MAX_FRAGMENTS_PER_BUNDLE {
            return Err(CodecError::TooManyFragments { buffer_len: buf.len(), fragment_size });
        }

        let buf = Bytes::copy_from_slice(buf);
        let mut fragments = Vec::with_capacity(num_data_fragments + 1);
        fragments.push(Fragment::header(generation, message_id, num_data_fragments.prechecked_cast(), 0));

        let mut aggregate_checksum = 0;
        for (idx, offs) in (0..buf.len()).step_by(fragment_size).enumerate() {
            let payload = buf.slice(offs..buf.len().min(offs + fragment_size));
            let checksum = self.fragment_checksum(&payload);
            aggregate_checksum = add_checksums(aggregate_checksum, checksum);
            fragments.push(Fragment::data(generation, message_id, (idx+1).prechecked_cast(), payload, checksum)?);
        }

        fragments[0] = Fragment::header(generation, message_id, num_data_fragments.prechecked_cast(), aggregate_checksum);
        Ok(fragments)
    }

    fn recombine(&self, mut fragments: Vec<Fragment>) -> Result<Bytes, CodecError> {
        fragments.sort_by_key(Fragment::sort_key);

        let header = fragments.first()
            .ok_or(CodecError::MissingHeader)?;
        if header.fragment_id() != 0 || header.payload().is_some() || header.length() <= 0 {
            return Err(CodecError::MissingHeader);
        }
        if <i16 as SafeCast<usize>>::safe_cast(header.length()) != fragments.len() - 1 {
            return Err(CodecError::InconsistentCount { declared: header.length(), actual: fragments.len() - 1 });
        }

        let message_id = header.message_id();
        let mut result = BytesMut::with_capacity(fragments.iter().map(|f| <i16 as SafeCast<usize>>::safe_cast(f.length())).sum());
        for (expected_id, fragment) in fragments.iter().enumerate() {
            if fragment.message_id() != message_id {
                return Err(CodecError::MismatchedMessageId { expected: message_id, actual: fragment.message_id() });
            }
            if fragment.fragment_id() != <usize as PrecheckedCast<i32>>::prechecked_cast(expected_id) {
                return Err(CodecError::NonSequential { expected: expected_id, actual: fragment.fragment_id() });
            }
            if let Some(payload) = fragment.payload() {
                result.put_slice(payload);
            }
        }

        self.verify(&fragments)?;
        Ok(result.freeze())
    }

    fn wire_len(&self, fragment: &Fragment) -> usize {
        self.header_len() + fragment.payload().map(|p| p.len()).unwrap_or(0)
    }

    fn ser(&self, fragment: &Fragment, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u64(fragment.generation());
        buf.put_u64(fragment.message_id());
        buf.put_i32(fragment.fragment_id());
        buf.put_i16(fragment.length());
        self.put_checksum(fragment.checksum(), buf);
        if let Some(payload) = fragment.payload() {
            buf.put_slice(payload);
        }
    }

    /// Parse the fragment at the start of `raw`. The payload length on the wire is the declared
    ///  length for data fragments and 0 for all fragments with id 0.
    fn extract(&self, raw: &[u8]) -> Extraction {
        if raw.len() < size_of::<u32>() {
            return Extraction::Incomplete;
        }
        if raw[..size_of::<u32>()] != MAGIC.to_be_bytes() {
            return Extraction::Malformed {
                skip: resync_offset(raw),
                reason: format!("expected magic {:08x}, found {:02x?}", MAGIC, &raw[..size_of::<u32>()]),
            };
        }

        let header_len = self.header_len();
        if raw.len() < header_len {
            return Extraction::Incomplete;
        }

        let mut parse_buf = &raw[size_of::<u32>()..];
        let header = match deser_header(self, &mut parse_buf) {
            Ok(header) => header,
            Err(e) => return Extraction::Malformed { skip: header_len, reason: e.to_string() },
        };

        let payload_len = match header.fragment_id {
            id if id < 0 => return Extraction::Malformed { skip: header_len, reason: format!("negative fragment id {}", id) },
            0 => 0,
            _ if header.length < 0 => return Extraction::Malformed { skip: header_len, reason: format!("negative length {} for data fragment", header.length) },
            _ => header.length.safe_cast(),
        };

        let total_len = header_len + payload_len;
        if raw.len() < total_len {
            return Extraction::Incomplete;
        }

        let payload = if header.fragment_id == 0 {
            None
        }
        else {
            Some(Bytes::copy_from_slice(&raw[header_len..total_len]))
        };

        match Fragment::new(header.generation, header.message_id, header.fragment_id, header.length, header.checksum, payload) {
            Ok(fragment) => Extraction::Fragment { fragment, consumed: total_len },
            Err(e) => Extraction::Malformed { skip: total_len, reason: e.to_string() },
        }
    }
}

fn deser_header<C: FragmentCodec + ?Sized>(codec: &C, buf: &mut &[u8]) -> anyhow::Result<WireHeader> {
    let generation = buf.try_get_u64()?;
    let message_id = buf.try_get_u64()?;
    let fragment_id = buf.try_get_i32()?;
    let length = buf.try_get_i16()?;
    let checksum = codec.try_get_checksum(buf)?;
    Ok(WireHeader {
        generation,
        message_id,
        fragment_id,
        length,
        checksum,
    })
}

/// number of bytes to discard so that the buffer starts with the next candidate for a magic
///  marker (or keeps only a tail that might be the start of one)
fn resync_offset(raw: &[u8]) -> usize {
    let magic = MAGIC.to_be_bytes();
    match raw.windows(magic.len()).skip(1).position(|w| w == magic) {
        Some(pos) => pos + 1,
        None => raw.len().saturating_sub(magic.len() - 1).max(1),
    }
}
