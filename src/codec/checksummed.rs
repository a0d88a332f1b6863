use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;
use crate::codec::{add_checksums, payload_checksum, CodecError, CodecKind, Fragment, FragmentCodec, BASE_HEADER_LEN};

/// Fragments carry the sum of their payload bytes (modulo 2^63) in a `u64` field right after
///  the length. The header fragment's checksum is the aggregate over all data fragments (see
///  [FragmentCodec::decompose]), and recombination validates both.
///
/// NB: This detects corruption on the way, it is no protection against intentional manipulation
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumCodec;

impl ChecksumCodec {
    pub const CHECKSUM_LEN: usize = size_of::<u64>();
}

impl FragmentCodec for ChecksumCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Checksummed
    }

    fn header_len(&self) -> usize {
        BASE_HEADER_LEN + Self::CHECKSUM_LEN
    }

    fn fragment_checksum(&self, payload: &[u8]) -> u64 {
        payload_checksum(payload)
    }

    fn put_checksum(&self, checksum: u64, buf: &mut BytesMut) {
        buf.put_u64(checksum);
    }

    fn try_get_checksum(&self, buf: &mut &[u8]) -> anyhow::Result<u64> {
        Ok(buf.try_get_u64()?)
    }

    fn verify(&self, fragments: &[Fragment]) -> Result<(), CodecError> {
        let (header, data_fragments) = fragments.split_first()
            .ok_or(CodecError::MissingHeader)?;

        let mut running_checksum = 0;
        for fragment in data_fragments {
            let actual = fragment.payload()
                .map(|p| payload_checksum(p))
                .unwrap_or(0);
            if actual != fragment.checksum() {
                return Err(CodecError::ChecksumMismatch { fragment_id: fragment.fragment_id(), expected: fragment.checksum(), actual });
            }
            running_checksum = add_checksums(running_checksum, actual);
        }

        if running_checksum != header.checksum() {
            return Err(CodecError::ChecksumMismatch { fragment_id: 0, expected: header.checksum(), actual: running_checksum });
        }

        trace!("verified checksum {} for message {}", running_checksum, header.message_id());
        Ok(())
    }
}
