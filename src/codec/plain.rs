use bytes::BytesMut;
use crate::codec::{CodecError, CodecKind, Fragment, FragmentCodec, BASE_HEADER_LEN};

/// Fragments without checksum - integrity is left to the underlying channel
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl FragmentCodec for PlainCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Plain
    }

    fn header_len(&self) -> usize {
        BASE_HEADER_LEN
    }

    fn fragment_checksum(&self, _payload: &[u8]) -> u64 {
        0
    }

    fn put_checksum(&self, _checksum: u64, _buf: &mut BytesMut) {
    }

    fn try_get_checksum(&self, _buf: &mut &[u8]) -> anyhow::Result<u64> {
        Ok(0)
    }

    fn verify(&self, _fragments: &[Fragment]) -> Result<(), CodecError> {
        Ok(())
    }
}
