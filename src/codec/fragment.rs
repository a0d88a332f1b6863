use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment id must not be negative, was {0}")]
    NegativeId(i32),
    #[error("fragment id 0 (header or control fragment) must not carry a payload")]
    UnexpectedPayload,
    #[error("data fragment #{0} has no payload")]
    MissingPayload(i32),
    #[error("data fragment #{fragment_id} declares length {length} but carries {actual} bytes")]
    LengthMismatch { fragment_id: i32, length: i16, actual: usize },
    #[error("payload of {0} bytes does not fit into a single fragment")]
    PayloadTooLong(usize),
}

/// One wire-level chunk of a bundle.
///
/// Fragment id 0 is used both for a bundle's *header* (length is the number of data fragments)
///  and for *control* fragments (ack: length 0, nak: negative length). Neither carries a payload.
///  Telling the two apart is left to the conduit, see [crate::conduit].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    generation: u64,
    message_id: u64,
    fragment_id: i32,
    length: i16,
    /// always 0 for codecs without checksum
    checksum: u64,
    payload: Option<Bytes>,
}

impl Fragment {
    pub const ACK_LENGTH: i16 = 0;
    pub const NAK_LENGTH: i16 = -1;

    pub fn new(generation: u64, message_id: u64, fragment_id: i32, length: i16, checksum: u64, payload: Option<Bytes>) -> Result<Fragment, FragmentError> {
        if fragment_id < 0 {
            return Err(FragmentError::NegativeId(fragment_id));
        }

        if fragment_id == 0 {
            if payload.is_some() {
                return Err(FragmentError::UnexpectedPayload);
            }
        }
        else {
            match &payload {
                None => return Err(FragmentError::MissingPayload(fragment_id)),
                Some(p) => {
                    if length < 0 || p.len() != length as usize {
                        return Err(FragmentError::LengthMismatch { fragment_id, length, actual: p.len() });
                    }
                }
            }
        }

        Ok(Fragment {
            generation,
            message_id,
            fragment_id,
            length,
            checksum,
            payload,
        })
    }

    pub fn header(generation: u64, message_id: u64, num_data_fragments: i16, checksum: u64) -> Fragment {
        Fragment {
            generation,
            message_id,
            fragment_id: 0,
            length: num_data_fragments,
            checksum,
            payload: None,
        }
    }

    pub fn data(generation: u64, message_id: u64, fragment_id: i32, payload: Bytes, checksum: u64) -> Result<Fragment, FragmentError> {
        let length = i16::try_from(payload.len())
            .map_err(|_| FragmentError::PayloadTooLong(payload.len()))?;
        Self::new(generation, message_id, fragment_id, length, checksum, Some(payload))
    }

    pub fn ack(generation: u64, message_id: u64) -> Fragment {
        Self::header(generation, message_id, Self::ACK_LENGTH, 0)
    }

    pub fn nak(generation: u64, message_id: u64) -> Fragment {
        Self::header(generation, message_id, Self::NAK_LENGTH, 0)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn fragment_id(&self) -> i32 {
        self.fragment_id
    }

    pub fn length(&self) -> i16 {
        self.length
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// identity and order of fragments for sorting and reassembly
    pub fn sort_key(&self) -> (u64, i32) {
        (self.message_id, self.fragment_id)
    }

    /// the bundle this fragment belongs to
    pub fn bundle_key(&self) -> (u64, u64) {
        (self.generation, self.message_id)
    }

    #[cfg(test)]
    pub(crate) fn with_payload_unchecked(&self, payload: Bytes) -> Fragment {
        Fragment {
            payload: Some(payload),
            ..self.clone()
        }
    }
}
