use tokio::time::Instant;
use crate::codec::{Fragment, MAX_FRAGMENTS_PER_BUNDLE};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Insertion {
    Added,
    Duplicate,
    /// the fragment can not belong to a well-formed bundle, e.g. because its id exceeds the
    ///  number of data fragments declared by the header
    Invalid(String),
}

/// Reassembly state of a bundle received from the peer.
///
/// Fragments are stored in a slot array indexed by fragment id, which is grown as fragments
///  arrive: the header declaring the number of fragments is not necessarily the first to
///  arrive. The bundle is complete once the header and all data fragments it declares are
///  present.
///
/// A complete bundle is retained (without its fragments) until the peer acknowledges the ack
///  or its deadline passes, so that duplicates can be recognized and acked again.
#[derive(Debug)]
pub(super) struct InboundBundle {
    slots: Vec<Option<Fragment>>,
    num_present: usize,
    /// number of data fragments, known once the header arrived
    num_declared: Option<usize>,
    /// the time the most recent fragment of this bundle arrived
    pub last_arrival: Instant,
    /// expected completion of the bundle while it is incomplete, end of retention afterwards
    pub deadline: Instant,
    pub complete: bool,
    pub ack_sent: bool,
}

impl InboundBundle {
    pub fn new(now: Instant, deadline: Instant) -> InboundBundle {
        InboundBundle {
            slots: Vec::new(),
            num_present: 0,
            num_declared: None,
            last_arrival: now,
            deadline,
            complete: false,
            ack_sent: false,
        }
    }

    pub fn insert(&mut self, fragment: Fragment) -> Insertion {
        let idx: usize = match usize::try_from(fragment.fragment_id()) {
            Ok(idx) => idx,
            Err(_) => return Insertion::Invalid(format!("negative fragment id {}", fragment.fragment_id())),
        };

        if idx == 0 {
            if fragment.length() <= 0 {
                return Insertion::Invalid(format!("header declares {} fragments", fragment.length()));
            }
            let num_declared = <i16 as SafeCast<usize>>::safe_cast(fragment.length());
            if self.slots.len() > num_declared + 1 {
                return Insertion::Invalid(format!("header declares {} fragments, but fragment #{} was received", num_declared, self.slots.len() - 1));
            }
            if let Some(prev) = self.num_declared {
                if prev != num_declared {
                    return Insertion::Invalid(format!("duplicate header declares {} fragments instead of {}", num_declared, prev));
                }
            }
            self.num_declared = Some(num_declared);
        }
        else {
            let limit = self.num_declared.unwrap_or(MAX_FRAGMENTS_PER_BUNDLE);
            if idx > limit {
                return Insertion::Invalid(format!("fragment #{} exceeds the bundle's {} fragments", idx, limit));
            }
        }

        if self.slots.len() <= idx {
            self.slots.resize(idx + 1, None);
        }
        if self.slots[idx].is_some() {
            return Insertion::Duplicate;
        }
        self.slots[idx] = Some(fragment);
        self.num_present += 1;
        Insertion::Added
    }

    /// The number of fragments that are still missing, if the header was received already
    pub fn num_missing(&self) -> Option<usize> {
        self.num_declared
            .map(|n| n + 1 - self.num_present)
    }

    pub fn is_collected(&self) -> bool {
        self.num_missing() == Some(0)
    }

    /// Take the collected fragments for recombination, leaving the bundle empty
    pub fn take_fragments(&mut self) -> Vec<Fragment> {
        self.num_present = 0;
        std::mem::take(&mut self.slots)
            .into_iter()
            .flatten()
            .collect()
    }
}
