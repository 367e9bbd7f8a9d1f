//! Collects the fragments of multi-packet messages until they are complete.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::debug;

use crate::packet::{ExitInfo, Fragment, MessageId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment {index} of message {message_id} was already received")]
    DuplicateFragment { message_id: MessageId, index: u32 },
    #[error("fragment of message {message_id} is inconsistent: {reason}")]
    Inconsistent {
        message_id: MessageId,
        reason: &'static str,
    },
    #[error("message {message_id} declares {count} fragments, more than allowed")]
    TooLarge { message_id: MessageId, count: u32 },
    #[error("too many messages are being reassembled")]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Buffers older than this are discarded.
    pub timeout: Duration,
    pub max_fragments: u32,
    pub max_messages: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 24 * 3600),
            max_fragments: 128,
            max_messages: 1024,
        }
    }
}

/// A message whose every fragment has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage<T> {
    pub message_id: MessageId,
    pub exit: ExitInfo,
    pub data: Vec<u8>,
    /// Tags of the fragments that made it up, in index order.
    pub tags: Vec<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome<T> {
    Pending { received: u32, count: u32 },
    Complete(CompleteMessage<T>),
}

struct Buffer<T> {
    count: u32,
    exit: ExitInfo,
    created_at: SystemTime,
    pieces: BTreeMap<u32, (Vec<u8>, T)>,
}

/// In-memory reassembly keyed by message id. Each fragment carries a tag of
/// type `T` (the node uses the pool entry holding the fragment) that is
/// handed back when its message completes or expires.
pub struct FragmentReassembler<T = ()> {
    limits: ReassemblyLimits,
    buffers: HashMap<MessageId, Buffer<T>>,
    discarded: Vec<T>,
}

impl<T> FragmentReassembler<T> {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            buffers: HashMap::new(),
            discarded: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.buffers.contains_key(message_id)
    }

    fn is_expired(&self, buffer: &Buffer<T>, now: SystemTime) -> bool {
        now.duration_since(buffer.created_at)
            .map(|age| age >= self.limits.timeout)
            .unwrap_or(false)
    }

    pub fn add(
        &mut self,
        fragment: Fragment,
        exit: ExitInfo,
        tag: T,
        now: SystemTime,
    ) -> Result<AddOutcome<T>, ReassemblyError> {
        let message_id = fragment.message_id;
        if fragment.count == 0 || fragment.index >= fragment.count {
            return Err(ReassemblyError::Inconsistent {
                message_id,
                reason: "index out of range",
            });
        }
        if fragment.count > self.limits.max_fragments {
            return Err(ReassemblyError::TooLarge {
                message_id,
                count: fragment.count,
            });
        }

        if fragment.count == 1 && !self.buffers.contains_key(&message_id) {
            return Ok(AddOutcome::Complete(CompleteMessage {
                message_id,
                exit,
                data: fragment.data,
                tags: vec![tag],
            }));
        }

        let expired = self
            .buffers
            .get(&message_id)
            .map(|buffer| self.is_expired(buffer, now))
            .unwrap_or(false);
        if expired {
            self.discard(&message_id);
        }

        if !self.buffers.contains_key(&message_id) {
            if self.buffers.len() >= self.limits.max_messages {
                return Err(ReassemblyError::Full);
            }
            self.buffers.insert(
                message_id,
                Buffer {
                    count: fragment.count,
                    exit: exit.clone(),
                    created_at: now,
                    pieces: BTreeMap::new(),
                },
            );
        }

        let Some(buffer) = self.buffers.get_mut(&message_id) else {
            return Err(ReassemblyError::Inconsistent {
                message_id,
                reason: "buffer vanished",
            });
        };
        if buffer.count != fragment.count {
            return Err(ReassemblyError::Inconsistent {
                message_id,
                reason: "fragment count differs from earlier fragments",
            });
        }
        if buffer.exit != exit {
            return Err(ReassemblyError::Inconsistent {
                message_id,
                reason: "exit differs from earlier fragments",
            });
        }
        if buffer.pieces.contains_key(&fragment.index) {
            return Err(ReassemblyError::DuplicateFragment {
                message_id,
                index: fragment.index,
            });
        }
        buffer.pieces.insert(fragment.index, (fragment.data, tag));

        let received = buffer.pieces.len() as u32;
        if received < buffer.count {
            return Ok(AddOutcome::Pending {
                received,
                count: buffer.count,
            });
        }

        let Some(buffer) = self.buffers.remove(&message_id) else {
            return Err(ReassemblyError::Inconsistent {
                message_id,
                reason: "buffer vanished",
            });
        };
        let mut data = Vec::new();
        let mut tags = Vec::with_capacity(buffer.pieces.len());
        for (_, (piece, tag)) in buffer.pieces {
            data.extend_from_slice(&piece);
            tags.push(tag);
        }
        debug!(message = %message_id, fragments = tags.len(), "message reassembled");
        Ok(AddOutcome::Complete(CompleteMessage {
            message_id,
            exit: buffer.exit,
            data,
            tags,
        }))
    }

    fn discard(&mut self, message_id: &MessageId) {
        if let Some(buffer) = self.buffers.remove(message_id) {
            debug!(message = %message_id, fragments = buffer.pieces.len(), "reassembly buffer expired");
            self.discarded
                .extend(buffer.pieces.into_values().map(|(_, tag)| tag));
        }
    }

    /// Drops stale buffers. Returns the tags of every fragment discarded since
    /// the last call.
    pub fn expire(&mut self, now: SystemTime) -> Vec<T> {
        let stale: Vec<MessageId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| self.is_expired(buffer, now))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.discard(&id);
        }
        std::mem::take(&mut self.discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn exit() -> ExitInfo {
        ExitInfo {
            exit_type: 0x100,
            address: "carol@example.org".to_string(),
        }
    }

    fn fragments(count: u32) -> Vec<Fragment> {
        (0..count)
            .map(|index| Fragment {
                message_id: MessageId([4u8; 20]),
                index,
                count,
                data: vec![index as u8; 3],
            })
            .collect()
    }

    fn expected(count: u32) -> Vec<u8> {
        (0..count).flat_map(|i| vec![i as u8; 3]).collect()
    }

    #[test]
    fn out_of_order_fragments_complete_once() {
        let now = SystemTime::now();
        let mut reassembler = FragmentReassembler::new(ReassemblyLimits::default());
        let pieces = fragments(3);
        let order = [2usize, 0, 1];

        let mut outcomes = Vec::new();
        for i in order {
            outcomes.push(reassembler.add(pieces[i].clone(), exit(), i, now).unwrap());
        }
        assert_eq!(outcomes[0], AddOutcome::Pending { received: 1, count: 3 });
        assert_eq!(outcomes[1], AddOutcome::Pending { received: 2, count: 3 });
        match outcomes.pop().unwrap() {
            AddOutcome::Complete(message) => {
                assert_eq!(message.data, expected(3));
                assert_eq!(message.tags, vec![0, 1, 2]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(reassembler.is_empty());
    }

    #[test]
    fn fragments_arriving_one_two_zero_complete_on_the_first() {
        let now = SystemTime::now();
        let mut reassembler = FragmentReassembler::new(ReassemblyLimits::default());
        let pieces = fragments(3);

        assert_eq!(
            reassembler.add(pieces[1].clone(), exit(), 'b', now).unwrap(),
            AddOutcome::Pending { received: 1, count: 3 }
        );
        assert_eq!(
            reassembler.add(pieces[2].clone(), exit(), 'c', now).unwrap(),
            AddOutcome::Pending { received: 2, count: 3 }
        );
        assert_eq!(reassembler.len(), 1);
        match reassembler.add(pieces[0].clone(), exit(), 'a', now).unwrap() {
            AddOutcome::Complete(message) => {
                assert_eq!(message.data, expected(3));
                assert_eq!(message.tags, vec!['a', 'b', 'c']);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(reassembler.is_empty());
    }

    #[test]
    fn duplicate_index_keeps_the_original() {
        let now = SystemTime::now();
        let mut reassembler = FragmentReassembler::new(ReassemblyLimits::default());
        let pieces = fragments(2);
        reassembler.add(pieces[0].clone(), exit(), (), now).unwrap();
        let mut dup = pieces[0].clone();
        dup.data = b"impostor".to_vec();
        assert!(matches!(
            reassembler.add(dup, exit(), (), now),
            Err(ReassemblyError::DuplicateFragment { index: 0, .. })
        ));
        match reassembler.add(pieces[1].clone(), exit(), (), now).unwrap() {
            AddOutcome::Complete(message) => assert_eq!(message.data, expected(2)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn count_mismatch_is_inconsistent() {
        let now = SystemTime::now();
        let mut reassembler = FragmentReassembler::new(ReassemblyLimits::default());
        let pieces = fragments(3);
        reassembler.add(pieces[0].clone(), exit(), (), now).unwrap();
        let mut odd = pieces[1].clone();
        odd.count = 4;
        assert!(matches!(
            reassembler.add(odd, exit(), (), now),
            Err(ReassemblyError::Inconsistent { .. })
        ));
    }

    #[test]
    fn expired_buffers_do_not_resurrect() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(50_000);
        let limits = ReassemblyLimits {
            timeout: Duration::from_secs(60),
            ..ReassemblyLimits::default()
        };
        let mut reassembler = FragmentReassembler::new(limits);
        let pieces = fragments(2);
        reassembler.add(pieces[0].clone(), exit(), "first", start).unwrap();

        let late = start + Duration::from_secs(61);
        assert_eq!(
            reassembler.add(pieces[1].clone(), exit(), "second", late).unwrap(),
            AddOutcome::Pending { received: 1, count: 2 }
        );
        assert_eq!(reassembler.expire(late), vec!["first"]);
        assert_eq!(
            reassembler.expire(late + Duration::from_secs(60)),
            vec!["second"]
        );
        assert!(reassembler.is_empty());
    }

    #[test]
    fn declared_count_is_bounded() {
        let mut reassembler: FragmentReassembler = FragmentReassembler::new(ReassemblyLimits {
            max_fragments: 4,
            ..ReassemblyLimits::default()
        });
        let fragment = fragments(5).remove(0);
        assert!(matches!(
            reassembler.add(fragment, exit(), (), SystemTime::now()),
            Err(ReassemblyError::TooLarge { count: 5, .. })
        ));
    }

    #[test]
    fn live_buffers_are_bounded() {
        let now = SystemTime::now();
        let mut reassembler: FragmentReassembler = FragmentReassembler::new(ReassemblyLimits {
            max_messages: 1,
            ..ReassemblyLimits::default()
        });
        reassembler.add(fragments(2).remove(0), exit(), (), now).unwrap();
        let mut other = fragments(2).remove(0);
        other.message_id = MessageId([9u8; 20]);
        assert_eq!(
            reassembler.add(other, exit(), (), now).unwrap_err(),
            ReassemblyError::Full
        );
    }

    proptest! {
        #[test]
        fn completion_is_order_independent(
            order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
            dups in proptest::collection::vec(0..6usize, 0..4),
        ) {
            let now = SystemTime::now();
            let pieces = fragments(6);
            let mut reassembler = FragmentReassembler::new(ReassemblyLimits::default());
            let mut completed = Vec::new();
            let mut arrivals: Vec<usize> = order.clone();
            for (slot, dup) in dups.iter().enumerate() {
                let at = (slot * 2 + 1).min(arrivals.len());
                arrivals.insert(at, *dup);
            }
            for i in arrivals {
                match reassembler.add(pieces[i].clone(), exit(), (), now) {
                    Ok(AddOutcome::Complete(message)) => completed.push(message.data),
                    Ok(AddOutcome::Pending { .. }) => {}
                    Err(ReassemblyError::DuplicateFragment { .. }) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            prop_assert_eq!(completed.len(), 1);
            prop_assert_eq!(&completed[0], &expected(6));
        }
    }
}
