//! Splitting of oversized reliable messages into chains of fragments, and
//! their reassembly on the receiving side.
//!
//! Each chain owns its payload once and hands out pieces by index, so a
//! resend is just a second look at the same slice.

use std::collections::VecDeque;

use super::protocol::{FragmentId, NET_MAX_PAYLOAD};
use crate::error::ProtocolError;

#[derive(Debug)]
struct OutgoingChain {
    id: u16,
    data: Vec<u8>,
    piece_size: usize,
    count: u16,
    /// Index of the first piece not yet acknowledged.
    next: u16,
}

impl OutgoingChain {
    fn piece(&self, index: u16) -> &[u8] {
        let start = index as usize * self.piece_size;
        let end = (start + self.piece_size).min(self.data.len());
        &self.data[start..end]
    }
}

/// Chains waiting to go out, oldest first. Only the head chain is ever
/// on the wire.
#[derive(Debug, Default)]
pub struct FragmentQueue {
    chains: VecDeque<OutgoingChain>,
    next_chain_id: u16,
}

impl FragmentQueue {
    /// Queues `data` as a new chain and returns its id.
    pub fn push(&mut self, data: Vec<u8>, piece_size: usize) -> Result<u16, ProtocolError> {
        if data.len() > NET_MAX_PAYLOAD {
            return Err(ProtocolError::FragmentOverflow(data.len()));
        }
        let piece_size = piece_size.max(1);
        let count = data.len().div_ceil(piece_size).max(1);
        let count = u16::try_from(count).map_err(|_| ProtocolError::FragmentOverflow(data.len()))?;

        let id = self.next_chain_id;
        self.next_chain_id = self.next_chain_id.wrapping_add(1);
        self.chains.push_back(OutgoingChain {
            id,
            data,
            piece_size,
            count,
            next: 0,
        });
        Ok(id)
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Pieces still to be acknowledged across every queued chain.
    pub fn pending_pieces(&self) -> usize {
        self.chains.iter().map(|c| (c.count - c.next) as usize).sum()
    }

    /// The next unacknowledged piece of the head chain.
    pub fn current(&self) -> Option<(FragmentId, &[u8])> {
        let chain = self.chains.front()?;
        let id = FragmentId {
            chain: chain.id,
            index: chain.next,
            count: chain.count,
        };
        Some((id, chain.piece(chain.next)))
    }

    /// Marks `id` delivered. Finished chains leave the queue.
    pub fn acknowledge(&mut self, id: FragmentId) {
        let Some(chain) = self.chains.front_mut() else {
            return;
        };
        if chain.id != id.chain || chain.next != id.index {
            return;
        }
        chain.next += 1;
        if chain.next == chain.count {
            log::trace!("Fragment chain {} delivered", chain.id);
            self.chains.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

/// Collects the pieces of one incoming chain.
#[derive(Debug, Default)]
pub struct Reassembly {
    chain: Option<u16>,
    pieces: Vec<Option<Vec<u8>>>,
    received: usize,
    bytes: usize,
}

impl Reassembly {
    /// Stores one piece. Returns the whole message once every piece of the
    /// chain is present. A piece from a different chain discards whatever
    /// was collected so far.
    pub fn insert(&mut self, id: FragmentId, data: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if id.count == 0 || id.index >= id.count {
            return Err(ProtocolError::BadFragment {
                index: id.index,
                count: id.count,
            });
        }

        if self.chain != Some(id.chain) || self.pieces.len() != id.count as usize {
            if self.received > 0 {
                log::debug!(
                    "Discarding {} of {} pieces of chain {:?} for chain {}",
                    self.received,
                    self.pieces.len(),
                    self.chain,
                    id.chain
                );
            }
            self.reset();
            self.chain = Some(id.chain);
            self.pieces.resize(id.count as usize, None);
        }

        let slot = &mut self.pieces[id.index as usize];
        if slot.is_some() {
            return Ok(None);
        }

        let bytes = self.bytes + data.len();
        if bytes > NET_MAX_PAYLOAD {
            self.reset();
            return Err(ProtocolError::FragmentOverflow(bytes));
        }
        *slot = Some(data.to_vec());
        self.bytes = bytes;
        self.received += 1;

        if self.received < self.pieces.len() {
            return Ok(None);
        }

        let mut message = Vec::with_capacity(self.bytes);
        for piece in self.pieces.drain(..).flatten() {
            message.extend_from_slice(&piece);
        }
        self.reset();
        Ok(Some(message))
    }

    pub fn is_collecting(&self) -> bool {
        self.received > 0
    }

    pub fn reset(&mut self) {
        self.chain = None;
        self.pieces.clear();
        self.received = 0;
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_into_pieces() {
        let mut queue = FragmentQueue::default();
        queue.push(payload(3000), 1200).unwrap();
        assert_eq!(queue.pending_pieces(), 3);

        let mut sizes = Vec::new();
        while let Some((id, piece)) = queue.current() {
            assert_eq!(id.count, 3);
            sizes.push(piece.len());
            queue.acknowledge(id);
        }
        assert_eq!(sizes, vec![1200, 1200, 600]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_ack_does_not_advance() {
        let mut queue = FragmentQueue::default();
        queue.push(payload(2500), 1000).unwrap();
        let (first, _) = queue.current().unwrap();
        queue.acknowledge(first);
        queue.acknowledge(first);
        assert_eq!(queue.current().unwrap().0.index, 1);
        assert_eq!(queue.pending_pieces(), 2);
    }

    #[test]
    fn test_reassembly() {
        let data = payload(3000);
        let mut queue = FragmentQueue::default();
        queue.push(data.clone(), 1200).unwrap();

        let mut incoming = Reassembly::default();
        let mut result = None;
        while let Some((id, piece)) = queue.current() {
            let piece = piece.to_vec();
            result = incoming.insert(id, &piece).unwrap();
            queue.acknowledge(id);
        }
        assert_eq!(result, Some(data));
        assert!(!incoming.is_collecting());
    }

    #[test]
    fn test_new_chain_resets_reassembly() {
        let mut incoming = Reassembly::default();
        let first = FragmentId {
            chain: 1,
            index: 0,
            count: 2,
        };
        assert_eq!(incoming.insert(first, b"old").unwrap(), None);

        let other = FragmentId {
            chain: 2,
            index: 1,
            count: 2,
        };
        assert_eq!(incoming.insert(other, b"tail").unwrap(), None);
        let head = FragmentId { index: 0, ..other };
        assert_eq!(
            incoming.insert(head, b"head-").unwrap(),
            Some(b"head-tail".to_vec())
        );
    }

    #[test]
    fn test_invalid_pieces() {
        let mut incoming = Reassembly::default();
        assert_eq!(
            incoming.insert(
                FragmentId {
                    chain: 0,
                    index: 0,
                    count: 0
                },
                b"x"
            ),
            Err(ProtocolError::BadFragment { index: 0, count: 0 })
        );

        let big = vec![0u8; NET_MAX_PAYLOAD];
        let id = FragmentId {
            chain: 3,
            index: 0,
            count: 2,
        };
        assert_eq!(incoming.insert(id, &big).unwrap(), None);
        assert_eq!(
            incoming.insert(FragmentId { index: 1, ..id }, b"z"),
            Err(ProtocolError::FragmentOverflow(NET_MAX_PAYLOAD + 1))
        );

        let mut queue = FragmentQueue::default();
        assert_eq!(
            queue.push(vec![0u8; NET_MAX_PAYLOAD + 1], 1200),
            Err(ProtocolError::FragmentOverflow(NET_MAX_PAYLOAD + 1))
        );
    }
}
