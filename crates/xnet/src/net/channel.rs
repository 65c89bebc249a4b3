//! Sequenced datagram channel to a single peer.
//!
//! Every datagram carries the sender's sequence number and the last
//! sequence it has seen from the peer. On top of that the channel runs a
//! single reliable unit at a time, tagged with an alternating parity bit.
//! The peer echoes the parity of the last unit it accepted, so a matching
//! echo on an ack that covers the send releases the unit and a mismatch
//! means it was lost. Reliable messages larger than one unit are split
//! into fragment chains that go out one piece per unit.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::flow::{Flow, FlowDirection, NetworkStats, RttEstimator};
use super::fragment::{FragmentQueue, Reassembly};
use super::protocol::{
    DEFAULT_RATE, FRAGMENT_MAX_SIZE, FRAGMENT_MIN_SIZE, FragmentId, MAX_PACKET_SIZE, MAX_RATE,
    MAX_RELIABLE_PAYLOAD, MIN_RATE, NET_MAX_PAYLOAD, PacketHeader, ReliableHeader,
    UDP_HEADER_SIZE, next_sequence, sequence_diff, sequence_greater_than,
};
use super::transport::Transport;
use crate::bitbuf::BitBuffer;
use crate::error::{ChannelError, ProtocolError, TransientError};
use crate::huffman;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Identifies the client across address changes.
    pub qport: u16,
    /// Outgoing bytes per second.
    pub rate: f32,
    /// Huffman-compress datagram bodies. Both ends must agree.
    pub compress: bool,
    pub max_reliable_payload: usize,
    pub fragment_size: usize,
    pub max_packet_size: usize,
    /// Resend an unacknowledged unit after this long even without a
    /// loss signal from the peer.
    pub resend_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            qport: 0,
            rate: DEFAULT_RATE,
            compress: false,
            max_reliable_payload: MAX_RELIABLE_PAYLOAD,
            fragment_size: FRAGMENT_MAX_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
            resend_interval: Duration::from_secs(1),
        }
    }
}

/// Payload delivered by one accepted datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub sequence: u32,
    /// A complete reliable message, if this datagram finished one.
    pub reliable: Option<Vec<u8>>,
    pub unreliable: Vec<u8>,
}

#[derive(Debug)]
struct InFlight {
    data: Vec<u8>,
    fragment: Option<FragmentId>,
}

pub struct NetChannel {
    remote: SocketAddr,
    config: ChannelConfig,

    /// Staging area for reliable data not yet handed to the wire.
    message: BitBuffer,

    incoming_sequence: u32,
    incoming_acknowledged: u32,
    incoming_reliable_acknowledged: bool,
    incoming_reliable_sequence: bool,

    outgoing_sequence: u32,
    reliable_sequence: bool,
    last_reliable_sequence: u32,
    last_reliable_send: Option<Instant>,

    in_flight: Option<InFlight>,
    fragments: FragmentQueue,
    reassembly: Reassembly,

    cleartime: Instant,
    connect_time: Instant,
    last_received: Instant,
    last_sent: Instant,

    drop_count: u32,
    good_count: u32,
    choke_count: u32,

    flow_out: Flow,
    flow_in: Flow,
    rtt: RttEstimator,
    stats: NetworkStats,
}

impl NetChannel {
    pub fn new(remote: SocketAddr, mut config: ChannelConfig, now: Instant) -> Self {
        config.rate = config.rate.clamp(MIN_RATE, MAX_RATE);
        // the reliable descriptor carries the unit length in a u16
        config.max_reliable_payload = config.max_reliable_payload.min(u16::MAX as usize);
        config.fragment_size = config
            .fragment_size
            .clamp(FRAGMENT_MIN_SIZE, config.max_reliable_payload.max(FRAGMENT_MIN_SIZE));

        Self {
            remote,
            config,
            message: BitBuffer::with_capacity(NET_MAX_PAYLOAD),
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_acknowledged: false,
            incoming_reliable_sequence: false,
            outgoing_sequence: 1,
            reliable_sequence: false,
            last_reliable_sequence: 0,
            last_reliable_send: None,
            in_flight: None,
            fragments: FragmentQueue::default(),
            reassembly: Reassembly::default(),
            cleartime: now,
            connect_time: now,
            last_received: now,
            last_sent: now,
            drop_count: 0,
            good_count: 0,
            choke_count: 0,
            flow_out: Flow::default(),
            flow_in: Flow::default(),
            rtt: RttEstimator::default(),
            stats: NetworkStats::default(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Follows a client whose address changed under the same qport.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        if remote != self.remote {
            log::info!("Channel {} moved to {remote}", self.remote);
            self.remote = remote;
        }
    }

    pub fn qport(&self) -> u16 {
        self.config.qport
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.config.rate = rate.clamp(MIN_RATE, MAX_RATE);
    }

    pub fn set_compress(&mut self, compress: bool) {
        self.config.compress = compress;
    }

    /// Reliable data written here goes out in order, exactly once.
    pub fn message(&mut self) -> &mut BitBuffer {
        &mut self.message
    }

    /// Appends bytes to the reliable stream. False if they do not fit.
    pub fn queue_reliable(&mut self, data: &[u8]) -> bool {
        self.message.write_bytes(data)
    }

    /// Discards reliable data that has not been put on the wire yet.
    /// A unit already in flight is kept so parity stays in step with the peer.
    pub fn clear_pending(&mut self) {
        self.message.clear();
        self.fragments.clear();
    }

    pub fn has_pending_reliable(&self) -> bool {
        self.in_flight.is_some() || !self.fragments.is_empty() || self.message.bytes_written() > 0
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_fragments(&self) -> usize {
        self.fragments.pending_pieces()
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    pub fn incoming_acknowledged(&self) -> u32 {
        self.incoming_acknowledged
    }

    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    pub fn good_count(&self) -> u32 {
        self.good_count
    }

    pub fn choke_count(&self) -> u32 {
        self.choke_count
    }

    /// Returns the chokes since the last call, for reporting to the peer.
    pub fn take_choke_count(&mut self) -> u32 {
        std::mem::take(&mut self.choke_count)
    }

    pub fn connect_time(&self) -> Instant {
        self.connect_time
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            rtt_ms: self.rtt.rtt_ms(),
            rtt_variance: self.rtt.rtt_variance(),
            ..self.stats.clone()
        }
    }

    pub fn flow(&self, direction: FlowDirection) -> &Flow {
        match direction {
            FlowDirection::Outgoing => &self.flow_out,
            FlowDirection::Incoming => &self.flow_in,
        }
    }

    /// True once the bandwidth budget allows another datagram.
    pub fn can_packet(&self, now: Instant) -> bool {
        self.cleartime <= now
    }

    pub fn note_choke(&mut self) {
        self.choke_count += 1;
        self.stats.chokes += 1;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received) > timeout
    }

    fn needs_resend(&self, now: Instant) -> bool {
        let ack_covers_send = !sequence_greater_than(self.last_reliable_sequence, self.incoming_acknowledged);
        let lost = ack_covers_send && self.incoming_reliable_acknowledged != self.reliable_sequence;
        lost || self
            .last_reliable_send
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.config.resend_interval)
    }

    fn next_unit(&mut self) -> Option<InFlight> {
        let staged = self.message.bytes_written();
        if staged > self.config.max_reliable_payload {
            let data = self.message.written().to_vec();
            self.message.clear();
            match self.fragments.push(data, self.config.fragment_size) {
                Ok(chain) => log::debug!(
                    "{}: split {staged} reliable bytes into chain {chain}",
                    self.remote
                ),
                Err(e) => log::error!("{}: reliable message discarded: {e}", self.remote),
            }
        }

        if let Some((id, piece)) = self.fragments.current() {
            return Some(InFlight {
                data: piece.to_vec(),
                fragment: Some(id),
            });
        }

        if self.message.bytes_written() > 0 {
            let data = self.message.written().to_vec();
            self.message.clear();
            return Some(InFlight {
                data,
                fragment: None,
            });
        }
        None
    }

    /// Builds and sends the next datagram. The reliable unit in flight is
    /// included when it is new or judged lost. `unreliable` rides along if
    /// it fits and is dropped otherwise.
    pub fn transmit<T: Transport>(
        &mut self,
        transport: &mut T,
        unreliable: &[u8],
        now: Instant,
    ) -> Result<usize, ChannelError> {
        if self.message.is_overflowed() {
            log::warn!(
                "{}: {}, {} reliable bytes discarded",
                self.remote,
                TransientError::Overflow,
                self.message.bytes_written()
            );
            self.message.clear();
            self.stats.overflows += 1;
        }

        let mut send_reliable = false;
        if self.in_flight.is_some() {
            if self.needs_resend(now) {
                send_reliable = true;
                self.stats.reliable_resends += 1;
                log::debug!(
                    "{}: resending reliable unit last sent as {}",
                    self.remote,
                    self.last_reliable_sequence
                );
            }
        } else if let Some(unit) = self.next_unit() {
            self.in_flight = Some(unit);
            self.reliable_sequence = !self.reliable_sequence;
            send_reliable = true;
        }

        let reliable = match (&self.in_flight, send_reliable) {
            (Some(unit), true) => Some(unit),
            _ => None,
        };

        let header = PacketHeader {
            sequence: self.outgoing_sequence,
            ack: self.incoming_sequence,
            ack_reliable: self.incoming_reliable_sequence,
            qport: self.config.qport,
            reliable: reliable.map(|unit| ReliableHeader {
                parity: self.reliable_sequence,
                length: unit.data.len() as u16,
                fragment: unit.fragment,
            }),
        };
        let header_len = header.encoded_len();

        let mut body = Vec::with_capacity(MAX_PACKET_SIZE);
        if let Some(unit) = reliable {
            body.extend_from_slice(&unit.data);
        }
        if header_len + body.len() + unreliable.len() <= self.config.max_packet_size {
            body.extend_from_slice(unreliable);
        } else {
            log::warn!(
                "{}: {}",
                self.remote,
                TransientError::UnreliableDropped(unreliable.len())
            );
            self.stats.unreliable_dropped += 1;
            self.note_choke();
        }
        let uncompressed = header_len + body.len();

        let mut datagram = BitBuffer::with_capacity(header_len);
        header.write(&mut datagram);
        let mut datagram = datagram.into_inner();
        if self.config.compress && !body.is_empty() {
            datagram.extend_from_slice(&huffman::compress(&body).map_err(ProtocolError::from)?);
        } else {
            datagram.extend_from_slice(&body);
        }

        transport.send_to(&datagram, self.remote)?;

        if let Some(fragment) = header.reliable.and_then(|r| r.fragment) {
            log::trace!(
                "{}: fragment {}/{} of chain {}",
                self.remote,
                fragment.index + 1,
                fragment.count,
                fragment.chain
            );
            self.stats.fragments_sent += 1;
        }
        if send_reliable {
            self.last_reliable_sequence = self.outgoing_sequence;
            self.last_reliable_send = Some(now);
        }
        self.rtt.track(self.outgoing_sequence, now);
        self.outgoing_sequence = next_sequence(self.outgoing_sequence);
        self.last_sent = now;

        let cost = (datagram.len() + UDP_HEADER_SIZE) as f32 / self.config.rate;
        self.cleartime = self.cleartime.max(now) + Duration::from_secs_f32(cost);

        self.flow_out.record(datagram.len(), now);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        self.stats.uncompressed_sent += uncompressed as u64;

        Ok(datagram.len())
    }

    /// Accepts one sequenced datagram from the peer. Stale and duplicate
    /// datagrams yield `Ok(None)`. Errors mean the peer is broken and the
    /// channel should be torn down.
    pub fn process(&mut self, data: &[u8], now: Instant) -> Result<Option<Received>, ProtocolError> {
        let mut buf = BitBuffer::new(data);
        let header = PacketHeader::read(&mut buf)?;
        let header_len = buf.bytes_read();

        if !sequence_greater_than(header.sequence, self.incoming_sequence) {
            let reason = if header.sequence == self.incoming_sequence {
                self.stats.duplicates += 1;
                TransientError::Duplicate(header.sequence)
            } else {
                self.stats.out_of_order += 1;
                TransientError::Stale {
                    sequence: header.sequence,
                    last: self.incoming_sequence,
                }
            };
            log::debug!("{}: {reason}", self.remote);
            return Ok(None);
        }

        let raw_body = &data[header_len..];
        let body = if self.config.compress && !raw_body.is_empty() {
            huffman::decompress(raw_body)?
        } else {
            raw_body.to_vec()
        };

        let reliable_len = header.reliable.map_or(0, |r| r.length as usize);
        if body.len() < reliable_len {
            return Err(ProtocolError::TruncatedReliable {
                declared: reliable_len,
                available: body.len(),
            });
        }

        let gap = sequence_diff(header.sequence, self.incoming_sequence) - 1;
        if gap > 0 {
            log::debug!(
                "{}: dropped {gap} datagram(s) at {}",
                self.remote,
                header.sequence
            );
            self.drop_count += gap;
            self.stats.packets_dropped += gap as u64;
        }

        if sequence_greater_than(header.ack, self.incoming_acknowledged) {
            self.rtt.acknowledge(header.ack, now);
        }
        self.incoming_acknowledged = header.ack;
        self.incoming_reliable_acknowledged = header.ack_reliable;

        let delivered_unit = self.in_flight.is_some()
            && self.last_reliable_send.is_some()
            && header.ack_reliable == self.reliable_sequence
            && !sequence_greater_than(self.last_reliable_sequence, header.ack);
        if delivered_unit {
            if let Some(InFlight {
                fragment: Some(id), ..
            }) = self.in_flight.take()
            {
                self.fragments.acknowledge(id);
            }
        }

        self.incoming_sequence = header.sequence;
        self.last_received = now;
        self.good_count += 1;
        self.flow_in.record(data.len(), now);
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.stats.uncompressed_received += (header_len + body.len()) as u64;

        let (unit, unreliable) = body.split_at(reliable_len);
        let mut reliable = None;
        if let Some(header) = header.reliable {
            if header.parity == self.incoming_reliable_sequence {
                log::trace!("{}: reliable unit already received", self.remote);
            } else {
                self.incoming_reliable_sequence = header.parity;
                reliable = match header.fragment {
                    Some(id) => {
                        self.stats.fragments_received += 1;
                        self.reassembly.insert(id, unit)?
                    }
                    None => Some(unit.to_vec()),
                };
            }
        }

        Ok(Some(Received {
            sequence: header.sequence,
            reliable,
            unreliable: unreliable.to_vec(),
        }))
    }
}
