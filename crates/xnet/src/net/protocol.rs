use crate::bitbuf::BitBuffer;
use crate::error::ProtocolError;

pub const PROTOCOL_VERSION: u32 = 48;
pub const DEFAULT_PORT: u16 = 27015;

/// Largest message a fragment chain may reassemble into.
pub const NET_MAX_PAYLOAD: usize = 80_000;
/// Largest reliable unit carried in a single datagram.
pub const MAX_RELIABLE_PAYLOAD: usize = 1200;
pub const MAX_PACKET_SIZE: usize = 1400;
pub const FRAGMENT_MIN_SIZE: usize = 16;
pub const FRAGMENT_MAX_SIZE: usize = MAX_RELIABLE_PAYLOAD;
/// IP plus UDP overhead charged against the rate limit.
pub const UDP_HEADER_SIZE: usize = 28;

pub const DEFAULT_RATE: f32 = 9999.0;
pub const MIN_RATE: f32 = 1000.0;
pub const MAX_RATE: f32 = 20000.0;

pub const MAX_EDICTS: usize = 4096;
pub const MAX_WEAPON_BITS: u32 = 5;

pub const SEQUENCE_MASK: u32 = 0x7FFF_FFFF;
const SEQUENCE_WRAP_THRESHOLD: u32 = SEQUENCE_MASK / 2;
const RELIABLE_BIT: u32 = 1 << 31;

/// Every connectionless datagram starts with these four bytes.
pub const OUT_OF_BAND_MARKER: [u8; 4] = [0xFF; 4];

/// Server to client message ids.
pub mod svc {
    pub const NOP: u8 = 1;
    pub const DISCONNECT: u8 = 2;
    pub const TIME: u8 = 7;
    pub const PRINT: u8 = 8;
    pub const SERVERDATA: u8 = 11;
    pub const DELTATABLE: u8 = 14;
    pub const SPAWNBASELINE: u8 = 22;
    pub const SIGNONNUM: u8 = 25;
    pub const PACKETENTITIES: u8 = 40;
    pub const CHOKECOUNT: u8 = 42;
    pub const DELTAMOVEVARS: u8 = 44;
}

/// Client to server message ids.
pub mod clc {
    pub const NOP: u8 = 1;
    pub const MOVE: u8 = 2;
    pub const STRINGCMD: u8 = 3;
}

/// True if `s1` is newer than `s2` on the 31-bit sequence circle.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    let diff = sequence_diff(s1, s2);
    diff != 0 && diff <= SEQUENCE_WRAP_THRESHOLD
}

/// Distance from `older` forward to `newer`, modulo 2^31.
#[inline]
pub fn sequence_diff(newer: u32, older: u32) -> u32 {
    newer.wrapping_sub(older) & SEQUENCE_MASK
}

#[inline]
pub fn next_sequence(sequence: u32) -> u32 {
    sequence.wrapping_add(1) & SEQUENCE_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentId {
    pub chain: u16,
    pub index: u16,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    /// Alternating bit identifying the unit.
    pub parity: bool,
    pub length: u16,
    pub fragment: Option<FragmentId>,
}

const FLAG_PARITY: u8 = 1 << 0;
const FLAG_FRAGMENT: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    /// Parity of the last reliable unit received from the peer.
    pub ack_reliable: bool,
    pub qport: u16,
    pub reliable: Option<ReliableHeader>,
}

impl PacketHeader {
    pub const BASE_SIZE: usize = 10;

    pub fn encoded_len(&self) -> usize {
        match self.reliable {
            None => Self::BASE_SIZE,
            Some(ReliableHeader { fragment: None, .. }) => Self::BASE_SIZE + 3,
            Some(_) => Self::BASE_SIZE + 9,
        }
    }

    pub fn write<T: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuffer<T>) {
        let mut w1 = self.sequence & SEQUENCE_MASK;
        if self.reliable.is_some() {
            w1 |= RELIABLE_BIT;
        }
        let mut w2 = self.ack & SEQUENCE_MASK;
        if self.ack_reliable {
            w2 |= RELIABLE_BIT;
        }
        buf.write_ulong(w1);
        buf.write_ulong(w2);
        buf.write_word(self.qport);

        if let Some(reliable) = self.reliable {
            let mut flags = 0;
            if reliable.parity {
                flags |= FLAG_PARITY;
            }
            if reliable.fragment.is_some() {
                flags |= FLAG_FRAGMENT;
            }
            buf.write_byte(flags);
            buf.write_word(reliable.length);
            if let Some(fragment) = reliable.fragment {
                buf.write_word(fragment.chain);
                buf.write_word(fragment.index);
                buf.write_word(fragment.count);
            }
        }
    }

    pub fn read<T: AsRef<[u8]>>(buf: &mut BitBuffer<T>) -> Result<Self, ProtocolError> {
        let available = buf.bytes_left();
        if available < Self::BASE_SIZE {
            return Err(ProtocolError::TruncatedHeader(available));
        }

        let w1 = buf.read_ulong();
        let w2 = buf.read_ulong();
        let qport = buf.read_word();

        let reliable = if w1 & RELIABLE_BIT != 0 {
            let flags = buf.read_byte();
            let length = buf.read_word();
            let fragment = if flags & FLAG_FRAGMENT != 0 {
                let fragment = FragmentId {
                    chain: buf.read_word(),
                    index: buf.read_word(),
                    count: buf.read_word(),
                };
                if fragment.count == 0 || fragment.index >= fragment.count {
                    return Err(ProtocolError::BadFragment {
                        index: fragment.index,
                        count: fragment.count,
                    });
                }
                Some(fragment)
            } else {
                None
            };
            Some(ReliableHeader {
                parity: flags & FLAG_PARITY != 0,
                length,
                fragment,
            })
        } else {
            None
        };

        if buf.is_overflowed() {
            return Err(ProtocolError::TruncatedHeader(available));
        }

        Ok(Self {
            sequence: w1 & SEQUENCE_MASK,
            ack: w2 & SEQUENCE_MASK,
            ack_reliable: w2 & RELIABLE_BIT != 0,
            qport,
            reliable,
        })
    }

    /// Peeks the qport of a sequenced datagram without parsing the rest.
    pub fn peek_qport(data: &[u8]) -> Option<u16> {
        let bytes = data.get(8..10)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

pub fn is_out_of_band(data: &[u8]) -> bool {
    data.starts_with(&OUT_OF_BAND_MARKER)
}

pub fn write_out_of_band(text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(OUT_OF_BAND_MARKER.len() + text.len());
    data.extend_from_slice(&OUT_OF_BAND_MARKER);
    data.extend_from_slice(text.as_bytes());
    data
}

/// Text of a connectionless datagram, without the marker or trailing NULs.
pub fn parse_out_of_band(data: &[u8]) -> Option<String> {
    let body = data.strip_prefix(&OUT_OF_BAND_MARKER)?;
    let text = String::from_utf8_lossy(body);
    Some(text.trim_end_matches('\0').trim().to_string())
}

/// Connectionless text commands exchanged before a channel exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutOfBand {
    Connect { protocol: u32, qport: u16 },
    Accept { client_id: u32 },
    Reject { reason: String },
    Info,
    InfoResponse { text: String },
    Disconnect,
    Other(String),
}

impl OutOfBand {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = parse_out_of_band(data)?;
        let mut words = text.split_whitespace();
        let command = words.next().unwrap_or("");

        let parsed = match command {
            "connect" => {
                let protocol = words.next().and_then(|w| w.parse().ok());
                let qport = words.next().and_then(|w| w.parse().ok());
                match (protocol, qport) {
                    (Some(protocol), Some(qport)) => Self::Connect { protocol, qport },
                    _ => Self::Other(text.clone()),
                }
            }
            "accept" => match words.next().and_then(|w| w.parse().ok()) {
                Some(client_id) => Self::Accept { client_id },
                None => Self::Other(text.clone()),
            },
            "reject" => Self::Reject {
                reason: words.collect::<Vec<_>>().join(" "),
            },
            "info" => Self::Info,
            "inforesponse" => Self::InfoResponse {
                text: words.collect::<Vec<_>>().join(" "),
            },
            "disconnect" => Self::Disconnect,
            _ => Self::Other(text.clone()),
        };
        Some(parsed)
    }

    pub fn to_text(&self) -> String {
        match self {
            Self::Connect { protocol, qport } => format!("connect {protocol} {qport}"),
            Self::Accept { client_id } => format!("accept {client_id}"),
            Self::Reject { reason } => format!("reject {reason}"),
            Self::Info => "info".to_string(),
            Self::InfoResponse { text } => format!("inforesponse {text}"),
            Self::Disconnect => "disconnect".to_string(),
            Self::Other(text) => text.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        write_out_of_band(&self.to_text())
    }
}
