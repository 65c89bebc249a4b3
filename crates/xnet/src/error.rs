use std::io;
use std::path::PathBuf;

use crate::huffman::HuffmanError;

/// Problems in a delta description. These abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: unknown struct '{name}'")]
    UnknownStruct { line: usize, name: String },
    #[error("line {line}: expected '{expected}', found '{found}'")]
    Expected {
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("line {line}: unexpected end of description")]
    UnexpectedEof { line: usize },
    #[error("line {line}: unknown flag '{flag}'")]
    UnknownFlag { line: usize, flag: String },
    #[error("line {line}: '{value}' is not a valid number")]
    BadNumber { line: usize, value: String },
    #[error("{table}: no field named '{field}'")]
    UnknownField { table: &'static str, field: String },
    #[error("{table}: field '{field}' defined twice")]
    DuplicateField { table: &'static str, field: String },
    #[error("{table}: field '{field}' has {bits} bits, expected 1..=32")]
    BadBits {
        table: &'static str,
        field: String,
        bits: u32,
    },
    #[error("{table}: too many fields")]
    TooManyFields { table: &'static str },
}

/// The peer sent something that cannot come from a matching build.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram of {0} bytes is too short for a header")]
    TruncatedHeader(usize),
    #[error("reliable unit of {declared} bytes, only {available} in datagram")]
    TruncatedReliable { declared: usize, available: usize },
    #[error("delta table index {0} out of range")]
    BadTableIndex(u32),
    #[error("{table}: field index {index} out of range")]
    BadFieldIndex { table: &'static str, index: u32 },
    #[error("delta table {0} is not initialised")]
    TableNotReady(&'static str),
    #[error("bad entity number {0}")]
    BadEntity(i32),
    #[error("fragment {index} of {count} is invalid")]
    BadFragment { index: u16, count: u16 },
    #[error("fragment chain of {0} bytes exceeds the payload limit")]
    FragmentOverflow(usize),
    #[error("compressed body: {0}")]
    Compression(#[from] HuffmanError),
    #[error("message read past the end of its buffer")]
    Overflow,
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
}

/// Losses that the channel absorbs on its own. They are logged and counted,
/// never handed to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransientError {
    #[error("outgoing datagram overflowed")]
    Overflow,
    #[error("unreliable payload of {0} bytes does not fit, dropped")]
    UnreliableDropped(usize),
    #[error("stale datagram {sequence} (last {last})")]
    Stale { sequence: u32, last: u32 },
    #[error("duplicate datagram {0}")]
    Duplicate(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

/// Reasons a `connect` request is refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("server is full")]
    ServerFull,
    #[error("protocol {0} is not supported, expected {expected}", expected = crate::net::PROTOCOL_VERSION)]
    BadProtocol(u32),
}
