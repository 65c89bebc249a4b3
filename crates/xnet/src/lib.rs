//! Transport core for a client/server game engine: a bit-level message
//! buffer, a static Huffman codec, table-driven delta compression of game
//! records and a sequenced channel with reliable delivery over UDP.

pub mod bitbuf;
pub mod delta;
pub mod error;
pub mod huffman;
pub mod net;
pub mod session;

pub use bitbuf::BitBuffer;
pub use delta::{DeltaRecord, DeltaRegistry, RecordKind, RecordTable};
pub use error::{ChannelError, ConfigError, ConnectError, ProtocolError, TransientError};
pub use huffman::HuffmanError;
pub use net::{
    ChannelConfig, ClientConnection, ConnectionManager, ConnectionState, DEFAULT_PORT,
    LossyTransport, MemoryNetwork, MemoryTransport, NetChannel, NetworkEndpoint, NetworkStats,
    OutOfBand, PROTOCOL_VERSION, PacketLossSimulation, Received, Transport,
};
