mod channel;
mod connection;
mod flow;
mod fragment;
pub mod protocol;
mod transport;

pub use channel::{ChannelConfig, NetChannel, Received};
pub use connection::{ClientConnection, ConnectionManager, ConnectionState};
pub use flow::{Flow, FlowDirection, NetworkStats, RttEstimator};
pub use fragment::{FragmentQueue, Reassembly};
pub use protocol::{
    DEFAULT_PORT, FragmentId, MAX_PACKET_SIZE, MAX_RELIABLE_PAYLOAD, NET_MAX_PAYLOAD, OutOfBand,
    PROTOCOL_VERSION, PacketHeader, ReliableHeader, clc, is_out_of_band, parse_out_of_band,
    sequence_greater_than, svc, write_out_of_band,
};
pub use transport::{
    LossyTransport, MAX_DATAGRAM, MemoryNetwork, MemoryTransport, NetworkEndpoint,
    PacketLossSimulation, Transport,
};
