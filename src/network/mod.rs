// P2P networking

mod connections;
mod handlers;
mod message;
mod node;
mod payload;
mod peer;
mod peer_directory;

pub use connections::{ConnectionInfo, ConnectionRegistry, ConnectionSlot};
pub use message::{Frame, Message, NetworkType, RequestType, FRAME_PREFIX_SIZE};
pub use node::Node;
pub use payload::{
    AddressMessage, AddressPayload, DataMessage, GetDataMessage, GetDataType, HandshakeMessage,
    HeaderType, Payload, DEFAULT_BATCH_LIMIT, NODE_NETWORK,
};
pub use peer::{
    read_frame, read_message, validate_handshake, write_message, ConnectionState, Direction, Peer,
    MAX_HANDSHAKE_CLOCK_SKEW_SECS,
};
pub use peer_directory::{PeerDirectory, PeerRecord};
