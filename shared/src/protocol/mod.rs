//! The reliable control protocol: wire format, connection state machine,
//! and the host hooks it drives.

pub mod callbacks;
pub mod checksum;
pub mod connection;
pub mod error;
pub mod packet;
pub mod pktdesc;
pub mod reconstruct;

pub use callbacks::ConnectionCallbacks;
pub use connection::{base_seqno, ConnStats, Connection};
pub use error::ProtocolError;
pub use packet::{
    alloc_advance, build_alloc_tslots, AckExtPayload, AllocPayload, AllocTslot, AreqEntry, Header,
    Payload, HEADER_LEN, IPPROTO_FASTPASS,
};
pub use pktdesc::{OutgoingPayload, PacketDescriptor};
pub use reconstruct::nearest;
