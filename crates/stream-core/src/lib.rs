//! Media stream handling for camlink.
//!
//! Devices send media as [`StreamPacket`]s: a 20-byte [`StreamPacketHeader`]
//! followed by a slice of one frame's payload. The [`PacketReassembler`]
//! turns packets back into [`MediaFrame`]s; the [`Packetizer`] does the
//! reverse for audio the client sends (two-way talk).

pub mod error;
pub mod frame;
pub mod packet;
pub mod packetizer;
pub mod reassembler;
pub mod sequence;

pub use error::Error;
pub use frame::MediaFrame;
pub use packet::{
    FrameType, PackRole, STREAM_HEADER_SIZE, StreamPacket, StreamPacketHeader, StreamType,
};
pub use packetizer::Packetizer;
pub use reassembler::{PacketReassembler, ReassemblyConfig, ReassemblyStats};
pub use sequence::SequenceTracker;

/// Sequence number of a packet within its stream
pub type PacketSequence = u16;

/// Index of a frame within its stream
pub type FrameIndex = u32;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Error, FrameIndex, FrameType, MediaFrame, PackRole, PacketReassembler, Packetizer,
        ReassemblyConfig, ReassemblyStats, Result, StreamPacket, StreamPacketHeader, StreamType,
    };
}
