//! Device transport for camlink.
//!
//! An [`Endpoint`] owns exactly one physical connection to one device: a
//! hole-punched UDP path, a TCP link through the relay broker, or a direct
//! LAN socket. It frames outbound units with [`FrameHeader`], serializes
//! sends, and exposes inbound frames as a lazy [`InboundStream`] that keeps
//! flowing across reconnects.
//!
//! ```no_run
//! use camlink_transport_core::{open, DeviceAddress, TransportConfig, TransportHint};
//!
//! # async fn example() -> camlink_transport_core::Result<()> {
//! let device = DeviceAddress::new("D1")
//!     .with_p2p("203.0.113.7:32100".parse().unwrap())
//!     .with_relay("198.51.100.2:8000".parse().unwrap(), 4711);
//! let endpoint = open(&device, TransportHint::Auto, &TransportConfig::default()).await?;
//! let mut inbound = endpoint.inbound()?;
//! while let Some(frame) = inbound.next_frame().await {
//!     println!("{} bytes of {}", frame.body.len(), frame.packet_type());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod link;
pub mod memory;
pub mod punch;

pub use config::TransportConfig;
pub use connector::{DeviceAddress, Dialer, NetworkDialer, TransportHint, open};
pub use endpoint::{Endpoint, EndpointId, EndpointStats, EndpointStatus, InboundStream};
pub use error::Error;
pub use frame::{DataSource, FRAME_HEADER_SIZE, FRAME_MAGIC, Frame, FrameHeader, MAX_FRAME_BODY, PacketType};
pub use link::{Link, TcpRelayLink, TransportKind, UdpLink};
pub use memory::{MemoryDialer, MemoryLink};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        DeviceAddress, Endpoint, EndpointStatus, Error, Frame, PacketType, Result,
        TransportConfig, TransportHint, TransportKind, open,
    };
}
