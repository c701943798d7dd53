//! # camlink
//!
//! Client-side runtime for talking to camlink cameras and network video
//! recorders.
//!
//! ## Overview
//!
//! - **Transport Core**: framed links to a device over P2P, relay or LAN,
//!   with hole punching, heartbeats and reconnects
//! - **Stream Core**: media packet headers, packetizing and frame reassembly
//! - **Command Core**: command envelopes and request/response correlation
//! - **Session Core**: the session registry, per-session state machines and
//!   application events
//! - **Infra Common**: logging setup and configuration files
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use camlink::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let config = CamlinkConfig::default();
//! config.init_logging()?;
//! let directory = Arc::new(StaticDirectory::new().with(DeviceRecord::camera(DeviceAddress::new("CAM-1"))));
//! let registry = SessionRegistry::with_network(config, directory, None)?;
//! let live = registry.open("CAM-1", SessionKind::Watch, 0, OpenParams::default()).await?;
//! registry.close(&live).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub use camlink_command_core as command_core;
pub use camlink_infra_common as infra_common;
pub use camlink_session_core as session_core;
pub use camlink_stream_core as stream_core;
pub use camlink_transport_core as transport_core;

pub mod prelude {
    //! Common imports for camlink applications

    pub use crate::session_core::prelude::*;
    pub use crate::transport_core::{DeviceAddress, TransportHint, TransportKind};
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
