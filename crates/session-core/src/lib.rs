//! Sessions against camlink devices.
//!
//! A [`SessionRegistry`] owns every device the application talks to. For
//! each device it keeps one transport endpoint, shared by all of the
//! device's sessions: live watches, two-way talk, recorder replay,
//! downloads, uploads and configuration. Sessions follow the
//! [`SessionState`] machine; everything the application should hear about
//! arrives through an [`EventHandler`], in order per device.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use camlink_session_core::prelude::*;
//! use camlink_transport_core::DeviceAddress;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: Event) {
//!         println!("{:?} {:?}", event.code(), event);
//!     }
//!
//!     async fn on_media(&self, media: MediaEvent) {
//!         println!("{} bytes of {}", media.frame.len(), media.media_type);
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let address = DeviceAddress::new("NVR1").with_relay("198.51.100.2:8000".parse().unwrap(), 3);
//! let directory = Arc::new(StaticDirectory::new().with(DeviceRecord::recorder(address, 8)));
//! let registry = SessionRegistry::with_network(
//!     CamlinkConfig::default(),
//!     directory,
//!     Some(Arc::new(Printer)),
//! )?;
//!
//! let watch = registry
//!     .open("NVR1", SessionKind::Watch, 0, OpenParams::channel(2))
//!     .await?;
//! registry.request_key_frame("NVR1", 0).await?;
//! registry.close(&watch).await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod device;
pub mod errors;
pub mod events;
pub mod recovery;
pub mod registry;
pub mod session;

pub use config::{CamlinkConfig, SessionConfig};
pub use device::{
    Capabilities, ChannelStatus, DeviceDirectory, DeviceInfo, DeviceRecord, DeviceType, OnlineStatus,
    StaticDirectory,
};
pub use errors::{Error, ErrorCategory, ProtocolFault, ResourceFault, Result, SessionFault, TransportFault};
pub use events::{Event, EventCode, EventHandler, EventSink, MediaEvent, MediaExt};
pub use recovery::{RetryConfig, retry_with_backoff};
pub use registry::{
    DeviceView, EndpointFactory, NetworkEndpointFactory, SessionRegistry, TransportInfo,
};
pub use session::{
    AudioChunk, DOWNLOAD_STREAM_INDEX, OpenParams, REPLAY_STREAM_INDEX, SessionHandle, SessionId, SessionInfo,
    SessionKey, SessionKind, SessionState,
};

pub mod prelude {
    pub use crate::session::types::*;
    pub use crate::{
        AudioChunk, CamlinkConfig, ChannelStatus, DOWNLOAD_STREAM_INDEX, DeviceDirectory, DeviceInfo,
        DeviceRecord, DeviceType, DeviceView, Error, Event, EventCode, EventHandler, MediaEvent, MediaExt,
        OnlineStatus, OpenParams, REPLAY_STREAM_INDEX, Result, SessionHandle, SessionId, SessionInfo,
        SessionKind, SessionRegistry, SessionState, StaticDirectory,
    };
}
