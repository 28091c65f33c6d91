#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # trainerlink
//!
//! A Rust library for driving a Tacx Bushido turbo-trainer brake through an
//! ANT USB stick.
//!
//! The crate is layered bottom-up:
//!
//! - [`message`]: the ANT serial message model and its frame codec
//! - [`usb`]: the [`Transport`] seam and its USB implementation
//! - [`node`] / [`channel`]: channel allocation, configuration and the
//!   send-and-wait primitives everything above is built on
//! - [`messenger`]: weak-reference listener fan-out
//! - [`device`]: the [`BushidoBrake`] controller and its headunit handshake
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trainerlink::{BrakeConfig, BushidoBrake, Node, NodeConfig, UsbConfig, UsbTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(UsbTransport::open(UsbConfig::default())?);
//!     let node = Arc::new(Node::new(transport, NodeConfig::default()));
//!     let brake = BushidoBrake::new(node.clone(), BrakeConfig::default());
//!
//!     // Connect, zero the odometer and start the session
//!     brake.start().await?;
//!
//!     // Simulate a 4 % climb
//!     brake.set_slope(4.0);
//!
//!     brake.stop().await?;
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

/// Logical channels and wait conditions
pub mod channel;
/// Bushido brake controller
pub mod device;
/// Error types and handling
pub mod error;
/// ANT message model and frame codec
pub mod message;
/// Listener registries and asynchronous fan-out
pub mod messenger;
/// The ANT node: startup, network keys, channel pool
pub mod node;
/// Bushido headunit packets
pub mod protocol;
/// Serialized fire-and-forget sending
pub mod sender;
/// Type definitions and configuration
pub mod types;
/// USB transport
pub mod usb;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use channel::{Channel, ChannelState, MessageCondition};
pub use device::{BushidoBrake, ButtonPressListener, TelemetryListener};
pub use error::{Result, TrainerError};
pub use message::{ChannelType, Message, MessageId, ResponseCode};
pub use messenger::{BroadcastMessenger, EventListener, ListenerRegistry};
pub use node::Node;
pub use types::{
    BrakeConfig, Button, ButtonPress, ControllerState, NetworkKey, NodeConfig, StickInfo,
    TelemetryData, UsbConfig,
};
pub use usb::{scan_devices, FrameListener, Transport, UsbTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
