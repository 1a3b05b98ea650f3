//! L2CAP connection-oriented channel manager for Bluetooth LE devices.
//!
//! One device link, at most one L2CAP channel on it, a request/response
//! exchange and a background receive loop, with connection state and
//! inbound data published through an [`event::EventHub`].

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;

pub use bluetooth::{
   bluez::BluezPlatform,
   connection::ConnectionState,
   l2cap::ChannelMode,
   manager::L2capManager,
   platform::{BluetoothPlatform, NativeConnectionEvent},
};
pub use config::Config;
pub use error::{ErrorKind, L2capError, Result};
pub use event::{Chunk, EventHub, Subscription};
