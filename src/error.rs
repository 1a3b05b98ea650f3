//! Error types for the L2CAP channel manager.
//!
//! Every public operation returns a [`Result`] carrying an [`L2capError`].
//! [`L2capError::kind`] collapses the variants into the stable [`ErrorKind`]
//! classification that bridging layers report to their callers.

use smol_str::SmolStr;
use thiserror::Error;
use tokio::task::JoinError;

use crate::bluetooth::l2cap::ChannelMode;

/// Main error type for the channel manager.
#[derive(Error, Debug)]
pub enum L2capError {
   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Connection failed: {0}")]
   ConnectFailed(#[source] std::io::Error),

   #[error("L2CAP channel unavailable on PSM {psm}: {source}")]
   ChannelUnavailable {
      psm: u16,
      #[source]
      source: std::io::Error,
   },

   #[error("L2CAP channel already open on PSM {0}")]
   AlreadyOpen(u16),

   #[error("L2CAP channel not open")]
   ChannelNotOpen,

   #[error("Receive loop already running")]
   AlreadyRunning,

   #[error("Channel busy: {0} in progress")]
   ChannelBusy(ChannelMode),

   #[error("Invalid buffer size: {0}")]
   InvalidBufferSize(usize),

   #[error("Write failed: {0}")]
   WriteFailed(#[source] std::io::Error),

   #[error("Read failed: {0}")]
   ReadFailed(#[source] std::io::Error),

   #[error("No response received")]
   NoResponse,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Receive loop panicked: {0}")]
   ReceiverPanicked(#[source] JoinError),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Stable classification of [`L2capError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum ErrorKind {
   DeviceNotFound,
   DeviceNotConnected,
   ConnectFailed,
   ChannelUnavailable,
   AlreadyOpen,
   ChannelNotOpen,
   AlreadyRunning,
   ChannelBusy,
   InvalidBufferSize,
   WriteFailed,
   ReadFailed,
   NoResponse,
   RequestTimeout,
   ReceiverPanicked,
   StackError,
   DBus,
   Config,
}

impl L2capError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
         Self::DeviceNotConnected => ErrorKind::DeviceNotConnected,
         Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
         Self::ChannelUnavailable { .. } => ErrorKind::ChannelUnavailable,
         Self::AlreadyOpen(_) => ErrorKind::AlreadyOpen,
         Self::ChannelNotOpen => ErrorKind::ChannelNotOpen,
         Self::AlreadyRunning => ErrorKind::AlreadyRunning,
         Self::ChannelBusy(_) => ErrorKind::ChannelBusy,
         Self::InvalidBufferSize(_) => ErrorKind::InvalidBufferSize,
         Self::WriteFailed(_) => ErrorKind::WriteFailed,
         Self::ReadFailed(_) => ErrorKind::ReadFailed,
         Self::NoResponse => ErrorKind::NoResponse,
         Self::RequestTimeout => ErrorKind::RequestTimeout,
         Self::ReceiverPanicked(_) => ErrorKind::ReceiverPanicked,
         Self::Bluetooth(_) | Self::Io(_) => ErrorKind::StackError,
         Self::DBus(_) => ErrorKind::DBus,
         Self::ConfigDirNotFound | Self::TomlParse(_) | Self::TomlSerialize(_) => {
            ErrorKind::Config
         },
      }
   }

   /// Whether the error leaves the channel's stream in an unusable state.
   pub(crate) const fn is_fatal_io(&self) -> bool {
      matches!(
         self,
         Self::WriteFailed(_) | Self::ReadFailed(_) | Self::NoResponse
      )
   }
}

/// Convenience type alias for Results with `L2capError`.
pub type Result<T> = std::result::Result<T, L2capError>;
