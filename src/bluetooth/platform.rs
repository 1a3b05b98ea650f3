//! Boundary to the native Bluetooth stack.
//!
//! The manager never talks to a concrete stack. Each platform binding
//! implements [`BluetoothPlatform`]: device resolution, the native
//! connection-event source, and creation of L2CAP channel streams.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{bluetooth::connection::ConnectionState, error::Result};

/// Connection lifecycle as reported by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeConnectionEvent {
   Connecting,
   Connected,
   Disconnecting,
   Disconnected,
}

impl From<NativeConnectionEvent> for ConnectionState {
   fn from(event: NativeConnectionEvent) -> Self {
      match event {
         NativeConnectionEvent::Connecting => Self::Connecting,
         NativeConnectionEvent::Connected => Self::Connected,
         NativeConnectionEvent::Disconnecting => Self::Disconnecting,
         NativeConnectionEvent::Disconnected => Self::Disconnected,
      }
   }
}

/// Asynchronous source of native connection callbacks for one link.
pub trait ConnectionEventSource: Stream<Item = NativeConnectionEvent> + Send + Unpin + 'static {}

impl<T> ConnectionEventSource for T where T: Stream<Item = NativeConnectionEvent> + Send + Unpin + 'static
{}

/// The event source type most bindings hand out.
pub type BoxedEventSource = BoxStream<'static, NativeConnectionEvent>;

/// Capabilities the channel manager consumes from a Bluetooth stack binding.
#[async_trait]
pub trait BluetoothPlatform: Send + Sync + 'static {
   /// Native device object backing a `DeviceHandle`.
   type Device: Clone + Send + Sync + 'static;
   /// Duplex byte stream of an open L2CAP channel.
   type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
   type Events: ConnectionEventSource;

   /// Resolves `address` to a device known to the stack.
   ///
   /// Fails with `DeviceNotFound` when the stack has no such device.
   async fn resolve_device(&self, address: &str) -> Result<Self::Device>;

   /// Initiates a connection and returns the stream of native state changes.
   ///
   /// Must return as soon as the attempt has started; the outcome of the
   /// attempt is reported through the returned events.
   async fn open_connection(&self, device: &Self::Device) -> Result<Self::Events>;

   async fn close_connection(&self, device: &Self::Device) -> Result<()>;

   /// Creates and connects an L2CAP connection-oriented channel.
   ///
   /// Fails with `ChannelUnavailable` when the stack refuses to create the
   /// channel and with `ConnectFailed` when the stream-level connect fails.
   async fn open_l2cap_channel(&self, device: &Self::Device, psm: u16) -> Result<Self::Stream>;
}
