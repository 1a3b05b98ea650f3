//! L2CAP channel manager.
//!
//! [`L2capManager`] ties the connection state machine, the channel endpoint,
//! the request/response exchange and the receive loop together behind the
//! control operations callers use. A supervisor task watches the connection
//! state and tears the channel down whenever the link leaves `Connected`.

use std::{
   sync::{Arc, Weak},
   time::Duration,
};

use log::{debug, info, warn};
use serde_json::json;
use smol_str::SmolStr;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
   bluetooth::{
      connection::{ConnectionState, ConnectionStateMachine},
      exchange::RequestResponder,
      l2cap::ChannelEndpoint,
      platform::BluetoothPlatform,
      pump::ReceivePump,
   },
   config::Config,
   error::{L2capError, Result},
   event::{Chunk, EventHub, Subscription},
};

struct ManagerInner<P: BluetoothPlatform> {
   config: Config,
   hub: EventHub,
   connection: ConnectionStateMachine<P>,
   channel: ChannelEndpoint<P::Stream>,
   responder: RequestResponder,
   pump: ReceivePump,
   supervisor: JoinHandle<()>,
}

impl<P: BluetoothPlatform> Drop for ManagerInner<P> {
   fn drop(&mut self) {
      self.supervisor.abort();
   }
}

impl<P: BluetoothPlatform> ManagerInner<P> {
   /// Stops the receive loop and closes the channel.
   async fn invalidate_channel(&self) -> Result<()> {
      let stopped = self.pump.stop().await;
      self.channel.close().await;
      stopped
   }
}

/// Manages one device link and at most one L2CAP channel on it.
///
/// This type is cheaply cloneable and thread-safe. Must be created inside a
/// tokio runtime.
pub struct L2capManager<P: BluetoothPlatform>(Arc<ManagerInner<P>>);

impl<P: BluetoothPlatform> Clone for L2capManager<P> {
   fn clone(&self) -> Self {
      Self(self.0.clone())
   }
}

impl<P: BluetoothPlatform> L2capManager<P> {
   pub fn new(platform: P, config: &Config) -> Self {
      Self::with_platform(Arc::new(platform), config)
   }

   pub fn with_platform(platform: Arc<P>, config: &Config) -> Self {
      let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner<P>>| {
         let hub = EventHub::new(config.event_buffer);
         let connection = ConnectionStateMachine::new(platform, hub.clone());
         let supervisor = tokio::spawn(supervise(weak.clone(), connection.reporter().watch()));
         ManagerInner {
            config: config.clone(),
            hub,
            connection,
            channel: ChannelEndpoint::new(),
            responder: RequestResponder::new(config.exchange_timeout(), config.max_buffer_size),
            pump: ReceivePump::new(config.max_buffer_size),
            supervisor,
         }
      });
      Self(inner)
   }

   pub fn config(&self) -> &Config {
      &self.0.config
   }

   pub fn state(&self) -> ConnectionState {
      self.0.connection.state()
   }

   pub fn hub(&self) -> &EventHub {
      &self.0.hub
   }

   pub fn subscribe_state(&self) -> Subscription<ConnectionState> {
      self.0.hub.subscribe_state()
   }

   pub fn subscribe_data(&self) -> Subscription<Chunk> {
      self.0.hub.subscribe_data()
   }

   pub async fn device_address(&self) -> Option<SmolStr> {
      self
         .0
         .connection
         .device()
         .await
         .map(|device| device.address().clone())
   }

   pub async fn is_channel_open(&self) -> bool {
      self.0.channel.is_open().await
   }

   pub async fn psm(&self) -> Option<u16> {
      self.0.channel.psm().await
   }

   pub fn is_receiving(&self) -> bool {
      self.0.pump.is_running()
   }

   /// Connects to `address`, replacing any current link.
   ///
   /// Resolves once the attempt has started; completion shows up on the
   /// state topic.
   pub async fn connect(&self, address: &str) -> Result<()> {
      let handle = self.0.connection.resolve(address).await?;
      if let Err(e) = self.0.invalidate_channel().await {
         warn!("Receive loop ended abnormally: {e}");
      }
      self.0.connection.attach(handle).await
   }

   pub async fn disconnect(&self) -> Result<()> {
      if let Err(e) = self.0.invalidate_channel().await {
         warn!("Receive loop ended abnormally: {e}");
      }
      self.0.connection.disconnect().await
   }

   /// Waits until the link reaches `state`, failing if it errors first.
   pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
      self.0.connection.wait_for(state).await
   }

   /// Opens the L2CAP channel on `psm`. Requires a connected link.
   pub async fn open_channel(&self, psm: u16) -> Result<()> {
      let inner = &self.0;
      let epoch = inner.connection.reporter().departures();
      inner
         .channel
         .open_on_link(psm, epoch, inner.connection.open_l2cap_channel(psm))
         .await?;

      if !inner.connection.is_connected() || inner.connection.reporter().departures() != epoch {
         warn!("Link left connected state while opening PSM {psm}");
         inner.channel.close().await;
         return Err(L2capError::DeviceNotConnected);
      }
      Ok(())
   }

   /// Stops any receive loop and closes the channel. Idempotent.
   pub async fn close_channel(&self) -> Result<()> {
      self.0.invalidate_channel().await
   }

   /// Writes `message` and returns one response read of up to
   /// `response_size` bytes, bounded by the configured timeout.
   pub async fn exchange(&self, message: &[u8], response_size: usize) -> Result<Vec<u8>> {
      self
         .0
         .responder
         .exchange(&self.0.channel, message, response_size)
         .await
   }

   /// Like [`Self::exchange`] with a caller-supplied bound on the wait.
   pub async fn exchange_with_timeout(
      &self,
      message: &[u8],
      response_size: usize,
      timeout: Duration,
   ) -> Result<Vec<u8>> {
      self
         .0
         .responder
         .exchange_with_timeout(&self.0.channel, message, response_size, Some(timeout))
         .await
   }

   /// Starts publishing channel reads of up to `buffer_size` bytes.
   pub async fn start_receiving(&self, buffer_size: usize) -> Result<()> {
      let inner = &self.0;
      let io = inner.channel.io().await?;
      inner.pump.start(
         io,
         buffer_size,
         inner.hub.clone(),
         inner.connection.reporter().clone(),
      )
   }

   /// Stops the receive loop. Nothing is published once this returns.
   pub async fn stop_receiving(&self) -> Result<()> {
      self.0.pump.stop().await
   }

   /// Converts the manager state to a JSON representation.
   pub async fn status_json(&self) -> serde_json::Value {
      let state: &'static str = self.state().into();
      json!({
         "state": state,
         "device": self.device_address().await,
         "channel": {
            "open": self.is_channel_open().await,
            "psm": self.psm().await,
            "mode": self.0.channel.mode().await.to_string(),
         },
         "receiving": self.is_receiving(),
         "receive_buffer_size": self.0.pump.buffer_size(),
      })
   }
}

async fn supervise<P: BluetoothPlatform>(
   manager: Weak<ManagerInner<P>>,
   mut states: watch::Receiver<ConnectionState>,
) {
   while states.changed().await.is_ok() {
      let state = *states.borrow_and_update();
      let Some(inner) = manager.upgrade() else {
         break;
      };

      // Channels opened before the link last left Connected, even if it has
      // come back since.
      let departures = inner.connection.reporter().departures();
      if inner.channel.is_stale(departures).await {
         info!("Link left connected state, closing L2CAP channel");
         if let Err(e) = inner.pump.stop().await {
            warn!("Receive loop ended abnormally: {e}");
         }
         inner.channel.close_if_stale(departures).await;
      }
      if state.is_inactive() {
         inner.connection.release_if_inactive().await;
      }
   }
   debug!("Link supervisor exiting");
}
