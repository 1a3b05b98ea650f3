//! Device connection lifecycle.
//!
//! [`ConnectionStateMachine`] owns the single device link of a manager and is
//! the only writer of its [`ConnectionState`]. Transitions come either from the
//! manager's own `connect`/`disconnect` calls or from the native event source
//! of the current link, which a per-link monitor task republishes.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   sync::{Mutex, watch},
   task::JoinHandle,
};

use crate::{
   bluetooth::platform::{BluetoothPlatform, ConnectionEventSource},
   error::{L2capError, Result},
   event::EventHub,
};

/// Connection lifecycle of the managed device.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
   Error,
}

impl ConnectionState {
   /// Stable wire ordinal, in declaration order.
   pub const fn ordinal(self) -> u8 {
      self as u8
   }

   /// States in which no device link may be held.
   pub const fn is_inactive(self) -> bool {
      matches!(self, Self::Disconnected | Self::Error)
   }
}

/// Single writer of the connection state.
///
/// Every accepted transition is stored and published to the hub under one
/// lock, so the published order always matches the stored order.
#[derive(Debug, Clone)]
pub(crate) struct StateReporter {
   current: Arc<watch::Sender<ConnectionState>>,
   departures: Arc<AtomicU64>,
   hub: EventHub,
}

impl StateReporter {
   pub(crate) fn new(hub: EventHub) -> Self {
      let (tx, _) = watch::channel(ConnectionState::Disconnected);
      Self {
         current: Arc::new(tx),
         departures: Arc::new(AtomicU64::new(0)),
         hub,
      }
   }

   pub(crate) fn current(&self) -> ConnectionState {
      *self.current.borrow()
   }

   pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
      self.current.subscribe()
   }

   /// Number of times the link has left `Connected`.
   ///
   /// Unlike the watched state, this never loses a drop that was followed
   /// by a quick reconnect.
   pub(crate) fn departures(&self) -> u64 {
      self.departures.load(Ordering::Acquire)
   }

   /// Moves to `next`. Repeating the current state publishes nothing.
   pub(crate) fn transition(&self, next: ConnectionState) -> bool {
      self.apply(next, false)
   }

   /// Applies a state reported by the native stack. Ignored while in `Error`.
   pub(crate) fn report_native(&self, next: ConnectionState) -> bool {
      self.apply(next, true)
   }

   fn apply(&self, next: ConnectionState, native: bool) -> bool {
      self.current.send_if_modified(|state| {
         if *state == next || (native && *state == ConnectionState::Error) {
            return false;
         }
         debug!("Connection state {state} -> {next}");
         if *state == ConnectionState::Connected {
            self.departures.fetch_add(1, Ordering::AcqRel);
         }
         *state = next;
         self.hub.publish_state(next);
         true
      })
   }
}

/// Identifies the remote peer together with its native connection object.
#[derive(Debug, Clone)]
pub struct DeviceHandle<D> {
   address: SmolStr,
   native: D,
}

impl<D> DeviceHandle<D> {
   pub const fn address(&self) -> &SmolStr {
      &self.address
   }

   pub const fn native(&self) -> &D {
      &self.native
   }
}

/// The live device handle and the task republishing its native events.
struct Link<D> {
   handle: DeviceHandle<D>,
   monitor: JoinHandle<()>,
}

impl<D> Drop for Link<D> {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

/// Tracks and publishes the device connection lifecycle.
pub struct ConnectionStateMachine<P: BluetoothPlatform> {
   platform: Arc<P>,
   reporter: StateReporter,
   link: Mutex<Option<Link<P::Device>>>,
}

impl<P: BluetoothPlatform> ConnectionStateMachine<P> {
   pub fn new(platform: Arc<P>, hub: EventHub) -> Self {
      Self {
         platform,
         reporter: StateReporter::new(hub),
         link: Mutex::new(None),
      }
   }

   pub fn state(&self) -> ConnectionState {
      self.reporter.current()
   }

   pub fn is_connected(&self) -> bool {
      self.state() == ConnectionState::Connected
   }

   pub(crate) const fn reporter(&self) -> &StateReporter {
      &self.reporter
   }

   /// Returns a copy of the current device handle, if a link is held.
   pub async fn device(&self) -> Option<DeviceHandle<P::Device>> {
      self.link.lock().await.as_ref().map(|link| link.handle.clone())
   }

   /// Resolves and connects to `address`.
   ///
   /// Resolves as soon as the attempt is initiated; watch the state topic or
   /// use [`Self::wait_for`] to observe its completion.
   pub async fn connect(&self, address: &str) -> Result<()> {
      let handle = self.resolve(address).await?;
      self.attach(handle).await
   }

   /// Looks `address` up on the stack without touching the current link.
   pub async fn resolve(&self, address: &str) -> Result<DeviceHandle<P::Device>> {
      let native = self.platform.resolve_device(address).await?;
      Ok(DeviceHandle {
         address: address.into(),
         native,
      })
   }

   /// Starts a connection attempt to a resolved device, releasing any
   /// previously held link first.
   pub async fn attach(&self, handle: DeviceHandle<P::Device>) -> Result<()> {
      let mut link = self.link.lock().await;
      if let Some(prev) = link.take() {
         info!("Replacing connection to {}", prev.handle.address);
         if let Err(e) = self.teardown(prev).await {
            warn!("Failed to release previous connection: {e}");
         }
      }

      info!("Connecting to {}", handle.address);
      self.reporter.transition(ConnectionState::Connecting);

      let events = match self.platform.open_connection(&handle.native).await {
         Ok(events) => events,
         Err(e) => {
            warn!("{}: Connection attempt refused: {e}", handle.address);
            self.reporter.transition(ConnectionState::Error);
            return Err(e);
         },
      };

      let monitor = tokio::spawn(monitor_link(
         handle.address.clone(),
         events,
         self.reporter.clone(),
      ));
      *link = Some(Link { handle, monitor });
      Ok(())
   }

   /// Tears the current link down. A no-op when no link is held.
   pub async fn disconnect(&self) -> Result<()> {
      let mut link = self.link.lock().await;
      let Some(prev) = link.take() else {
         debug!("Disconnect requested without a device link");
         return Ok(());
      };

      let address = prev.handle.address.clone();
      self.reporter.transition(ConnectionState::Disconnecting);
      let result = self.teardown(prev).await;
      self.reporter.transition(ConnectionState::Disconnected);
      info!("Disconnected from {address}");
      result
   }

   /// Waits until the machine reaches `target`.
   ///
   /// Fails with `DeviceNotConnected` if the machine lands in `Error` first.
   pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
      let mut rx = self.reporter.watch();
      let reached = *rx
         .wait_for(|state| *state == target || *state == ConnectionState::Error)
         .await
         .map_err(|_| L2capError::DeviceNotConnected)?;
      if reached == target {
         Ok(())
      } else {
         Err(L2capError::DeviceNotConnected)
      }
   }

   /// Creates an L2CAP stream on the connected device.
   pub(crate) async fn open_l2cap_channel(&self, psm: u16) -> Result<P::Stream> {
      let device = {
         let link = self.link.lock().await;
         if !self.is_connected() {
            return Err(L2capError::DeviceNotConnected);
         }
         link
            .as_ref()
            .map(|link| link.handle.native.clone())
            .ok_or(L2capError::DeviceNotConnected)?
      };
      self.platform.open_l2cap_channel(&device, psm).await
   }

   /// Drops the link once the state says no link may be held.
   pub(crate) async fn release_if_inactive(&self) {
      let mut link = self.link.lock().await;
      if !self.state().is_inactive() {
         return;
      }
      if let Some(prev) = link.take() {
         info!("Releasing link to {} ({})", prev.handle.address, self.state());
         if let Err(e) = self.teardown(prev).await {
            debug!("Native teardown after link loss failed: {e}");
         }
      }
   }

   async fn teardown(&self, mut link: Link<P::Device>) -> Result<()> {
      link.monitor.abort();
      let _ = (&mut link.monitor).await;
      self.platform.close_connection(&link.handle.native).await
   }
}

async fn monitor_link<E: ConnectionEventSource>(
   address: SmolStr,
   mut events: E,
   reporter: StateReporter,
) {
   while let Some(event) = events.next().await {
      debug!("{address}: Native connection event {event:?}");
      if !reporter.report_native(event.into()) {
         debug!("{address}: Ignored {event:?} in state {}", reporter.current());
      }
   }
   debug!("{address}: Connection event source closed");
}
