//! D-Bus control surface for the channel manager.
//!
//! Serves `org.l2capd.Manager` and bridges the event hub onto its signals.

use log::{debug, info, warn};
use tokio::{select, task::JoinHandle};
use zbus::{Connection, interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{bluez::BluezPlatform, connection::ConnectionState, manager::L2capManager},
   error::{L2capError, Result},
   event::Chunk,
};

pub const BUS_NAME: &str = "org.l2capd";
pub const OBJECT_PATH: &str = "/org/l2capd/manager";

pub struct L2capService {
   manager: L2capManager<BluezPlatform>,
}

impl L2capService {
   pub const fn new(manager: L2capManager<BluezPlatform>) -> Self {
      Self { manager }
   }
}

/// Maps a manager failure onto `org.freedesktop.DBus.Error.Failed`.
fn failed(e: L2capError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(format!("{}: {e}", e.kind()))
}

/// Zero selects the configured default.
const fn size_or(requested: u32, default: usize) -> usize {
   if requested == 0 { default } else { requested as usize }
}

#[interface(name = "org.l2capd.Manager")]
impl L2capService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<()> {
      self.manager.connect(&address).await.map_err(failed)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<()> {
      self.manager.disconnect().await.map_err(failed)
   }

   async fn open_channel(&self, psm: u16) -> zbus::fdo::Result<()> {
      self.manager.open_channel(psm).await.map_err(failed)
   }

   async fn close_channel(&self) -> zbus::fdo::Result<()> {
      self.manager.close_channel().await.map_err(failed)
   }

   async fn exchange(&self, message: Vec<u8>, response_size: u32) -> zbus::fdo::Result<Vec<u8>> {
      let size = size_or(response_size, self.manager.config().response_buffer_size);
      self.manager.exchange(&message, size).await.map_err(failed)
   }

   async fn start_receiving(&self, buffer_size: u32) -> zbus::fdo::Result<()> {
      let size = size_or(buffer_size, self.manager.config().receive_buffer_size);
      self.manager.start_receiving(size).await.map_err(failed)?;
      info!("Receiving started over D-Bus with {size} byte reads");
      Ok(())
   }

   async fn stop_receiving(&self) -> zbus::fdo::Result<()> {
      self.manager.stop_receiving().await.map_err(failed)
   }

   async fn get_status(&self) -> String {
      self.manager.status_json().await.to_string()
   }

   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      state: &str,
      ordinal: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(emitter: &SignalEmitter<'_>, data: &[u8]) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.manager.state().to_string()
   }
}

/// Forwards hub events to D-Bus signals until both topics close.
pub async fn spawn_dispatcher(
   connection: &Connection,
   manager: &L2capManager<BluezPlatform>,
) -> Result<JoinHandle<()>> {
   let iface = connection
      .object_server()
      .interface::<_, L2capService>(OBJECT_PATH)
      .await?;
   let mut states = manager.subscribe_state();
   let mut data = manager.subscribe_data();

   Ok(tokio::spawn(async move {
      let emitter = iface.signal_emitter();
      loop {
         select! {
            Some(state) = states.recv() => {
               if let Err(e) = emit_state(&iface, emitter, state).await {
                  warn!("Error dispatching state {state}: {e}");
               }
            },
            Some(chunk) = data.recv() => {
               if let Err(e) = emit_data(emitter, &chunk).await {
                  warn!("Error dispatching {} received bytes: {e}", chunk.len());
               }
            },
            else => break,
         }
      }
      debug!("Event dispatcher exiting");
   }))
}

async fn emit_state(
   iface: &zbus::object_server::InterfaceRef<L2capService>,
   emitter: &SignalEmitter<'_>,
   state: ConnectionState,
) -> zbus::Result<()> {
   let name: &'static str = state.into();
   L2capService::connection_state_changed(emitter, name, state.ordinal()).await?;
   iface.get().await.state_changed(emitter).await
}

async fn emit_data(emitter: &SignalEmitter<'_>, chunk: &Chunk) -> zbus::Result<()> {
   L2capService::data_received(emitter, chunk).await
}
