//! BlueZ binding of the Bluetooth stack boundary.
//!
//! Devices are looked up in the adapter's known-device list, link events
//! come from the outcome of `Device::connect` plus the device's `Connected`
//! property, and channels are `bluer` L2CAP stream sockets.

use std::{io, pin::pin, str::FromStr, time::Duration};

use async_trait::async_trait;
use bluer::{
   Adapter, Address, Device, DeviceEvent, DeviceProperty, Session,
   l2cap::{Socket, SocketAddr, Stream},
};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use tokio::{select, sync::mpsc, time};

use crate::{
   bluetooth::platform::{BluetoothPlatform, BoxedEventSource, NativeConnectionEvent},
   config::Config,
   error::{L2capError, Result},
};

/// Bound on the `org.bluez.Device1.Connect` call.
const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BluezPlatform {
   _session: Session,
   adapter: Adapter,
   channel_timeout: Duration,
}

impl BluezPlatform {
   /// Opens a BlueZ session on the configured adapter, or the default one.
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match config.adapter.as_deref() {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      if !adapter.is_powered().await? {
         warn!("Adapter {} is powered off", adapter.name());
      }
      info!("Using Bluetooth adapter {}", adapter.name());

      Ok(Self {
         _session: session,
         adapter,
         channel_timeout: config.channel_connect_timeout(),
      })
   }

   pub fn adapter_name(&self) -> &str {
      self.adapter.name()
   }
}

#[async_trait]
impl BluetoothPlatform for BluezPlatform {
   type Device = Device;
   type Stream = Stream;
   type Events = BoxedEventSource;

   async fn resolve_device(&self, address: &str) -> Result<Device> {
      let not_found = || L2capError::DeviceNotFound(address.into());
      let addr = Address::from_str(address).map_err(|_| not_found())?;
      if !self.adapter.device_addresses().await?.contains(&addr) {
         return Err(not_found());
      }
      Ok(self.adapter.device(addr)?)
   }

   async fn open_connection(&self, device: &Device) -> Result<BoxedEventSource> {
      let properties = device.events().await?;
      let (tx, rx) = mpsc::unbounded_channel();
      tokio::spawn(drive_link(device.clone(), properties, tx));

      Ok(stream::unfold(rx, |mut rx| async move {
         let event = rx.recv().await?;
         Some((event, rx))
      })
      .boxed())
   }

   async fn close_connection(&self, device: &Device) -> Result<()> {
      if device.is_connected().await? {
         device.disconnect().await?;
      }
      Ok(())
   }

   async fn open_l2cap_channel(&self, device: &Device, psm: u16) -> Result<Stream> {
      let address = device.address();
      let address_type = device.address_type().await?;
      let socket = Socket::new_stream()
         .map_err(|source| L2capError::ChannelUnavailable { psm, source })?;

      debug!("Connecting L2CAP stream to {address}:{psm}");
      let target = SocketAddr::new(address, address_type, psm);
      time::timeout(self.channel_timeout, socket.connect(target))
         .await
         .map_err(|_| L2capError::ConnectFailed(io::ErrorKind::TimedOut.into()))?
         .map_err(L2capError::ConnectFailed)
   }
}

/// Runs the connect attempt, then mirrors the `Connected` property until
/// the receiver is dropped.
async fn drive_link<S>(device: Device, properties: S, tx: mpsc::UnboundedSender<NativeConnectionEvent>)
where
   S: futures::Stream<Item = DeviceEvent>,
{
   let mut properties = pin!(properties);
   let address = device.address();
   let _ = tx.send(NativeConnectionEvent::Connecting);

   let outcome = match time::timeout(LINK_CONNECT_TIMEOUT, device.connect()).await {
      Ok(Ok(())) => NativeConnectionEvent::Connected,
      Ok(Err(e)) if device.is_connected().await.unwrap_or(false) => {
         debug!("{address}: Connect returned {e}, but device is connected");
         NativeConnectionEvent::Connected
      },
      Ok(Err(e)) => {
         warn!("{address}: Connect failed: {e}");
         NativeConnectionEvent::Disconnected
      },
      Err(_) => {
         warn!("{address}: Connect timed out");
         NativeConnectionEvent::Disconnected
      },
   };
   if tx.send(outcome).is_err() {
      return;
   }

   loop {
      select! {
         () = tx.closed() => break,
         event = properties.next() => match event {
            Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected))) => {
               let event = if connected {
                  NativeConnectionEvent::Connected
               } else {
                  NativeConnectionEvent::Disconnected
               };
               if tx.send(event).is_err() {
                  break;
               }
            },
            Some(_) => {},
            None => {
               debug!("{address}: Device removed");
               let _ = tx.send(NativeConnectionEvent::Disconnected);
               break;
            },
         },
      }
   }
}
