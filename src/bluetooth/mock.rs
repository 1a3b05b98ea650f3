//! In-process Bluetooth stack for tests.
//!
//! Devices are plain addresses, connection events are scripted or injected
//! with [`MockPlatform::emit`], and every opened channel is one end of a tokio
//! duplex pipe whose other end the test drives via [`MockPlatform::take_peer`].

use std::{
   collections::{HashSet, VecDeque},
   io,
   time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   io::DuplexStream,
   sync::mpsc,
   time,
};

use crate::{
   bluetooth::platform::{BluetoothPlatform, BoxedEventSource, NativeConnectionEvent},
   error::{L2capError, Result},
   event::Subscription,
};

const PIPE_CAPACITY: usize = 64 * 1024;
const EVENT_WAIT: Duration = Duration::from_secs(2);
const SILENCE_WAIT: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub(crate) struct MockDevice {
   pub(crate) address: SmolStr,
}

#[derive(Default)]
struct MockState {
   devices: HashSet<SmolStr>,
   script: Vec<NativeConnectionEvent>,
   refused_psms: HashSet<u16>,
   fail_channel_connect: bool,
   link: Option<mpsc::UnboundedSender<NativeConnectionEvent>>,
   peers: VecDeque<DuplexStream>,
   opened_connections: usize,
   closed_connections: usize,
}

pub(crate) struct MockPlatform {
   state: Mutex<MockState>,
}

impl MockPlatform {
   /// A stack that knows no devices and connects every link immediately.
   pub(crate) fn new() -> Self {
      Self {
         state: Mutex::new(MockState {
            script: vec![NativeConnectionEvent::Connecting, NativeConnectionEvent::Connected],
            ..Default::default()
         }),
      }
   }

   pub(crate) fn with_device(self, address: &str) -> Self {
      self.state.lock().devices.insert(address.into());
      self
   }

   /// Replaces the events every new link reports on its own.
   pub(crate) fn with_script(self, script: impl IntoIterator<Item = NativeConnectionEvent>) -> Self {
      self.state.lock().script = script.into_iter().collect();
      self
   }

   pub(crate) fn refuse_psm(self, psm: u16) -> Self {
      self.state.lock().refused_psms.insert(psm);
      self
   }

   pub(crate) fn fail_channel_connect(self) -> Self {
      self.state.lock().fail_channel_connect = true;
      self
   }

   /// Injects a native event on the most recent link.
   pub(crate) fn emit(&self, event: NativeConnectionEvent) {
      if let Some(link) = self.state.lock().link.as_ref() {
         let _ = link.send(event);
      }
   }

   /// Remote end of the oldest channel not yet taken.
   pub(crate) fn take_peer(&self) -> DuplexStream {
      self
         .state
         .lock()
         .peers
         .pop_front()
         .expect("no channel was opened")
   }

   pub(crate) fn opened_connections(&self) -> usize {
      self.state.lock().opened_connections
   }

   pub(crate) fn closed_connections(&self) -> usize {
      self.state.lock().closed_connections
   }
}

#[async_trait]
impl BluetoothPlatform for MockPlatform {
   type Device = MockDevice;
   type Stream = DuplexStream;
   type Events = BoxedEventSource;

   async fn resolve_device(&self, address: &str) -> Result<MockDevice> {
      if self.state.lock().devices.contains(address) {
         Ok(MockDevice {
            address: address.into(),
         })
      } else {
         Err(L2capError::DeviceNotFound(address.into()))
      }
   }

   async fn open_connection(&self, _device: &MockDevice) -> Result<BoxedEventSource> {
      let (tx, rx) = mpsc::unbounded_channel();
      let mut state = self.state.lock();
      for event in &state.script {
         let _ = tx.send(*event);
      }
      state.link = Some(tx);
      state.opened_connections += 1;

      Ok(stream::unfold(rx, |mut rx| async move {
         let event = rx.recv().await?;
         Some((event, rx))
      })
      .boxed())
   }

   async fn close_connection(&self, _device: &MockDevice) -> Result<()> {
      let mut state = self.state.lock();
      state.link = None;
      state.closed_connections += 1;
      Ok(())
   }

   async fn open_l2cap_channel(&self, _device: &MockDevice, psm: u16) -> Result<DuplexStream> {
      let mut state = self.state.lock();
      if state.refused_psms.contains(&psm) {
         return Err(L2capError::ChannelUnavailable {
            psm,
            source: io::Error::new(io::ErrorKind::Unsupported, "PSM not offered by peer"),
         });
      }
      if state.fail_channel_connect {
         return Err(L2capError::ConnectFailed(io::Error::from(
            io::ErrorKind::ConnectionRefused,
         )));
      }
      let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
      state.peers.push_back(remote);
      Ok(local)
   }
}

/// Next event on `sub`, or `None` if nothing arrives in time.
pub(crate) async fn recv_within<T: Clone>(sub: &mut Subscription<T>) -> Option<T> {
   time::timeout(EVENT_WAIT, sub.recv()).await.ok().flatten()
}

/// Whether `sub` stays quiet for a short while.
pub(crate) async fn stays_silent<T: Clone>(sub: &mut Subscription<T>) -> bool {
   time::timeout(SILENCE_WAIT, sub.recv()).await.is_err()
}

/// Polls `check` until it holds, giving up after a while.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
   F: FnMut() -> Fut,
   Fut: Future<Output = bool>,
{
   let deadline = time::Instant::now() + EVENT_WAIT;
   while time::Instant::now() < deadline {
      if check().await {
         return true;
      }
      time::sleep(Duration::from_millis(10)).await;
   }
   check().await
}
