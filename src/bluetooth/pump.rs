//! Background receive loop.
//!
//! The pump owns the channel in [`ChannelMode::Receive`] for as long as it
//! runs and republishes every non-empty read as one inbound-data event. It is
//! stopped cooperatively through a cancellation token; [`ReceivePump::stop`]
//! returns only after the task has exited, so nothing is published afterwards.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   io::{AsyncRead, AsyncWrite},
   select,
   task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{
      connection::{ConnectionState, StateReporter},
      l2cap::{ChannelIo, ChannelMode, MAX_SDU_SIZE, ModeGuard},
   },
   error::{L2capError, Result},
   event::{Chunk, EventHub},
};

/// State of the active receive loop.
#[derive(Debug)]
struct ReceiveLoop {
   running: Arc<AtomicBool>,
   buffer_size: usize,
   cancel: CancellationToken,
   task: JoinHandle<()>,
}

impl ReceiveLoop {
   fn is_live(&self) -> bool {
      self.running.load(Ordering::Acquire) && !self.task.is_finished()
   }
}

/// Starts and stops the single receive loop of a manager.
#[derive(Debug)]
pub struct ReceivePump {
   active: Mutex<Option<ReceiveLoop>>,
   max_buffer_size: usize,
}

impl Default for ReceivePump {
   fn default() -> Self {
      Self::new(MAX_SDU_SIZE)
   }
}

impl ReceivePump {
   /// Reads larger than `max_buffer_size` cannot be requested.
   pub const fn new(max_buffer_size: usize) -> Self {
      Self {
         active: Mutex::new(None),
         max_buffer_size,
      }
   }

   pub fn is_running(&self) -> bool {
      self.active.lock().as_ref().is_some_and(ReceiveLoop::is_live)
   }

   pub fn buffer_size(&self) -> Option<usize> {
      self
         .active
         .lock()
         .as_ref()
         .filter(|active| active.is_live())
         .map(|active| active.buffer_size)
   }

   /// Spawns the receive loop on `io`.
   ///
   /// The loop holds the channel in [`ChannelMode::Receive`] until it exits.
   pub(crate) fn start<S>(
      &self,
      io: ChannelIo<S>,
      buffer_size: usize,
      hub: EventHub,
      reporter: StateReporter,
   ) -> Result<()>
   where
      S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
   {
      if buffer_size == 0 || buffer_size > self.max_buffer_size {
         return Err(L2capError::InvalidBufferSize(buffer_size));
      }

      let mut active = self.active.lock();
      if active.as_ref().is_some_and(ReceiveLoop::is_live) {
         return Err(L2capError::AlreadyRunning);
      }
      let guard = io.mode().try_acquire(ChannelMode::Receive).map_err(|held| match held {
         ChannelMode::Receive => L2capError::AlreadyRunning,
         other => L2capError::ChannelBusy(other),
      })?;

      let running = Arc::new(AtomicBool::new(true));
      let cancel = CancellationToken::new();
      info!("psm {}: Receiving with {buffer_size} byte reads", io.psm());
      let task = tokio::spawn(receive_loop(
         io,
         buffer_size,
         running.clone(),
         cancel.clone(),
         hub,
         reporter,
         guard,
      ));

      // A loop that ended on its own is simply replaced.
      *active = Some(ReceiveLoop {
         running,
         buffer_size,
         cancel,
         task,
      });
      Ok(())
   }

   /// Stops the loop and waits for it to exit. A no-op when not running.
   pub async fn stop(&self) -> Result<()> {
      let Some(active) = self.active.lock().take() else {
         return Ok(());
      };

      active.running.store(false, Ordering::Release);
      active.cancel.cancel();
      let result = active.task.await;
      info!("Receive loop stopped");
      match result {
         Err(e) if e.is_panic() => Err(L2capError::ReceiverPanicked(e)),
         _ => Ok(()),
      }
   }
}

impl Drop for ReceivePump {
   fn drop(&mut self) {
      if let Some(active) = self.active.get_mut().take() {
         active.running.store(false, Ordering::Release);
         active.cancel.cancel();
      }
   }
}

async fn receive_loop<S>(
   io: ChannelIo<S>,
   buffer_size: usize,
   running: Arc<AtomicBool>,
   cancel: CancellationToken,
   hub: EventHub,
   reporter: StateReporter,
   _mode: ModeGuard,
) where
   S: AsyncRead + AsyncWrite + Send + Unpin,
{
   let psm = io.psm();
   let mut buf = vec![0u8; buffer_size];

   while running.load(Ordering::Acquire) && io.is_open() {
      let read = select! {
         biased;
         () = cancel.cancelled() => break,
         read = io.read_into(&mut buf) => read,
      };

      match read {
         Ok(0) => {
            warn!("psm {psm}: Channel closed by peer");
            reporter.transition(ConnectionState::Error);
            break;
         },
         Ok(n) => hub.publish_data(Chunk::from(&buf[..n])),
         Err(e) => {
            if cancel.is_cancelled() || !io.is_open() {
               debug!("psm {psm}: Channel closed under receive loop");
               break;
            }
            warn!("psm {psm}: Receive failed: {e}");
            reporter.transition(ConnectionState::Error);
            break;
         },
      }
   }

   running.store(false, Ordering::Release);
   debug!("psm {psm}: Receive loop exited");
}
