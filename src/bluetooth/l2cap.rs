//! L2CAP connection-oriented channel ownership.
//!
//! [`ChannelEndpoint`] holds at most one open channel stream and hands out
//! [`ChannelIo`] handles for the request/response exchange and the receive
//! loop. Those two readers are kept apart by the channel's [`ModeLock`].

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   select,
   sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::error::{L2capError, Result};

/// Which reader currently owns the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelMode {
   Idle,
   Exchange,
   Receive,
}

/// Exchange-XOR-receive lock for one channel.
#[derive(Debug, Clone)]
pub struct ModeLock {
   mode: Arc<AtomicCell<ChannelMode>>,
}

impl ModeLock {
   fn new() -> Self {
      Self {
         mode: Arc::new(AtomicCell::new(ChannelMode::Idle)),
      }
   }

   pub fn current(&self) -> ChannelMode {
      self.mode.load()
   }

   /// Claims the channel for `mode`, failing with the mode that holds it.
   pub fn try_acquire(&self, mode: ChannelMode) -> std::result::Result<ModeGuard, ChannelMode> {
      debug_assert_ne!(mode, ChannelMode::Idle);
      self
         .mode
         .compare_exchange(ChannelMode::Idle, mode)
         .map(|_| ModeGuard {
            mode: self.mode.clone(),
         })
   }
}

/// Returns the channel to [`ChannelMode::Idle`] when dropped.
#[derive(Debug)]
pub struct ModeGuard {
   mode: Arc<AtomicCell<ChannelMode>>,
}

impl Drop for ModeGuard {
   fn drop(&mut self) {
      self.mode.store(ChannelMode::Idle);
   }
}

/// Largest SDU an L2CAP connection-oriented channel can carry.
pub const MAX_SDU_SIZE: usize = 65_535;

/// Shared access to an open channel stream.
///
/// This type is cheaply cloneable. Each channel has its own [`ModeLock`] and
/// close token; once the endpoint closes the channel every clone reports
/// itself closed and in-flight reads and writes return `ChannelNotOpen`.
pub struct ChannelIo<S> {
   psm: u16,
   link_epoch: u64,
   stream: Arc<Mutex<S>>,
   mode: ModeLock,
   closed: CancellationToken,
}

impl<S> Clone for ChannelIo<S> {
   fn clone(&self) -> Self {
      Self {
         psm: self.psm,
         link_epoch: self.link_epoch,
         stream: self.stream.clone(),
         mode: self.mode.clone(),
         closed: self.closed.clone(),
      }
   }
}

impl<S> ChannelIo<S>
where
   S: AsyncRead + AsyncWrite + Send + Unpin,
{
   fn new(psm: u16, link_epoch: u64, stream: S) -> Self {
      Self {
         psm,
         link_epoch,
         stream: Arc::new(Mutex::new(stream)),
         mode: ModeLock::new(),
         closed: CancellationToken::new(),
      }
   }

   pub const fn psm(&self) -> u16 {
      self.psm
   }

   pub fn is_open(&self) -> bool {
      !self.closed.is_cancelled()
   }

   /// Exchange-XOR-receive lock of this channel.
   pub const fn mode(&self) -> &ModeLock {
      &self.mode
   }

   /// Writes all of `data` and flushes it.
   pub async fn write(&self, data: &[u8]) -> Result<()> {
      if !self.is_open() {
         return Err(L2capError::ChannelNotOpen);
      }
      debug!("→ psm {}: {}", self.psm, hex::encode(data));
      let written = async {
         let mut stream = self.stream.lock().await;
         stream.write_all(data).await?;
         stream.flush().await
      };
      select! {
         biased;
         () = self.closed.cancelled() => Err(L2capError::ChannelNotOpen),
         written = written => written.map_err(L2capError::WriteFailed),
      }
   }

   /// Performs one read of up to `max_len` bytes. Empty at end of stream.
   pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
      let mut buf = vec![0u8; max_len];
      let n = self.read_into(&mut buf).await?;
      buf.truncate(n);
      Ok(buf)
   }

   pub(crate) async fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
      if !self.is_open() {
         return Err(L2capError::ChannelNotOpen);
      }
      let n = select! {
         biased;
         () = self.closed.cancelled() => return Err(L2capError::ChannelNotOpen),
         read = async { self.stream.lock().await.read(buf).await } => {
            read.map_err(L2capError::ReadFailed)?
         },
      };
      debug!("← psm {}: {}", self.psm, hex::encode(&buf[..n]));
      Ok(n)
   }

   /// Marks the channel closed and shuts the stream down.
   ///
   /// Cancelling the close token makes in-flight reads and writes drop their
   /// stream guard, so the lock below is released promptly.
   async fn shutdown(&self) {
      self.closed.cancel();
      if let Err(e) = self.stream.lock().await.shutdown().await {
         debug!("psm {}: Stream shutdown failed: {e}", self.psm);
      }
   }
}

/// Owner of the manager's single L2CAP channel.
pub struct ChannelEndpoint<S> {
   slot: Mutex<Option<ChannelIo<S>>>,
}

impl<S> Default for ChannelEndpoint<S> {
   fn default() -> Self {
      Self {
         slot: Mutex::new(None),
      }
   }
}

impl<S> ChannelEndpoint<S>
where
   S: AsyncRead + AsyncWrite + Send + Unpin,
{
   pub fn new() -> Self {
      Self::default()
   }

   /// Opens a channel on `psm` using the stream produced by `connect`.
   ///
   /// Fails with `AlreadyOpen` without polling `connect` if a channel is
   /// already open.
   pub async fn open<F>(&self, psm: u16, connect: F) -> Result<()>
   where
      F: Future<Output = Result<S>>,
   {
      self.open_on_link(psm, 0, connect).await
   }

   /// Like [`Self::open`], tagging the channel with the link epoch it was
   /// opened under.
   pub(crate) async fn open_on_link<F>(&self, psm: u16, link_epoch: u64, connect: F) -> Result<()>
   where
      F: Future<Output = Result<S>>,
   {
      let mut slot = self.slot.lock().await;
      if let Some(current) = slot.as_ref().filter(|io| io.is_open()) {
         return Err(L2capError::AlreadyOpen(current.psm()));
      }

      let stream = connect.await?;
      *slot = Some(ChannelIo::new(psm, link_epoch, stream));
      info!("L2CAP channel open on PSM {psm}");
      Ok(())
   }

   /// Closes the channel. A no-op when none is open.
   pub async fn close(&self) {
      let Some(io) = self.slot.lock().await.take() else {
         return;
      };
      io.shutdown().await;
      info!("L2CAP channel on PSM {} closed", io.psm());
   }

   /// Whether the open channel predates the link epoch `epoch`.
   pub(crate) async fn is_stale(&self, epoch: u64) -> bool {
      self
         .slot
         .lock()
         .await
         .as_ref()
         .is_some_and(|io| io.link_epoch < epoch)
   }

   /// Closes the channel only if it predates the link epoch `epoch`.
   pub(crate) async fn close_if_stale(&self, epoch: u64) -> bool {
      let stale = {
         let mut slot = self.slot.lock().await;
         if slot.as_ref().is_some_and(|io| io.link_epoch < epoch) {
            slot.take()
         } else {
            None
         }
      };
      let Some(io) = stale else {
         return false;
      };
      io.shutdown().await;
      info!("L2CAP channel on PSM {} closed with its link", io.psm());
      true
   }

   pub async fn is_open(&self) -> bool {
      self.slot.lock().await.as_ref().is_some_and(ChannelIo::is_open)
   }

   pub async fn psm(&self) -> Option<u16> {
      self.slot.lock().await.as_ref().map(ChannelIo::psm)
   }

   /// Handle to the open channel, or `ChannelNotOpen`.
   pub async fn io(&self) -> Result<ChannelIo<S>> {
      self
         .slot
         .lock()
         .await
         .as_ref()
         .filter(|io| io.is_open())
         .cloned()
         .ok_or(L2capError::ChannelNotOpen)
   }

   /// Mode of the open channel; `Idle` when none is open.
   pub async fn mode(&self) -> ChannelMode {
      self
         .slot
         .lock()
         .await
         .as_ref()
         .map_or(ChannelMode::Idle, |io| io.mode().current())
   }

   pub async fn write(&self, data: &[u8]) -> Result<()> {
      self.io().await?.write(data).await
   }

   pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
      self.io().await?.read(max_len).await
   }
}

#[cfg(test)]
mod tests {
   use std::io;

   use tokio::io::duplex;

   use super::*;

   async fn opened(psm: u16) -> (ChannelEndpoint<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
      let (local, remote) = duplex(1024);
      let endpoint = ChannelEndpoint::new();
      endpoint.open(psm, async { Ok(local) }).await.expect("open");
      (endpoint, remote)
   }

   #[test]
   fn test_mode_lock_is_exclusive() {
      let lock = ModeLock::new();
      let guard = lock.try_acquire(ChannelMode::Receive).expect("idle");

      assert_eq!(lock.try_acquire(ChannelMode::Exchange).unwrap_err(), ChannelMode::Receive);
      assert_eq!(lock.current(), ChannelMode::Receive);

      drop(guard);
      assert_eq!(lock.current(), ChannelMode::Idle);
      assert!(lock.try_acquire(ChannelMode::Exchange).is_ok());
   }

   #[tokio::test]
   async fn test_primitives_move_bytes_both_ways() {
      let (endpoint, mut remote) = opened(25).await;
      assert_eq!(endpoint.psm().await, Some(25));

      endpoint.write(b"hello").await.expect("write");
      let mut buf = [0u8; 5];
      remote.read_exact(&mut buf).await.expect("remote read");
      assert_eq!(&buf, b"hello");

      remote.write_all(b"world!").await.expect("remote write");
      assert_eq!(endpoint.read(64).await.expect("read"), b"world!");
   }

   #[tokio::test]
   async fn test_second_open_is_rejected() {
      let (endpoint, _remote) = opened(25).await;

      let mut polled = false;
      let err = endpoint
         .open(31, async {
            polled = true;
            Err(L2capError::NoResponse)
         })
         .await
         .unwrap_err();

      assert!(matches!(err, L2capError::AlreadyOpen(25)));
      assert!(!polled);
      assert_eq!(endpoint.psm().await, Some(25));
   }

   #[tokio::test]
   async fn test_failed_open_leaves_endpoint_closed() {
      let endpoint = ChannelEndpoint::<tokio::io::DuplexStream>::new();
      let err = endpoint
         .open(25, async {
            Err(L2capError::ConnectFailed(io::Error::from(
               io::ErrorKind::ConnectionRefused,
            )))
         })
         .await
         .unwrap_err();

      assert!(matches!(err, L2capError::ConnectFailed(_)));
      assert!(!endpoint.is_open().await);
   }

   #[tokio::test]
   async fn test_close_is_idempotent_and_invalidates_handles() {
      let (endpoint, mut remote) = opened(25).await;
      let io = endpoint.io().await.expect("io");

      endpoint.close().await;
      endpoint.close().await;

      assert!(!io.is_open());
      assert!(matches!(endpoint.io().await, Err(L2capError::ChannelNotOpen)));
      assert!(matches!(io.write(b"x").await, Err(L2capError::ChannelNotOpen)));

      let mut buf = [0u8; 4];
      assert_eq!(remote.read(&mut buf).await.expect("eof"), 0);
   }

   #[tokio::test]
   async fn test_read_reports_end_of_stream_as_empty() {
      let (endpoint, remote) = opened(25).await;
      drop(remote);
      assert!(endpoint.read(16).await.expect("read").is_empty());
   }

   #[tokio::test]
   async fn test_close_interrupts_blocked_read() {
      let (endpoint, _remote) = opened(25).await;
      let io = endpoint.io().await.expect("io");

      let (read, ()) = tokio::join!(io.read(16), async {
         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
         endpoint.close().await;
      });

      assert!(matches!(read, Err(L2capError::ChannelNotOpen)));
      assert!(!endpoint.is_open().await);
   }

   #[tokio::test]
   async fn test_reopened_channel_starts_idle() {
      let (endpoint, _remote) = opened(25).await;
      let stale = endpoint.io().await.expect("io");
      let _held = stale.mode().try_acquire(ChannelMode::Exchange).expect("idle");
      assert_eq!(endpoint.mode().await, ChannelMode::Exchange);

      endpoint.close().await;
      let (local, _remote) = duplex(1024);
      endpoint.open(31, async { Ok(local) }).await.expect("reopen");

      assert_eq!(endpoint.mode().await, ChannelMode::Idle);
      let fresh = endpoint.io().await.expect("io");
      assert!(fresh.mode().try_acquire(ChannelMode::Receive).is_ok());
   }

   #[tokio::test]
   async fn test_only_channels_from_earlier_links_are_stale() {
      let endpoint = ChannelEndpoint::new();
      let (local, _remote) = duplex(1024);
      endpoint
         .open_on_link(25, 2, async { Ok(local) })
         .await
         .expect("open");

      assert!(!endpoint.is_stale(2).await);
      assert!(!endpoint.close_if_stale(2).await);
      assert!(endpoint.is_open().await);

      assert!(endpoint.is_stale(3).await);
      assert!(endpoint.close_if_stale(3).await);
      assert!(!endpoint.is_open().await);
   }
}
