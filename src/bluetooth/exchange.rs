//! One-shot request/response exchange over the open channel.

use std::time::Duration;

use log::{debug, warn};
use tokio::{
   io::{AsyncRead, AsyncWrite},
   time,
};

use crate::{
   bluetooth::l2cap::{ChannelEndpoint, ChannelMode, MAX_SDU_SIZE},
   error::{L2capError, Result},
};

/// Writes a request and reads back a single response chunk.
#[derive(Debug, Clone, Copy)]
pub struct RequestResponder {
   timeout: Option<Duration>,
   max_response_size: usize,
}

impl Default for RequestResponder {
   fn default() -> Self {
      Self::new(None, MAX_SDU_SIZE)
   }
}

impl RequestResponder {
   /// `timeout` bounds every exchange; `None` waits for as long as it takes.
   /// Responses larger than `max_response_size` cannot be requested.
   pub const fn new(timeout: Option<Duration>, max_response_size: usize) -> Self {
      Self {
         timeout,
         max_response_size,
      }
   }

   pub const fn timeout(&self) -> Option<Duration> {
      self.timeout
   }

   pub async fn exchange<S>(
      &self,
      channel: &ChannelEndpoint<S>,
      message: &[u8],
      response_buffer_size: usize,
   ) -> Result<Vec<u8>>
   where
      S: AsyncRead + AsyncWrite + Send + Unpin,
   {
      self
         .exchange_with_timeout(channel, message, response_buffer_size, self.timeout)
         .await
   }

   /// Sends `message` in full, then performs one read of up to
   /// `response_buffer_size` bytes and returns exactly what it produced.
   ///
   /// The channel stays claimed in [`ChannelMode::Exchange`] until the call
   /// returns. Stream failures close the channel; closing the channel
   /// meanwhile ends the call with `ChannelNotOpen`.
   pub async fn exchange_with_timeout<S>(
      &self,
      channel: &ChannelEndpoint<S>,
      message: &[u8],
      response_buffer_size: usize,
      timeout: Option<Duration>,
   ) -> Result<Vec<u8>>
   where
      S: AsyncRead + AsyncWrite + Send + Unpin,
   {
      let io = channel.io().await?;
      if response_buffer_size == 0 || response_buffer_size > self.max_response_size {
         return Err(L2capError::InvalidBufferSize(response_buffer_size));
      }
      let guard = io
         .mode()
         .try_acquire(ChannelMode::Exchange)
         .map_err(L2capError::ChannelBusy)?;

      let round_trip = async {
         io.write(message).await?;
         let response = io.read(response_buffer_size).await?;
         if response.is_empty() {
            return Err(L2capError::NoResponse);
         }
         Ok(response)
      };

      let result = match timeout {
         Some(limit) => time::timeout(limit, round_trip)
            .await
            .unwrap_or(Err(L2capError::RequestTimeout)),
         None => round_trip.await,
      };

      match &result {
         Ok(response) => debug!(
            "psm {}: Exchanged {} bytes for {} bytes",
            io.psm(),
            message.len(),
            response.len()
         ),
         Err(e) if e.is_fatal_io() => {
            warn!("psm {}: Exchange failed, closing channel: {e}", io.psm());
            drop(guard);
            channel.close().await;
         },
         Err(e) => debug!("psm {}: Exchange failed: {e}", io.psm()),
      }
      result
   }
}

#[cfg(test)]
mod tests {
   use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

   use super::*;

   async fn opened() -> (ChannelEndpoint<DuplexStream>, DuplexStream) {
      let (local, remote) = duplex(4096);
      let endpoint = ChannelEndpoint::new();
      endpoint.open(25, async { Ok(local) }).await.expect("open");
      (endpoint, remote)
   }

   fn spawn_echo(mut remote: DuplexStream, len: usize) -> tokio::task::JoinHandle<DuplexStream> {
      tokio::spawn(async move {
         let mut buf = vec![0u8; len];
         remote.read_exact(&mut buf).await.expect("request");
         remote.write_all(&buf).await.expect("response");
         remote
      })
   }

   #[tokio::test]
   async fn test_echo_round_trip_returns_message() {
      let (endpoint, remote) = opened().await;
      let message = b"\x01\x02\x03 request".to_vec();
      let echo = spawn_echo(remote, message.len());

      let response = RequestResponder::default()
         .exchange(&endpoint, &message, message.len())
         .await
         .expect("exchange");

      assert_eq!(response, message);
      assert_eq!(endpoint.mode().await, ChannelMode::Idle);
      echo.await.expect("echo task");
   }

   #[tokio::test]
   async fn test_response_is_truncated_to_bytes_read() {
      let (endpoint, mut remote) = opened().await;
      tokio::spawn(async move {
         let mut buf = [0u8; 4];
         remote.read_exact(&mut buf).await.expect("request");
         remote.write_all(b"ok").await.expect("response");
         remote
      });

      let response = RequestResponder::default()
         .exchange(&endpoint, b"ping", 1024)
         .await
         .expect("exchange");
      assert_eq!(response, b"ok");
   }

   #[tokio::test]
   async fn test_exchange_requires_open_channel() {
      let endpoint = ChannelEndpoint::<DuplexStream>::new();
      let responder = RequestResponder::default();
      assert!(matches!(
         responder.exchange(&endpoint, b"ping", 16).await,
         Err(L2capError::ChannelNotOpen)
      ));

      let (endpoint, _remote) = opened().await;
      endpoint.close().await;
      assert!(matches!(
         responder.exchange(&endpoint, b"ping", 16).await,
         Err(L2capError::ChannelNotOpen)
      ));
   }

   #[tokio::test]
   async fn test_peer_hangup_is_no_response_and_closes() {
      let (endpoint, mut remote) = opened().await;
      tokio::spawn(async move {
         let mut buf = [0u8; 4];
         remote.read_exact(&mut buf).await.expect("request");
      });

      let err = RequestResponder::default()
         .exchange(&endpoint, b"ping", 16)
         .await
         .unwrap_err();

      assert!(matches!(err, L2capError::NoResponse));
      assert!(!endpoint.is_open().await);
   }

   #[tokio::test]
   async fn test_exchange_rejected_while_receiving() {
      let (endpoint, _remote) = opened().await;
      let io = endpoint.io().await.expect("io");
      let _receiving = io.mode().try_acquire(ChannelMode::Receive).expect("idle");

      let err = RequestResponder::default()
         .exchange(&endpoint, b"ping", 16)
         .await
         .unwrap_err();
      assert!(matches!(err, L2capError::ChannelBusy(ChannelMode::Receive)));
   }

   #[tokio::test]
   async fn test_timeout_releases_mode_and_keeps_channel() {
      let (endpoint, _remote) = opened().await;
      let responder = RequestResponder::new(Some(Duration::from_millis(50)), MAX_SDU_SIZE);

      let err = responder.exchange(&endpoint, b"ping", 16).await.unwrap_err();

      assert!(matches!(err, L2capError::RequestTimeout));
      assert_eq!(endpoint.mode().await, ChannelMode::Idle);
      assert!(endpoint.is_open().await);
   }

   #[tokio::test]
   async fn test_zero_response_size_is_rejected() {
      let (endpoint, _remote) = opened().await;
      let err = RequestResponder::default()
         .exchange(&endpoint, b"ping", 0)
         .await
         .unwrap_err();
      assert!(matches!(err, L2capError::InvalidBufferSize(0)));
   }

   #[tokio::test]
   async fn test_oversized_response_is_rejected() {
      let (endpoint, _remote) = opened().await;
      let responder = RequestResponder::new(None, 64);

      let err = responder.exchange(&endpoint, b"ping", 65).await.unwrap_err();

      assert!(matches!(err, L2capError::InvalidBufferSize(65)));
      assert!(endpoint.is_open().await);
      assert_eq!(endpoint.mode().await, ChannelMode::Idle);
   }

   #[tokio::test]
   async fn test_size_is_checked_after_channel() {
      let endpoint = ChannelEndpoint::<DuplexStream>::new();
      let err = RequestResponder::default()
         .exchange(&endpoint, b"x", 0)
         .await
         .unwrap_err();
      assert!(matches!(err, L2capError::ChannelNotOpen));
   }

   #[tokio::test]
   async fn test_close_ends_blocked_exchange() {
      let (endpoint, mut remote) = opened().await;
      let responder = RequestResponder::default();

      let (result, ()) = tokio::join!(
         time::timeout(Duration::from_secs(2), responder.exchange(&endpoint, b"ping", 16)),
         async {
            let mut buf = [0u8; 4];
            remote.read_exact(&mut buf).await.expect("request");
            endpoint.close().await;
         }
      );

      let result = result.expect("exchange ends after close");
      assert!(matches!(result, Err(L2capError::ChannelNotOpen)));

      let (local, _remote) = duplex(4096);
      endpoint.open(31, async { Ok(local) }).await.expect("reopen");
      assert_eq!(endpoint.mode().await, ChannelMode::Idle);
      let io = endpoint.io().await.expect("io");
      assert!(io.mode().try_acquire(ChannelMode::Receive).is_ok());
   }
}
