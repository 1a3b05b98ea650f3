//! Broadcast topics for connection-state changes and inbound channel data.
//!
//! The hub owns one bounded ring buffer per topic. Publishing never waits for
//! subscribers: once a topic's buffer is full the oldest events are dropped,
//! and a subscriber that fell behind skips ahead to the oldest event still
//! retained, logging how many it missed. Subscribers only observe events
//! published after they subscribed.

use std::sync::Arc;

use futures::stream::{self, Stream};
use log::warn;
use tokio::sync::broadcast::{
   self,
   error::{RecvError, TryRecvError},
};

use crate::bluetooth::connection::ConnectionState;

/// One inbound-data event: exactly the bytes returned by a single channel read.
pub type Chunk = Arc<[u8]>;

/// Process-wide publish point for both event topics.
///
/// This type is cheaply cloneable; clones publish to the same topics.
#[derive(Debug, Clone)]
pub struct EventHub {
   state_tx: broadcast::Sender<ConnectionState>,
   data_tx: broadcast::Sender<Chunk>,
}

impl EventHub {
   /// Creates a hub retaining up to `capacity` undelivered events per topic.
   pub fn new(capacity: usize) -> Self {
      let capacity = capacity.max(1);
      let (state_tx, _) = broadcast::channel(capacity);
      let (data_tx, _) = broadcast::channel(capacity);
      Self { state_tx, data_tx }
   }

   pub fn publish_state(&self, state: ConnectionState) {
      // No subscribers is not an error, the event is simply unobserved.
      let _ = self.state_tx.send(state);
   }

   pub fn publish_data(&self, chunk: Chunk) {
      let _ = self.data_tx.send(chunk);
   }

   pub fn subscribe_state(&self) -> Subscription<ConnectionState> {
      Subscription::new("connection-state", self.state_tx.subscribe())
   }

   pub fn subscribe_data(&self) -> Subscription<Chunk> {
      Subscription::new("inbound-data", self.data_tx.subscribe())
   }

   pub fn state_subscribers(&self) -> usize {
      self.state_tx.receiver_count()
   }

   pub fn data_subscribers(&self) -> usize {
      self.data_tx.receiver_count()
   }
}

/// A single subscriber's view of one topic. Dropping it detaches.
#[derive(Debug)]
pub struct Subscription<T> {
   topic: &'static str,
   rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
   const fn new(topic: &'static str, rx: broadcast::Receiver<T>) -> Self {
      Self { topic, rx }
   }

   /// Waits for the next event. Returns `None` once the hub is gone.
   pub async fn recv(&mut self) -> Option<T> {
      loop {
         match self.rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(missed)) => {
               warn!("{} subscriber lagged, dropped {missed} oldest events", self.topic);
            },
            Err(RecvError::Closed) => return None,
         }
      }
   }

   /// Returns the next already-published event, if any.
   pub fn try_recv(&mut self) -> Option<T> {
      loop {
         match self.rx.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Lagged(missed)) => {
               warn!("{} subscriber lagged, dropped {missed} oldest events", self.topic);
            },
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
         }
      }
   }

   pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
   where
      T: Send + 'static,
   {
      stream::unfold(self, |mut sub| async move {
         let event = sub.recv().await?;
         Some((event, sub))
      })
   }
}
