//! In-process publish/subscribe bus standing in for same-origin tab
//! messaging.
//!
//! Every provider sharing a [`CrossTabBus`] behaves like a browser tab of the
//! same origin: frames published on a channel reach every other subscriber
//! of that channel without touching the network. The bus is an owned value;
//! hand the same `Arc<CrossTabBus>` to each provider that should see the
//! others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lock;

const CHANNEL_CAPACITY: usize = 256;

/// A frame published on the bus, tagged with its publisher.
#[derive(Debug, Clone)]
pub struct CrossTabMessage {
    pub sender: Uuid,
    pub data: Arc<Vec<u8>>,
}

/// Channel-name keyed fan-out.
#[derive(Default)]
pub struct CrossTabBus {
    channels: Mutex<HashMap<String, broadcast::Sender<CrossTabMessage>>>,
}

impl CrossTabBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `channel`, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<CrossTabMessage> {
        let mut channels = lock(&self.channels);
        match channels.get(channel) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                channels.insert(channel.to_string(), tx);
                rx
            }
        }
    }

    /// Publish `data` to every current subscriber of `channel`, the
    /// publisher's own subscription included. Returns how many receivers
    /// were reached.
    pub fn publish(&self, channel: &str, sender: Uuid, data: Vec<u8>) -> usize {
        let mut channels = lock(&self.channels);
        let Some(tx) = channels.get(channel) else {
            return 0;
        };
        let message = CrossTabMessage {
            sender,
            data: Arc::new(data),
        };
        match tx.send(message) {
            Ok(n) => n,
            Err(_) => {
                // last receiver went away
                channels.remove(channel);
                0
            }
        }
    }

    /// Live subscribers of `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }
}
