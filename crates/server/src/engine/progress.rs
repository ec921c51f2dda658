//! Per-vault progress publish/subscribe.
//!
//! Delivery is best effort: a subscriber that falls behind the channel
//! capacity skips to the newest events, and nothing is buffered for vaults
//! without subscribers.

use dashmap::DashMap;
use pinfold_core::{ProgressEvent, VaultKey};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
pub struct ProgressHub {
    channels: DashMap<VaultKey, broadcast::Sender<ProgressEvent>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &VaultKey) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(*key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to current subscribers of `key`. Returns how many received it.
    pub fn publish(&self, key: &VaultKey, event: ProgressEvent) -> usize {
        let delivered = match self.channels.get(key) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => return 0,
        };
        if delivered == 0 {
            // Everyone unsubscribed since the last event.
            self.channels
                .remove_if(key, |_, sender| sender.receiver_count() == 0);
        }
        delivered
    }

    /// Drop the channel for `key`. Its subscribers see the stream end.
    pub fn close(&self, key: &VaultKey) -> bool {
        self.channels.remove(key).is_some()
    }

    pub fn subscriber_count(&self, key: &VaultKey) -> usize {
        self.channels
            .get(key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of vaults with a live channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
