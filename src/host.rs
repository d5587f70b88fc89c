//! Messages and capabilities supplied by the embedding host.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::algorithms::AlgorithmLibrary;

const HOST_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// Stored settings changed. `mode_id` limits the update to enhancers
    /// currently running that mode.
    SettingsUpdated { mode_id: Option<String> },
    OpenOptionsPage,
}

/// Broadcast channel between the host and every registry on the page.
#[derive(Debug, Clone)]
pub struct HostBus {
    sender: broadcast::Sender<HostMessage>,
}

impl HostBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HOST_BUS_CAPACITY);
        Self { sender }
    }

    /// Returns the number of subscribers that will see the message.
    pub fn publish(&self, message: HostMessage) -> usize {
        debug!(?message, "host message");
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostMessage> {
        self.sender.subscribe()
    }
}

impl Default for HostBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads the enhancement algorithm library on request.
#[async_trait]
pub trait LibraryProvider: Send + Sync {
    async fn load_library(&self) -> Result<AlgorithmLibrary>;
}

/// Serves the WGSL kernels compiled into this crate.
#[derive(Debug, Default)]
pub struct BuiltinLibraryProvider {
    requests: AtomicUsize,
}

impl BuiltinLibraryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LibraryProvider for BuiltinLibraryProvider {
    async fn load_library(&self) -> Result<AlgorithmLibrary> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(AlgorithmLibrary::builtin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let bus = HostBus::new();
        let mut receiver = bus.subscribe();
        let delivered = bus.publish(HostMessage::SettingsUpdated {
            mode_id: Some("builtin-mode-b".to_owned()),
        });
        assert_eq!(delivered, 1);
        assert_eq!(
            receiver.recv().await.expect("message"),
            HostMessage::SettingsUpdated {
                mode_id: Some("builtin-mode-b".to_owned())
            }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        assert_eq!(HostBus::new().publish(HostMessage::OpenOptionsPage), 0);
    }
}
