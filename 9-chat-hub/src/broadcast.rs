use std::sync::Arc;

use tracing::{debug, warn};

use crate::{message::ServerEvent, registry::ConnectionRegistry};

/// Fans events out to every registered peer, pruning the ones that fail.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Never fails: delivery errors are logged and the failing peer is
    /// unregistered and closed. Returns how many peers accepted the event.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let frame: Arc<str> = match event.encode() {
            Ok(encoded) => Arc::from(encoded),
            Err(error) => {
                warn!(?error, ?event, "failed to encode broadcast event");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.registry.snapshot() {
            match peer.deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(conn = %peer.id(), %error, "dropping peer after failed delivery");
                    self.registry.unregister(peer.id());
                    peer.close();
                }
            }
        }

        debug!(delivered, "broadcast event");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SystemEvent;

    fn chat(text: &str) -> ServerEvent {
        ServerEvent::Chat {
            user: "alice".into(),
            text: text.into(),
        }
    }

    fn received(link: &mut crate::registry::PeerLink) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = link.outbox.try_recv() {
            events.push(ServerEvent::decode(&frame).expect("valid frame"));
        }
        events
    }

    #[test]
    fn every_peer_gets_one_copy_in_call_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut links: Vec<_> = (0..5).map(|_| registry.open(16)).collect();
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        assert_eq!(broadcaster.broadcast(&chat("first")), 5);
        assert_eq!(broadcaster.broadcast(&chat("second")), 5);

        for link in &mut links {
            assert_eq!(received(link), vec![chat("first"), chat("second")]);
        }
    }

    #[test]
    fn failed_peer_is_pruned_without_affecting_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut alice = registry.open(16);
        let dead = registry.open(16);
        let mut bob = registry.open(16);
        let dead_id = dead.id;
        let dead_closed = dead.closed.clone();
        drop(dead);

        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let event = ServerEvent::from(SystemEvent::PdfCreating {
            title: "Report".into(),
        });

        assert_eq!(broadcaster.broadcast(&event), 2);
        assert!(!registry.contains(dead_id));
        assert!(dead_closed.is_cancelled());
        assert_eq!(registry.len(), 2);
        assert_eq!(received(&mut alice), vec![event.clone()]);
        assert_eq!(received(&mut bob), vec![event]);
    }

    #[test]
    fn slow_peer_is_dropped_once_its_queue_fills() {
        let registry = Arc::new(ConnectionRegistry::new());
        let slow = registry.open(1);
        let mut fast = registry.open(16);
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        broadcaster.broadcast(&chat("one"));
        broadcaster.broadcast(&chat("two"));
        broadcaster.broadcast(&chat("three"));

        assert!(!registry.contains(slow.id));
        assert!(slow.closed.is_cancelled());
        assert_eq!(
            received(&mut fast),
            vec![chat("one"), chat("two"), chat("three")]
        );
    }
}
