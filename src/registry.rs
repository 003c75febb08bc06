use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::signaling::message::{NewProducerNotice, ServerMessage};

/// A registered session: where to deliver notifications, and which producers it owns.
#[derive(Debug)]
struct RegisteredPeer {
    notifier: mpsc::UnboundedSender<ServerMessage>,
    producer_ids: Vec<String>,
}

/// Registry holds every open peer session of one service instance. Each operation runs under a single lock, so
/// concurrent callers never observe a partially updated table.
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, RegisteredPeer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        session_id: String,
        notifier: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut peers = self.peers.lock().await;
        tracing::debug!("Session {} is registered", session_id);
        peers.insert(
            session_id,
            RegisteredPeer {
                notifier,
                producer_ids: vec![],
            },
        );
    }

    /// Removes the session. Returns false if it was not registered.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(session_id).is_some();
        if removed {
            tracing::debug!("Session {} is unregistered", session_id);
        }
        removed
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.peers.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Records the producer under its origin session and sends a `newProducer` notification to every other
    /// session. Returns the number of sessions notified. Nothing happens if the origin is no longer registered.
    pub async fn notify_new_producer(&self, origin_session_id: &str, producer_id: &str) -> usize {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(origin_session_id) {
            Some(origin) => origin.producer_ids.push(producer_id.to_owned()),
            None => {
                tracing::warn!(
                    "Session {} is not registered, producer {} is not announced",
                    origin_session_id,
                    producer_id
                );
                return 0;
            }
        }

        let mut notified = 0;
        for (id, peer) in peers.iter() {
            if id == origin_session_id {
                continue;
            }
            tracing::debug!(
                "Notifying session {} about producer {}",
                id,
                producer_id
            );
            let notice = NewProducerNotice {
                producer_id: producer_id.to_owned(),
                socket_id: origin_session_id.to_owned(),
            };
            match peer.notifier.send(ServerMessage::NewProducer(notice)) {
                Ok(()) => notified += 1,
                Err(err) => {
                    tracing::debug!("Failed to notify session {}: {}", id, err);
                }
            }
        }
        notified
    }

    /// Every producer owned by sessions other than `excluding_session_id`, taken at one point in time.
    pub async fn snapshot_other_producers(
        &self,
        excluding_session_id: &str,
    ) -> Vec<NewProducerNotice> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .filter(|(id, _)| id.as_str() != excluding_session_id)
            .flat_map(|(id, peer)| {
                peer.producer_ids.iter().map(move |producer_id| NewProducerNotice {
                    producer_id: producer_id.clone(),
                    socket_id: id.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notified_producers(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<String> {
        let mut ids = vec![];
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::NewProducer(notice) = message {
                ids.push(notice.producer_id);
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), tx).await;
        assert!(registry.contains("a").await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister("a").await);
        assert!(!registry.unregister("a").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_fan_out_skips_origin() {
        let registry = Registry::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, mut c_rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), a_tx).await;
        registry.register("b".to_owned(), b_tx).await;
        registry.register("c".to_owned(), c_tx).await;

        assert_eq!(registry.notify_new_producer("a", "p1").await, 2);

        assert!(notified_producers(&mut a_rx).is_empty());
        assert_eq!(notified_producers(&mut b_rx), vec!["p1".to_owned()]);
        assert_eq!(notified_producers(&mut c_rx), vec!["p1".to_owned()]);
    }

    #[tokio::test]
    async fn test_unregistered_session_is_not_targeted() {
        let registry = Registry::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), a_tx).await;
        registry.register("b".to_owned(), b_tx).await;
        registry.unregister("b").await;

        assert_eq!(registry.notify_new_producer("a", "p1").await, 0);
        assert!(notified_producers(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_origin_is_ignored() {
        let registry = Registry::new();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        registry.register("b".to_owned(), b_tx).await;

        assert_eq!(registry.notify_new_producer("gone", "p1").await, 0);
        assert!(notified_producers(&mut b_rx).is_empty());
        assert!(registry.snapshot_other_producers("b").await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_other_producers() {
        let registry = Registry::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), a_tx).await;
        registry.register("b".to_owned(), b_tx).await;
        registry.notify_new_producer("a", "p1").await;
        registry.notify_new_producer("a", "p2").await;
        registry.notify_new_producer("b", "p3").await;

        let mut snapshot: Vec<_> = registry
            .snapshot_other_producers("b")
            .await
            .into_iter()
            .map(|notice| (notice.producer_id, notice.socket_id))
            .collect();
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![
                ("p1".to_owned(), "a".to_owned()),
                ("p2".to_owned(), "a".to_owned())
            ]
        );

        registry.unregister("a").await;
        assert!(registry.snapshot_other_producers("b").await.is_empty());
    }
}
