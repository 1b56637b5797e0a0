// [[MISSION]]/apps/kernel-server/src/hub.rs
// Purpose: Fan-out of kernel events to connected observers, globally or per project.
// Architecture: Notification Layer
// Dependencies: DashMap, tokio mpsc, Serde

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::error::{KernelError, KernelResult};
use crate::events::{EventEnvelope, KernelEvent};

pub type ObserverId = Uuid;

/// Messages an observer may have queued before it counts as unreachable.
pub const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Sending half of one observer's outbound queue. Messages are serialized
/// JSON, delivered in the order they were queued.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    pub id: ObserverId,
    tx: mpsc::Sender<String>,
}

impl ObserverHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { id: Uuid::new_v4(), tx }
    }

    /// A handle plus the receiver the transport drains.
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        Self::with_capacity(OBSERVER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// False when the transport is gone or has stopped draining its queue.
    fn send(&self, message: &str) -> bool {
        match self.tx.try_send(message.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Observer {} queue is full", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct Observer {
    handle: ObserverHandle,
    connected_at: DateTime<Utc>,
    subscriptions: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub project_subscriptions: usize,
    pub subscriptions_detail: BTreeMap<String, usize>,
}

#[derive(Default)]
pub struct NotificationHub {
    observers: DashMap<ObserverId, Observer>,
    project_subscriptions: DashMap<String, HashSet<ObserverId>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handle: ObserverHandle) -> ObserverId {
        let id = handle.id;
        self.observers.insert(
            id,
            Observer {
                handle,
                connected_at: Utc::now(),
                subscriptions: HashSet::new(),
            },
        );

        self.send_to(
            id,
            KernelEvent::ConnectionEstablished {
                message: "Connected to mission kernel real-time system".to_string(),
            },
        );
        tracing::info!("Observer {} connected. Total: {}", id, self.observers.len());
        id
    }

    /// Drops the observer and every project membership it held.
    pub fn unsubscribe(&self, id: ObserverId) {
        let removed = match self.observers.remove(&id) {
            Some((_, observer)) => observer,
            None => return,
        };

        for project_id in &removed.subscriptions {
            if let Some(mut members) = self.project_subscriptions.get_mut(project_id) {
                members.remove(&id);
            }
            self.project_subscriptions
                .remove_if(project_id, |_, members| members.is_empty());
        }

        let lifetime = Utc::now() - removed.connected_at;
        tracing::info!(
            "Observer {} disconnected after {}s. Remaining: {}",
            id,
            lifetime.num_seconds(),
            self.observers.len()
        );
    }

    pub fn subscribe_to_project(&self, id: ObserverId, project_id: &str) -> KernelResult<()> {
        {
            // Held across both inserts so a concurrent `unsubscribe` sees the
            // membership it has to undo.
            let mut observer = self
                .observers
                .get_mut(&id)
                .ok_or_else(|| KernelError::NotFound(format!("observer not connected: {}", id)))?;
            observer.subscriptions.insert(project_id.to_string());
            self.project_subscriptions
                .entry(project_id.to_string())
                .or_default()
                .insert(id);
        }

        self.send_to(
            id,
            KernelEvent::SubscriptionConfirmed {
                project_id: project_id.to_string(),
                message: format!("Subscribed to project {} updates", project_id),
            },
        );
        tracing::debug!("Observer {} subscribed to project {}", id, project_id);
        Ok(())
    }

    pub fn unsubscribe_from_project(&self, id: ObserverId, project_id: &str) -> KernelResult<()> {
        {
            let mut observer = self
                .observers
                .get_mut(&id)
                .ok_or_else(|| KernelError::NotFound(format!("observer not connected: {}", id)))?;
            observer.subscriptions.remove(project_id);
        }
        if let Some(mut members) = self.project_subscriptions.get_mut(project_id) {
            members.remove(&id);
        }
        self.project_subscriptions
            .remove_if(project_id, |_, members| members.is_empty());

        self.send_to(
            id,
            KernelEvent::SubscriptionRemoved {
                project_id: project_id.to_string(),
                message: format!("Unsubscribed from project {} updates", project_id),
            },
        );
        Ok(())
    }

    /// Delivers to one observer. A failed send disconnects it.
    pub fn send_to(&self, id: ObserverId, event: KernelEvent) -> bool {
        let message = match encode(event) {
            Some(m) => m,
            None => return false,
        };
        let handle = match self.observers.get(&id) {
            Some(observer) => observer.handle.clone(),
            None => return false,
        };

        if handle.send(&message) {
            true
        } else {
            tracing::warn!("Failed to send personal message to {}", id);
            self.unsubscribe(id);
            false
        }
    }

    /// Delivers to every observer. Returns how many received it.
    pub fn broadcast(&self, event: KernelEvent) -> usize {
        let name = event.name();
        let message = match encode(event) {
            Some(m) => m,
            None => return 0,
        };
        let recipients: Vec<ObserverHandle> =
            self.observers.iter().map(|o| o.handle.clone()).collect();

        let delivered = self.deliver(&recipients, &message);
        tracing::debug!("Broadcast {} sent to {} observers", name, delivered);
        delivered
    }

    /// Delivers to the observers subscribed to one project.
    pub fn broadcast_to_project(&self, project_id: &str, event: KernelEvent) -> usize {
        let name = event.name();
        let members: Vec<ObserverId> = match self.project_subscriptions.get(project_id) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        let message = match encode(event) {
            Some(m) => m,
            None => return 0,
        };
        let recipients: Vec<ObserverHandle> = members
            .iter()
            .filter_map(|id| self.observers.get(id).map(|o| o.handle.clone()))
            .collect();

        let delivered = self.deliver(&recipients, &message);
        tracing::debug!("Project {} {} sent to {} subscribers", project_id, name, delivered);
        delivered
    }

    fn deliver(&self, recipients: &[ObserverHandle], message: &str) -> usize {
        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for handle in recipients {
            if handle.send(message) {
                delivered += 1;
            } else {
                disconnected.push(handle.id);
            }
        }

        for id in disconnected {
            tracing::warn!("Dropping unreachable observer {}", id);
            self.unsubscribe(id);
        }
        delivered
    }

    /// Forgets every observer. Their queues close once drained.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<ObserverId> = self.observers.iter().map(|o| *o.key()).collect();
        for id in &ids {
            self.unsubscribe(*id);
        }
        tracing::info!("All observer connections closed: {}", ids.len());
        ids.len()
    }

    pub fn is_connected(&self, id: ObserverId) -> bool {
        self.observers.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.observers.len()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let subscriptions_detail: BTreeMap<String, usize> = self
            .project_subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();

        ConnectionStats {
            total_connections: self.observers.len(),
            project_subscriptions: subscriptions_detail.len(),
            subscriptions_detail,
        }
    }
}

fn encode(event: KernelEvent) -> Option<String> {
    match serde_json::to_string(&EventEnvelope::new(event)) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::error!("Failed to serialize event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<KernelEvent> {
        let mut events = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let envelope: EventEnvelope = serde_json::from_str(&raw).unwrap();
            events.push(envelope.event);
        }
        events
    }

    fn stopped(project: &str) -> KernelEvent {
        KernelEvent::WorkflowStopped { project_id: project.into() }
    }

    #[test]
    fn test_subscribe_sends_welcome() {
        let hub = NotificationHub::new();
        let (handle, mut rx) = ObserverHandle::channel();
        let id = hub.subscribe(handle);

        assert!(hub.is_connected(id));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "connection_established");
    }

    #[test]
    fn test_project_broadcast_reaches_only_members() {
        let hub = NotificationHub::new();
        let (a, mut rx_a) = ObserverHandle::channel();
        let (b, mut rx_b) = ObserverHandle::channel();
        let a = hub.subscribe(a);
        hub.subscribe(b);
        hub.subscribe_to_project(a, "p1").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(hub.broadcast_to_project("p1", stopped("p1")), 1);
        assert_eq!(hub.broadcast_to_project("p2", stopped("p2")), 0);

        assert_eq!(drain(&mut rx_a), vec![stopped("p1")]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_subscription_confirmations() {
        let hub = NotificationHub::new();
        let (handle, mut rx) = ObserverHandle::channel();
        let id = hub.subscribe(handle);
        hub.subscribe_to_project(id, "p1").unwrap();
        hub.unsubscribe_from_project(id, "p1").unwrap();

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["connection_established", "subscription_confirmed", "subscription_removed"]
        );
        assert_eq!(hub.connection_stats().project_subscriptions, 0);
    }

    #[test]
    fn test_unknown_observer_cannot_subscribe() {
        let hub = NotificationHub::new();
        let err = hub.subscribe_to_project(Uuid::new_v4(), "p1").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_failed_delivery_removes_observer_everywhere() {
        let hub = NotificationHub::new();
        let (alive, mut rx_alive) = ObserverHandle::channel();
        let (dead, rx_dead) = ObserverHandle::channel();
        let alive = hub.subscribe(alive);
        let dead = hub.subscribe(dead);
        hub.subscribe_to_project(alive, "p1").unwrap();
        hub.subscribe_to_project(dead, "p1").unwrap();
        drop(rx_dead);
        drain(&mut rx_alive);

        assert_eq!(hub.broadcast(stopped("p1")), 1);
        assert!(!hub.is_connected(dead));
        assert!(hub.is_connected(alive));
        assert_eq!(hub.connection_stats().subscriptions_detail["p1"], 1);
        assert_eq!(drain(&mut rx_alive), vec![stopped("p1")]);
    }

    #[test]
    fn test_stalled_observer_is_dropped_when_queue_fills() {
        let hub = NotificationHub::new();
        let (stalled, _rx_stalled) = ObserverHandle::with_capacity(2);
        let (reader, mut rx_reader) = ObserverHandle::channel();
        let stalled = hub.subscribe(stalled);
        hub.subscribe(reader);
        drain(&mut rx_reader);

        // The welcome message already holds one slot.
        assert_eq!(hub.broadcast(stopped("p1")), 2);
        assert!(hub.is_connected(stalled));
        assert_eq!(hub.broadcast(stopped("p2")), 1);
        assert!(!hub.is_connected(stalled));
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(drain(&mut rx_reader), vec![stopped("p1"), stopped("p2")]);
    }

    #[test]
    fn test_subscribe_racing_disconnect_leaves_no_member() {
        let hub = NotificationHub::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..200 {
            let (handle, rx) = ObserverHandle::channel();
            ids.push(hub.subscribe(handle));
            receivers.push(rx);
        }

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for id in &ids {
                    let _ = hub.subscribe_to_project(*id, "p1");
                }
            });
            scope.spawn(|| {
                for id in ids.iter().rev() {
                    hub.unsubscribe(*id);
                }
            });
        });

        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connection_stats().subscriptions_detail.is_empty());
        assert_eq!(hub.broadcast_to_project("p1", stopped("p1")), 0);
    }

    #[test]
    fn test_delivery_preserves_emission_order() {
        let hub = NotificationHub::new();
        let (handle, mut rx) = ObserverHandle::channel();
        let id = hub.subscribe(handle);
        hub.subscribe_to_project(id, "p1").unwrap();
        drain(&mut rx);

        for progress in [0u8, 10, 20] {
            hub.broadcast_to_project(
                "p1",
                KernelEvent::StepProgress {
                    project_id: "p1".into(),
                    step_index: 0,
                    progress,
                    agents: vec![],
                },
            );
        }
        hub.broadcast(stopped("p1"));

        let seen: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|e| match e {
                KernelEvent::StepProgress { progress, .. } => progress.to_string(),
                other => other.name().to_string(),
            })
            .collect();
        assert_eq!(seen, vec!["0", "10", "20", "workflow_stopped"]);
    }

    #[test]
    fn test_disconnect_all_closes_queues() {
        let hub = NotificationHub::new();
        let (handle, mut rx) = ObserverHandle::channel();
        let id = hub.subscribe(handle);
        hub.subscribe_to_project(id, "p1").unwrap();

        assert_eq!(hub.disconnect_all(), 1);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connection_stats().subscriptions_detail.is_empty());

        drain(&mut rx);
        assert!(rx.try_recv().is_err());
    }
}
