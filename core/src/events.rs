use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use crate::error::FailureReason;
use crate::progress::TransferProgress;
use crate::request::{RequestId, RequestState};

/// Notifications pushed to subscribers, in the order they happened for a
/// given request.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Queued {
        id: RequestId,
    },
    StateChanged {
        id: RequestId,
        state: RequestState,
        reason: Option<FailureReason>,
    },
    Progress {
        id: RequestId,
        progress: TransferProgress,
    },
}

impl DownloadEvent {
    pub fn id(&self) -> RequestId {
        match self {
            DownloadEvent::Queued { id }
            | DownloadEvent::StateChanged { id, .. }
            | DownloadEvent::Progress { id, .. } => *id,
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<DownloadEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Receiver<DownloadEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Delivers to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: DownloadEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn prunes_dropped_subscribers() {
        let bus = EventBus::default();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        let id = Uuid::from_u128(9);
        bus.publish(DownloadEvent::Queued { id });
        assert_eq!(kept.try_recv().unwrap().id(), id);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
