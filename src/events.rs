//! Event types for PetalSonic

use crate::source::SourceId;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use uuid::Uuid;

/// Capacity of a device's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PetalSonicEvent {
    /// The mixer ran out of data for a source, or the device went away.
    SourceStopped {
        source_id: SourceId,
    },
    /// A queued buffer finished playing.
    BufferProcessed {
        source_id: SourceId,
        buffer_id: Uuid,
    },
    /// Admission control turned a play request down.
    SourceRefused {
        source_id: SourceId,
        active_sources: usize,
        max_sources: usize,
    },
    AdmissionLimitChanged {
        old_limit: usize,
        new_limit: usize,
    },
    DeviceDisconnected,
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
}

impl PetalSonicEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceStopped { source_id }
            | Self::BufferProcessed { source_id, .. }
            | Self::SourceRefused { source_id, .. } => Some(*source_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::DeviceDisconnected | Self::EngineError { .. })
    }

    pub fn is_source_event(&self) -> bool {
        self.source_id().is_some()
    }
}

/// Sending half used on the mix thread. Never blocks: when the channel is
/// full the event is dropped with a warning.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: Sender<PetalSonicEvent>,
}

impl EventSender {
    pub(crate) fn send(&self, event: PetalSonicEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("Event channel full, dropping {:?}", event);
            }
        }
    }
}

pub(crate) fn event_channel(capacity: usize) -> (EventSender, Receiver<PetalSonicEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_classify_events() {
        let id = SourceId::new(3);
        let stopped = PetalSonicEvent::SourceStopped { source_id: id };
        assert_eq!(stopped.source_id(), Some(id));
        assert!(stopped.is_source_event());
        assert!(!stopped.is_error());

        assert!(PetalSonicEvent::DeviceDisconnected.is_error());
        assert_eq!(PetalSonicEvent::EngineStarted.source_id(), None);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, rx) = event_channel(1);
        tx.send(PetalSonicEvent::EngineStarted);
        tx.send(PetalSonicEvent::EngineStopped);
        assert_eq!(rx.try_recv(), Ok(PetalSonicEvent::EngineStarted));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = event_channel(4);
        drop(rx);
        tx.send(PetalSonicEvent::DeviceDisconnected);
    }
}
