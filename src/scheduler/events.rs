//! Telemetry events: convoy lifecycle transitions and resource samples.
//!
//! Events go over an optional bounded mpsc channel via `try_send`; a full or
//! closed sink drops the event and never blocks the emitter. The scheduler
//! and the resource monitor can share one sender, so a single consumer sees
//! both execution progress and the measurements that drove it.

use tokio::sync::mpsc;

use crate::domain::{ConvoyProgress, ConvoyStatus, MemberStatus};
use crate::monitor::ResourceSnapshot;

/// Lifecycle event for one convoy run, or a resource measurement.
#[derive(Debug, Clone)]
pub enum ConvoyEvent {
    /// The resource monitor took a measurement.
    ResourceSampled { snapshot: ResourceSnapshot },
    /// Execution began.
    ConvoyStarted { convoy_id: String, total: usize },
    /// A member passed admission and its handler was dispatched.
    MemberStarted {
        convoy_id: String,
        handler_id: String,
        work_item_id: String,
    },
    /// A member reached a terminal state.
    MemberFinished {
        convoy_id: String,
        handler_id: String,
        work_item_id: String,
        status: MemberStatus,
        error: Option<String>,
    },
    /// The run reached its terminal status.
    ConvoyFinished {
        convoy_id: String,
        status: ConvoyStatus,
        progress: ConvoyProgress,
    },
}

/// Non-blocking wrapper around the optional telemetry sender.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<ConvoyEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<ConvoyEvent>>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: ConvoyEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                tracing::debug!(error = %e, "dropping telemetry event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(Some(tx));

        sink.emit(ConvoyEvent::ConvoyStarted {
            convoy_id: "cv-1".into(),
            total: 3,
        });

        match rx.recv().await {
            Some(ConvoyEvent::ConvoyStarted { convoy_id, total }) => {
                assert_eq!(convoy_id, "cv-1");
                assert_eq!(total, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_sink_is_noop() {
        let sink = EventSink::default();
        sink.emit(ConvoyEvent::ConvoyStarted {
            convoy_id: "cv-1".into(),
            total: 1,
        });
    }

    #[test]
    fn test_full_sink_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = EventSink::new(Some(tx));

        for _ in 0..10 {
            sink.emit(ConvoyEvent::ConvoyStarted {
                convoy_id: "cv-1".into(),
                total: 1,
            });
        }
    }
}
