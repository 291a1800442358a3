//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fan-out of fresh snapshots to display subscribers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;
use smelt_common::{ArcSnapshot, BatchStatus, FeedingRecord, SensorSnapshot, StatusSnapshot};
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_BRIDGE_CAPACITY: usize = 256;

/// Something a display subscriber may want to redraw.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    Arc(ArcSnapshot),
    Sensor(SensorSnapshot),
    Status(StatusSnapshot),
    /// PLC link went up (`true`) or down.
    Connection(bool),
    Feeding {
        batch_code: String,
        record: FeedingRecord,
    },
    Batch(BatchStatus),
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::Arc(_) => "arc",
            BridgeEvent::Sensor(_) => "sensor",
            BridgeEvent::Status(_) => "status",
            BridgeEvent::Connection(_) => "connection",
            BridgeEvent::Feeding { .. } => "feeding",
            BridgeEvent::Batch(_) => "batch",
        }
    }
}

/// Thread-safe publisher between the polling loops and any number of
/// subscribers. Slow subscribers lag and skip events; publishers never wait.
#[derive(Debug, Clone)]
pub struct DataBridge {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for DataBridge {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_CAPACITY)
    }
}

impl DataBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(kind, "no bridge subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_every_subscriber() {
        let bridge = DataBridge::new(4);
        assert_eq!(bridge.publish(BridgeEvent::Connection(true)), 0);

        let mut first = bridge.subscribe();
        let mut second = bridge.subscribe();
        assert_eq!(bridge.publish(BridgeEvent::Connection(false)), 2);
        assert_eq!(first.recv().await.unwrap(), BridgeEvent::Connection(false));
        assert_eq!(second.recv().await.unwrap().kind(), "connection");
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let json = serde_json::to_value(BridgeEvent::Connection(true)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "connection", "data": true}));
    }
}
