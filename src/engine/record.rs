//! Wire records pushed to subscribers.

use serde::{Deserialize, Serialize};

use crate::registry::DeviceId;
use crate::status::NormalizedStatus;

/// One device's consolidated state for one tick (or one control action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub printer_id: DeviceId,
    pub percentage: Option<i64>,
    pub percentage_changed: bool,
    pub tray_type: Option<String>,
    pub tray_type_changed: bool,
    pub status: NormalizedStatus,
}

/// Everything the server sends over a subscriber connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PrinterUpdate(BroadcastRecord),
}

impl From<BroadcastRecord> for ServerMessage {
    fn from(record: BroadcastRecord) -> Self {
        ServerMessage::PrinterUpdate(record)
    }
}
