use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::model::WhisperModel;
use crate::task::{TaskId, TaskView};

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Server-to-client push events. Serialized as tagged JSON objects so
/// browser clients can switch on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    TaskUpdate(TaskView),
    DownloadProgress {
        task_id: TaskId,
        model_name: WhisperModel,
        /// -1 failed, 0..=99 in flight, 100 done.
        progress: i8,
        message: String,
    },
    Heartbeat {
        server_ts: u64,
    },
    /// Compaction notice: how many events were dropped from this
    /// subscriber's ring since its last delivery.
    EventsDropped {
        count: u64,
    },
}

impl BusEvent {
    pub fn heartbeat() -> Self {
        BusEvent::Heartbeat {
            server_ts: epoch_millis(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, BusEvent::Heartbeat { .. })
    }

    /// The task this event belongs to, when it belongs to one.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            BusEvent::TaskUpdate(view) => Some(view.id),
            BusEvent::DownloadProgress { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_carries_timestamp() {
        let event = BusEvent::heartbeat();
        assert!(event.is_heartbeat());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["server_ts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn download_progress_shape() {
        let event = BusEvent::DownloadProgress {
            task_id: TaskId::new(),
            model_name: WhisperModel::Base,
            progress: 42,
            message: "fetching".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "download_progress");
        assert_eq!(json["model_name"], "base");
        assert_eq!(json["progress"], 42);
    }
}
