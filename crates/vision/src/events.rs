//! Configuration-changed notifications.
//!
//! The pipeline manager publishes a [`ConfigEvent`] after every change that a UI or settings
//! store would need to mirror. Subscribers each get their own bounded channel; a full channel
//! drops the event for that subscriber only, and disconnected subscribers are pruned on the next
//! publish.

use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::debug;
use video_ingest::CameraCalibration;

use crate::settings::PipelineSettings;

/// Events buffered per subscriber before new ones are dropped.
pub const SUBSCRIBER_CAPACITY: usize = 32;

/// Full view of the pipeline list after a change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub current_index: i32,
    pub driver_mode: bool,
    pub nicknames: Vec<String>,
    pub pipelines: Vec<PipelineSettings>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ConfigEvent {
    FullSettings(Box<ConfigSnapshot>),
    CalibrationComplete(CameraCalibration),
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ConfigEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ConfigEvent> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ConfigEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::counter!("vision_config_events_dropped_total").increment(1);
                debug!("config subscriber is full; dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<ConfigEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
