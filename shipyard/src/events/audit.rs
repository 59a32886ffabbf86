//! Structured log trail of lifecycle events

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::events::bus::{EventBus, EventHandler};
use crate::events::event::{Event, EventType};

/// Writes every event it receives to the platform log
#[derive(Debug, Default)]
pub struct EventLogger;

impl EventLogger {
    /// Subscribe one logger to every event type on `bus`
    pub fn attach(bus: &EventBus) {
        let logger: Arc<dyn EventHandler> = Arc::new(EventLogger);
        for event_type in EventType::ALL {
            bus.subscribe(event_type, Arc::clone(&logger));
        }
    }
}

#[async_trait]
impl EventHandler for EventLogger {
    async fn handle(&self, event: &Event) {
        let data = serde_json::Value::Object(event.data.clone());
        match event.event_type {
            EventType::DeployFailed | EventType::AppFailed | EventType::BackupFailed => warn!(
                event_type = %event.event_type,
                app_id = %event.app_id,
                data = %data,
                "{}",
                event.message
            ),
            _ => info!(
                event_type = %event.event_type,
                app_id = %event.app_id,
                data = %data,
                "{}",
                event.message
            ),
        }
    }

    fn name(&self) -> &str {
        "event-logger"
    }
}
