//! Background subscriber that mirrors bus traffic into the tracing log.

use tokio::sync::broadcast;

use crate::bus::PlatformEvent;

pub struct EventLogger;

impl EventLogger {
    /// Log events until the bus is dropped.
    ///
    /// Intended to be spawned with `tokio::spawn`. Lagging is logged and
    /// otherwise ignored.
    pub async fn run(mut rx: broadcast::Receiver<PlatformEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    tracing::info!(
                        event_type = %event.event_type,
                        instance_id = event.instance_id,
                        job_id = event.job_id,
                        actor_user_id = event.actor_user_id,
                        payload = %event.payload,
                        "Platform event",
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("Event logger stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::{event_types, EventBus};

    #[tokio::test]
    async fn stops_when_bus_is_dropped() {
        let bus = EventBus::default();
        let handle = tokio::spawn(EventLogger::run(bus.subscribe()));
        bus.publish(PlatformEvent::new(event_types::JOB_REGISTERED, 1));
        drop(bus);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("logger exits once the sender is gone")
            .expect("logger task does not panic");
    }
}
