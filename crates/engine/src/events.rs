//! Graph-mutation event notifications.
//!
//! Every structural or status mutation broadcasts on the owning playbook's
//! channel so real-time observers (UIs, the execution runtime) can react.
//! Delivery is at-most-once: publish failures are logged and swallowed, and
//! a failed publish never rolls back the mutation that triggered it. The
//! notifier is optional; the engine runs fine without a broker.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::Status;

/// Event names observers subscribe on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybookEvent {
    NewStep,
    UpdatedStep,
    DeletedStep,
    StepStatus,
    PlaybookStatus,
    UpdatedPlaybook,
}

impl PlaybookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybookEvent::NewStep => "new_step",
            PlaybookEvent::UpdatedStep => "updated_step",
            PlaybookEvent::DeletedStep => "deleted_step",
            PlaybookEvent::StepStatus => "step_status",
            PlaybookEvent::PlaybookStatus => "playbook_status",
            PlaybookEvent::UpdatedPlaybook => "updated_playbook",
        }
    }
}

/// Wire payload published on a playbook channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,

    /// Subject of the event: the step id for step events, the playbook id
    /// for playbook events.
    pub id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Per-playbook channel name.
pub fn channel_for(playbook_id: Uuid) -> String {
    format!("playbook_stream_{playbook_id}")
}

#[derive(Clone)]
enum Sink {
    Nats(Arc<async_nats::Client>),
    Channel(mpsc::UnboundedSender<(Uuid, EventMessage)>),
}

/// Fire-and-forget event publisher.
#[derive(Clone, Default)]
pub struct EventNotifier {
    sink: Option<Sink>,
}

impl EventNotifier {
    /// Notifier backed by an existing NATS connection.
    pub fn new(client: Arc<async_nats::Client>) -> Self {
        Self {
            sink: Some(Sink::Nats(client)),
        }
    }

    /// Notifier that drops every event. Used when no broker is configured
    /// and by tests.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Notifier delivering events to an in-process channel, tagged with the
    /// owning playbook id. For embedders that observe events without a
    /// broker.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(Uuid, EventMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sink: Some(Sink::Channel(tx)),
            },
            rx,
        )
    }

    /// Connect to a NATS server and wrap the connection.
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EngineError::Nats(e.to_string()))?;
        tracing::info!(url = %url, "Connected to NATS");
        Ok(Self::new(Arc::new(client)))
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Publish an event on the playbook's channel. Never fails: broker
    /// errors are logged at warn and dropped.
    pub async fn publish(
        &self,
        playbook_id: Uuid,
        event: PlaybookEvent,
        subject_id: Uuid,
        status: Option<Status>,
    ) {
        let sink = match &self.sink {
            Some(sink) => sink,
            None => return,
        };

        let message = EventMessage {
            event: event.as_str().to_string(),
            id: subject_id,
            status: status.map(|s| s.as_str().to_string()),
        };

        match sink {
            Sink::Channel(tx) => {
                // A dropped receiver is equivalent to a lost publish.
                let _ = tx.send((playbook_id, message));
            }
            Sink::Nats(client) => {
                let payload = match serde_json::to_vec(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(event = event.as_str(), "Failed to serialize event: {e}");
                        return;
                    }
                };

                let channel = channel_for(playbook_id);
                match client.publish(channel.clone(), payload.into()).await {
                    Ok(()) => {
                        tracing::debug!(
                            channel = %channel,
                            event = event.as_str(),
                            subject_id = %subject_id,
                            "Published playbook event"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel,
                            event = event.as_str(),
                            "Publish failed: {e}"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        let id = Uuid::nil();
        assert_eq!(
            channel_for(id),
            "playbook_stream_00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_event_message_serialization() {
        let id = Uuid::new_v4();
        let message = EventMessage {
            event: PlaybookEvent::StepStatus.as_str().to_string(),
            id,
            status: Some(Status::Completed.as_str().to_string()),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("step_status"));
        assert!(json.contains("completed"));
        assert!(json.contains(&id.to_string()));

        let without_status = EventMessage {
            event: PlaybookEvent::NewStep.as_str().to_string(),
            id,
            status: None,
        };
        let json = serde_json::to_string(&without_status).unwrap();
        assert!(!json.contains("status"));
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_no_op() {
        let notifier = EventNotifier::disabled();
        assert!(!notifier.is_enabled());
        notifier
            .publish(Uuid::new_v4(), PlaybookEvent::NewStep, Uuid::new_v4(), None)
            .await;
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers_events() {
        let (notifier, mut events) = EventNotifier::channel();
        assert!(notifier.is_enabled());

        let playbook_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        notifier
            .publish(
                playbook_id,
                PlaybookEvent::StepStatus,
                step_id,
                Some(Status::Started),
            )
            .await;

        let (channel_id, message) = events.recv().await.unwrap();
        assert_eq!(channel_id, playbook_id);
        assert_eq!(message.event, "step_status");
        assert_eq!(message.id, step_id);
        assert_eq!(message.status.as_deref(), Some("started"));
    }
}
