// Received message lifecycle (ack / nack / reject)

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ActionStateError;
use super::headers::{self, Headers, ORIGINAL_TAG_HEADER};

/// Identity of one client instance (broker connection or simulator handle)
pub type ConnectionId = String;

/// Terminal decision taken on a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Ack,
    Nack,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ack => "ack",
            Action::Nack => "nack",
            Action::Reject => "reject",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settles a delivered message with its queue
///
/// Implementations:
/// - broker client: forwards the settlement to the connection's event loop
/// - simulator: removes or requeues the message in its queue
pub trait Acknowledger: Send + Sync {
    fn settle(&self, action: Action) -> crate::Result<()>;
}

/// Right to settle a message, present only for work-queue deliveries
#[derive(Clone)]
pub struct AckCapability {
    /// Worker group name (the work queue's routable name)
    pub work_queue: String,
    /// Full queue identity, `source^filter^worker`
    pub queue_id: String,
    /// Instance that received the message
    pub origin: ConnectionId,
    pub acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for AckCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckCapability")
            .field("work_queue", &self.work_queue)
            .field("queue_id", &self.queue_id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// A message as handed to a listener or worker handler
#[derive(Debug)]
pub struct ReceivedMessage {
    content: Value,
    routing_key: String,
    headers: Headers,
    capability: Option<AckCapability>,
    action_taken: Mutex<Option<Action>>,
}

impl ReceivedMessage {
    /// Message without ack capability (listener delivery)
    pub fn listener(content: Value, routing_key: impl Into<String>, headers: Headers) -> Self {
        Self {
            content,
            routing_key: routing_key.into(),
            headers,
            capability: None,
            action_taken: Mutex::new(None),
        }
    }

    /// Message from a work queue; must be settled exactly once
    pub fn work(
        content: Value,
        routing_key: impl Into<String>,
        headers: Headers,
        capability: AckCapability,
    ) -> Self {
        Self {
            capability: Some(capability),
            ..Self::listener(content, routing_key, headers)
        }
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Deserialize the content into a typed payload
    pub fn content_as<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.content.clone())?)
    }

    /// Tag the message was originally published with
    ///
    /// A republished copy is routed by queue name, so the `Original-Tag`
    /// header wins over the routing key when present.
    pub fn tag(&self) -> &str {
        self.headers
            .get(ORIGINAL_TAG_HEADER)
            .and_then(Value::as_str)
            .unwrap_or(&self.routing_key)
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn republish_count(&self) -> u64 {
        headers::republish_count(&self.headers)
    }

    pub fn is_ackable(&self) -> bool {
        self.capability.is_some()
    }

    pub fn capability(&self) -> Option<&AckCapability> {
        self.capability.as_ref()
    }

    pub fn work_queue(&self) -> Option<&str> {
        self.capability.as_ref().map(|c| c.work_queue.as_str())
    }

    pub fn action_taken(&self) -> Option<Action> {
        *self.action_taken.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ack(&self) -> crate::Result<()> {
        self.act(Action::Ack)
    }

    /// Return the message to its queue for redelivery
    pub fn nack(&self) -> crate::Result<()> {
        self.act(Action::Nack)
    }

    /// Drop the message permanently
    pub fn reject(&self) -> crate::Result<()> {
        self.act(Action::Reject)
    }

    /// Capability to republish through the instance `connection`
    pub fn republishable_by(
        &self,
        connection: &str,
    ) -> Result<&AckCapability, ActionStateError> {
        let capability = self
            .capability
            .as_ref()
            .ok_or(ActionStateError::NotFromWorkQueue)?;
        if capability.origin != connection {
            return Err(ActionStateError::ForeignInstance);
        }
        if let Some(prior) = self.action_taken() {
            return Err(ActionStateError::AlreadyActed(prior));
        }
        Ok(capability)
    }

    fn act(&self, action: Action) -> crate::Result<()> {
        let capability = self
            .capability
            .as_ref()
            .ok_or(ActionStateError::NotActionable(action))?;

        // held across settle so two racing calls cannot both settle
        let mut taken = self
            .action_taken
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(prior) = *taken {
            return Err(ActionStateError::AlreadyActed(prior).into());
        }
        capability.acker.settle(action)?;
        *taken = Some(action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusError;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<Action>>,
        fail: bool,
    }

    impl Acknowledger for RecordingAcker {
        fn settle(&self, action: Action) -> crate::Result<()> {
            if self.fail {
                return Err(BusError::Defunct);
            }
            self.calls.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn work_message(acker: Arc<RecordingAcker>) -> ReceivedMessage {
        ReceivedMessage::work(
            json!({"n": 1}),
            "foo.success",
            Headers::new(),
            AckCapability {
                work_queue: "workers".to_string(),
                queue_id: "X^#^workers".to_string(),
                origin: "conn-1".to_string(),
                acker,
            },
        )
    }

    #[test]
    fn test_listener_message_is_not_actionable() {
        let msg = ReceivedMessage::listener(json!("hi"), "foo", Headers::new());
        assert!(!msg.is_ackable());
        assert_eq!(
            msg.ack().unwrap_err().to_string(),
            "This message is not ackable"
        );
        assert_eq!(
            msg.nack().unwrap_err().to_string(),
            "This message is not nackable"
        );
        assert_eq!(
            msg.reject().unwrap_err().to_string(),
            "This message is not rejectable"
        );
        assert_eq!(msg.action_taken(), None);
    }

    #[test]
    fn test_second_action_fails_naming_prior() {
        let acker = Arc::new(RecordingAcker::default());
        let msg = work_message(acker.clone());

        msg.ack().unwrap();
        assert_eq!(
            msg.nack().unwrap_err().to_string(),
            "This message was already acked"
        );
        assert_eq!(
            msg.ack().unwrap_err().to_string(),
            "This message was already acked"
        );
        assert_eq!(msg.action_taken(), Some(Action::Ack));
        assert_eq!(*acker.calls.lock().unwrap(), vec![Action::Ack]);
    }

    #[test]
    fn test_failed_settle_records_nothing() {
        let acker = Arc::new(RecordingAcker {
            fail: true,
            ..Default::default()
        });
        let msg = work_message(acker);

        assert_eq!(msg.reject(), Err(BusError::Defunct));
        assert_eq!(msg.action_taken(), None);
    }

    #[test]
    fn test_tag_prefers_original_tag_header() {
        let mut headers = Headers::new();
        headers.insert(ORIGINAL_TAG_HEADER.to_string(), json!("foo.success"));
        let msg = ReceivedMessage::listener(json!(null), "workers", headers);
        assert_eq!(msg.tag(), "foo.success");
        assert_eq!(msg.routing_key(), "workers");
    }

    #[test]
    fn test_republishable_by() {
        let acker = Arc::new(RecordingAcker::default());
        let msg = work_message(acker);
        assert!(msg.republishable_by("conn-1").is_ok());
        assert_eq!(
            msg.republishable_by("conn-2").unwrap_err(),
            ActionStateError::ForeignInstance
        );

        msg.nack().unwrap();
        assert_eq!(
            msg.republishable_by("conn-1").unwrap_err(),
            ActionStateError::AlreadyActed(Action::Nack)
        );

        let listener = ReceivedMessage::listener(json!(1), "foo", Headers::new());
        assert_eq!(
            listener.republishable_by("conn-1").unwrap_err(),
            ActionStateError::NotFromWorkQueue
        );
    }

    #[test]
    fn test_content_as() {
        #[derive(Deserialize)]
        struct Payload {
            n: u32,
        }
        let msg = work_message(Arc::new(RecordingAcker::default()));
        let payload: Payload = msg.content_as().unwrap();
        assert_eq!(payload.n, 1);
        assert!(matches!(
            msg.content_as::<String>(),
            Err(BusError::Serialization(_))
        ));
    }
}
