//! # Messages exchanged between master, agent, app workers and parent.
//!
//! Wire format is one JSON object per message:
//!
//! ```text
//! { "action": "egg-pids", "data": [4242], "to": "app", "from": "master",
//!   "receiverPid": "4250", "senderWorkerId": "4242" }
//! ```
//!
//! A bare JSON string is accepted on input and normalized to
//! `{ "action": s, "data": s }`. `receiverPid` and `senderWorkerId` accept numbers
//! and strings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::mode::Role;

/// Logical message endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// The supervising process itself.
    Master,
    /// The single agent worker.
    Agent,
    /// Every app worker (or the one named by `receiverPid`).
    App,
    /// Whoever launched the master, when connected.
    Parent,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Master => "master",
            Endpoint::Agent => "agent",
            Endpoint::App => "app",
            Endpoint::Parent => "parent",
        }
    }

    /// Destination used when a message from `self` carries none.
    pub fn default_route(&self) -> Option<Endpoint> {
        match self {
            Endpoint::Agent => Some(Endpoint::App),
            Endpoint::App => Some(Endpoint::Agent),
            Endpoint::Parent => Some(Endpoint::Master),
            Endpoint::Master => None,
        }
    }
}

impl From<Role> for Endpoint {
    fn from(role: Role) -> Self {
        match role {
            Role::Agent => Endpoint::Agent,
            Role::App => Endpoint::App,
        }
    }
}

/// One routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "WireMessage")]
pub struct Message {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_worker_id: Option<String>,
}

impl Message {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: None,
            to: None,
            from: None,
            receiver_pid: None,
            sender_worker_id: None,
        }
    }

    #[inline]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[inline]
    pub fn with_to(mut self, to: Endpoint) -> Self {
        self.to = Some(to);
        self
    }

    #[inline]
    pub fn with_from(mut self, from: Endpoint) -> Self {
        self.from = Some(from);
        self
    }

    #[inline]
    pub fn with_receiver_pid(mut self, pid: impl ToString) -> Self {
        self.receiver_pid = Some(pid.to_string());
        self
    }

    /// Decodes `data` into `T`; `None` when absent or of another shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).ok()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Action(String),
    Object(WireObject),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    action: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    to: Option<Endpoint>,
    #[serde(default)]
    from: Option<Endpoint>,
    #[serde(default, deserialize_with = "id_string")]
    receiver_pid: Option<String>,
    #[serde(default, deserialize_with = "id_string")]
    sender_worker_id: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Action(action) => Message::new(action.clone()).with_data(Value::String(action)),
            WireMessage::Object(obj) => Message {
                action: obj.action,
                data: obj.data,
                to: obj.to,
                from: obj.from,
                receiver_pid: obj.receiver_pid,
                sender_worker_id: obj.sender_worker_id,
            },
        }
    }
}

fn id_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(u64),
        Text(String),
    }
    Ok(Option::<Id>::deserialize(de)?.map(|id| match id {
        Id::Number(n) => n.to_string(),
        Id::Text(s) => s,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_string_message_is_normalized() {
        let msg: Message = serde_json::from_str(r#""reload-worker""#).unwrap();
        assert_eq!(msg.action, "reload-worker");
        assert_eq!(msg.data, Some(json!("reload-worker")));
        assert_eq!(msg.to, None);
    }

    #[test]
    fn test_numeric_receiver_pid_is_accepted() {
        let msg: Message =
            serde_json::from_str(r#"{"action":"ping","to":"app","receiverPid":4250}"#).unwrap();
        assert_eq!(msg.receiver_pid.as_deref(), Some("4250"));
        assert_eq!(msg.to, Some(Endpoint::App));
    }

    #[test]
    fn test_encoding_skips_unset_fields() {
        let msg = Message::new("agent-start").with_to(Endpoint::Master);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "action": "agent-start", "to": "master" })
        );
    }

    #[test]
    fn test_default_routes() {
        assert_eq!(Endpoint::Agent.default_route(), Some(Endpoint::App));
        assert_eq!(Endpoint::App.default_route(), Some(Endpoint::Agent));
        assert_eq!(Endpoint::Parent.default_route(), Some(Endpoint::Master));
        assert_eq!(Endpoint::Master.default_route(), None);
    }
}
