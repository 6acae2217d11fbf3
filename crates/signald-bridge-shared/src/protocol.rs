use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::group::DaemonGroup;
use crate::types::{InternalGroupId, RequestId};

/// All commands the bridge sends to the daemon.
///
/// Serialized internally tagged: the variant becomes the `type` field of
/// the outbound JSON object.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Start registration of a number
    Register { username: String, voice: bool },

    /// Finish registration with the code received by SMS or voice
    Verify {
        username: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pin: Option<String>,
    },

    /// Deliver a message to one address or one group
    Send {
        username: String,
        #[serde(rename = "recipientAddress", skip_serializing_if = "Option::is_none")]
        recipient_address: Option<Address>,
        #[serde(rename = "recipientGroupId", skip_serializing_if = "Option::is_none")]
        recipient_group_id: Option<InternalGroupId>,
        #[serde(rename = "messageBody")]
        message_body: String,
        attachments: Vec<RequestAttachment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        quote: Option<Quote>,
    },

    ListGroups { username: String },

    /// signald creates a group through `update_group` without a group id
    #[serde(rename = "update_group")]
    CreateGroup {
        username: String,
        #[serde(rename = "groupName")]
        group_name: String,
        members: Vec<String>,
    },

    LeaveGroup {
        username: String,
        #[serde(rename = "recipientGroupId")]
        recipient_group_id: InternalGroupId,
    },

    /// Request a linking URI, or with a reused id, the link outcome
    Link {
        #[serde(rename = "deviceName")]
        device_name: String,
    },

    /// Start streaming incoming messages for a number
    Subscribe { username: String },

    Unsubscribe { username: String },
}

impl Command {
    /// The `type` tag this command is sent with.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::Verify { .. } => "verify",
            Command::Send { .. } => "send",
            Command::ListGroups { .. } => "list_groups",
            Command::CreateGroup { .. } => "update_group",
            Command::LeaveGroup { .. } => "leave_group",
            Command::Link { .. } => "link",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// An individual recipient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub number: String,
}

/// A file on the daemon's filesystem to attach to a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestAttachment {
    pub filename: String,
}

/// Reference to an earlier message being replied to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    /// Timestamp of the quoted message
    pub id: u64,
    pub author: Address,
    pub text: String,
}

/// A command paired with its correlation id, as written to the socket.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            id: RequestId::new(),
            command,
        }
    }

    /// Build a request that reuses an id issued earlier (second link phase).
    pub fn with_id(id: RequestId, command: Command) -> Self {
        Self { id, command }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// One decoded inbound JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Batch-complete sentinel on receive streams
    #[serde(default)]
    pub done: bool,
}

impl DaemonFrame {
    /// Decode one inbound line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ProtocolError::new(format!("invalid JSON: {e}")))?;

        if !value.is_object() {
            return Err(ProtocolError::new("frame is not a JSON object"));
        }

        let request_id = value.get("id").and_then(Value::as_str).map(str::to_string);

        serde_json::from_value(value).map_err(|e| ProtocolError {
            request_id,
            reason: format!("unexpected frame shape: {e}"),
        })
    }

    /// Whether the daemon reported an application error in this frame.
    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_null()) || self.kind.ends_with("_error")
    }

    /// Human-readable failure detail, passed through verbatim.
    pub fn error_detail(&self) -> String {
        if let Some(message) = self.data.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(obj)) => match obj.get("message").and_then(Value::as_str) {
                Some(message) => message.to_string(),
                None => Value::Object(obj.clone()).to_string(),
            },
            Some(Value::Null) | None => self.kind.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Number the frame belongs to, when the daemon names one.
    pub fn username(&self) -> Option<&str> {
        self.data.get("username").and_then(Value::as_str)
    }

    /// Linking URI carried by a `linking_uri` reply.
    pub fn linking_uri(&self) -> Option<&str> {
        self.data.get("uri").and_then(Value::as_str)
    }

    /// Groups carried by a `group_list` reply.
    pub fn groups(&self) -> Result<Vec<DaemonGroup>, ProtocolError> {
        #[derive(Deserialize)]
        struct GroupList {
            #[serde(default)]
            groups: Vec<DaemonGroup>,
        }

        if self.data.is_null() {
            return Ok(Vec::new());
        }

        let list: GroupList = serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError {
            request_id: self.id.as_ref().map(|id| id.0.clone()),
            reason: format!("malformed group list: {e}"),
        })?;
        Ok(list.groups)
    }
}
