//! Message envelopes shared by all four channels.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::codec::CodecError;
use crate::content::MessageContent;

/// Protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The logical lane a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Iopub => write!(f, "iopub"),
            Channel::Stdin => write!(f, "stdin"),
            Channel::Control => write!(f, "control"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_date")]
    pub date: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: String::new(),
            date: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Kernels are loose about timestamps: accept RFC 3339, a naive ISO
/// timestamp (taken as UTC), or fall back to the receive time.
fn deserialize_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(Utc::now());
    };
    if let Ok(date) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    Ok(Utc::now())
}

/// `null`, `{}` and missing parent headers all mean "no parent".
fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::<String, Value>::new().serialize(serializer),
    }
}

/// A fully parsed message.
///
/// Buffers are carried out of band by the binary framing and are not part
/// of the JSON envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub header: Header,
    #[serde(serialize_with = "serialize_parent_header")]
    pub parent_header: Option<Header>,
    pub metadata: Map<String, Value>,
    pub content: MessageContent,
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
    pub channel: Channel,
}

impl Message {
    /// A new top-level message in `session`, on the content's default channel.
    pub fn new(content: impl Into<MessageContent>, session: &str) -> Self {
        let content = content.into();
        Self {
            header: Header::new(content.msg_type(), session),
            parent_header: None,
            metadata: Map::new(),
            channel: content.default_channel(),
            content,
            buffers: Vec::new(),
        }
    }

    /// A message answering `parent`, in the parent's session.
    pub fn child_of(content: impl Into<MessageContent>, parent: &Header) -> Self {
        let mut message = Self::new(content, &parent.session);
        message.parent_header = Some(parent.clone());
        message
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The correlation key: the id of the request this message answers.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// The session id of the request this message answers.
    pub fn parent_session(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.session.as_str())
    }
}

/// An envelope whose content has not been interpreted yet.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub header: Header,

    #[serde(default, deserialize_with = "deserialize_parent_header")]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub channel: Option<Channel>,
}

impl TryFrom<RawMessage> for Message {
    type Error = CodecError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let content = MessageContent::from_type_and_content(&raw.header.msg_type, raw.content)
            .map_err(|source| CodecError::Content {
                msg_type: raw.header.msg_type.clone(),
                source,
            })?;
        let channel = raw.channel.unwrap_or_else(|| content.default_channel());

        Ok(Message {
            header: raw.header,
            parent_header: raw.parent_header,
            metadata: raw.metadata.unwrap_or_default(),
            content,
            buffers: Vec::new(),
            channel,
        })
    }
}
