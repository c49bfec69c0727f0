//! Typed message content.
//!
//! Content is parsed from `(msg_type, raw JSON)`. Message types this crate
//! does not model are kept as [`MessageContent::Unknown`] so they can still be
//! routed and logged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::Channel;

/// A mime-type keyed output bundle, e.g. `{"text/plain": "2"}`.
pub type MimeBundle = Map<String, Value>;

/// `content.status` of every `*_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    #[serde(alias = "aborted")]
    Abort,
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyStatus::Ok => write!(f, "ok"),
            ReplyStatus::Error => write!(f, "error"),
            ReplyStatus::Abort => write!(f, "abort"),
        }
    }
}

/// Error fields carried inline by a reply whose status is `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// `execution_state` of an iopub `status` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Terminating,
    Dead,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamName::Stdout => write!(f, "stdout"),
            StreamName::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default)]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_expressions: Map<String, Value>,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub language_info: Value,
    #[serde(default)]
    pub banner: String,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub cursor_start: usize,
    #[serde(default)]
    pub cursor_end: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectRequest {
    pub code: String,
    pub cursor_pos: usize,
    #[serde(default)]
    pub detail_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptReply {
    pub status: ReplyStatus,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub restart: bool,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommInfoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommInfoReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub comms: Map<String, Value>,
    #[serde(flatten)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Transient>,
}

impl DisplayData {
    pub fn display_id(&self) -> Option<&str> {
        self.transient.as_ref()?.display_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDisplayData {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub transient: Transient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub execution_count: u64,
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Transient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearOutput {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}

/// Declares the content enum, its `msg_type` table, parsing, serialization
/// and `From` conversions in one place so the tables cannot drift apart.
macro_rules! message_content {
    ($($variant:ident($ty:ty) => $msg_type:literal),* $(,)?) => {
        /// Message content, one variant per modelled `msg_type`.
        #[derive(Debug, Clone, PartialEq)]
        pub enum MessageContent {
            $($variant($ty),)*
            /// A message type this crate does not model.
            Unknown { msg_type: String, content: Value },
        }

        impl MessageContent {
            /// The wire `msg_type` for this content.
            pub fn msg_type(&self) -> &str {
                match self {
                    $(MessageContent::$variant(_) => $msg_type,)*
                    MessageContent::Unknown { msg_type, .. } => msg_type,
                }
            }

            /// Parse raw JSON content according to `msg_type`.
            pub fn from_type_and_content(
                msg_type: &str,
                content: Value,
            ) -> Result<Self, serde_json::Error> {
                match msg_type {
                    $($msg_type => serde_json::from_value(content).map(MessageContent::$variant),)*
                    _ => Ok(MessageContent::Unknown {
                        msg_type: msg_type.to_string(),
                        content,
                    }),
                }
            }
        }

        impl Serialize for MessageContent {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                match self {
                    $(MessageContent::$variant(inner) => inner.serialize(serializer),)*
                    MessageContent::Unknown { content, .. } => content.serialize(serializer),
                }
            }
        }

        $(
            impl From<$ty> for MessageContent {
                fn from(content: $ty) -> Self {
                    MessageContent::$variant(content)
                }
            }
        )*
    };
}

message_content! {
    ExecuteRequest(ExecuteRequest) => "execute_request",
    ExecuteReply(ExecuteReply) => "execute_reply",
    KernelInfoRequest(KernelInfoRequest) => "kernel_info_request",
    KernelInfoReply(KernelInfoReply) => "kernel_info_reply",
    CompleteRequest(CompleteRequest) => "complete_request",
    CompleteReply(CompleteReply) => "complete_reply",
    InspectRequest(InspectRequest) => "inspect_request",
    InspectReply(InspectReply) => "inspect_reply",
    InterruptRequest(InterruptRequest) => "interrupt_request",
    InterruptReply(InterruptReply) => "interrupt_reply",
    ShutdownRequest(ShutdownRequest) => "shutdown_request",
    ShutdownReply(ShutdownReply) => "shutdown_reply",
    CommInfoRequest(CommInfoRequest) => "comm_info_request",
    CommInfoReply(CommInfoReply) => "comm_info_reply",
    Status(Status) => "status",
    Stream(Stream) => "stream",
    DisplayData(DisplayData) => "display_data",
    UpdateDisplayData(UpdateDisplayData) => "update_display_data",
    ExecuteInput(ExecuteInput) => "execute_input",
    ExecuteResult(ExecuteResult) => "execute_result",
    Error(ErrorOutput) => "error",
    ClearOutput(ClearOutput) => "clear_output",
    CommOpen(CommOpen) => "comm_open",
    CommMsg(CommMsg) => "comm_msg",
    CommClose(CommClose) => "comm_close",
    InputRequest(InputRequest) => "input_request",
    InputReply(InputReply) => "input_reply",
}

impl MessageContent {
    /// Whether this is a `*_reply` sent by the kernel in answer to a request.
    ///
    /// `input_reply` is excluded: it travels from the client to the kernel.
    pub fn is_reply(&self) -> bool {
        let msg_type = self.msg_type();
        msg_type.ends_with("_reply") && msg_type != "input_reply"
    }

    /// The `status` field of a reply, if this is one.
    pub fn reply_status(&self) -> Option<ReplyStatus> {
        match self {
            MessageContent::ExecuteReply(r) => Some(r.status),
            MessageContent::KernelInfoReply(r) => Some(r.status),
            MessageContent::CompleteReply(r) => Some(r.status),
            MessageContent::InspectReply(r) => Some(r.status),
            MessageContent::InterruptReply(r) => Some(r.status),
            MessageContent::ShutdownReply(r) => Some(r.status),
            MessageContent::CommInfoReply(r) => Some(r.status),
            MessageContent::Unknown { content, .. } if self.is_reply() => content
                .get("status")
                .cloned()
                .and_then(|s| serde_json::from_value(s).ok()),
            _ => None,
        }
    }

    /// The inline error of a reply, if it carries one.
    pub fn reply_error(&self) -> Option<ReplyError> {
        match self {
            MessageContent::ExecuteReply(r) => r.error.clone(),
            MessageContent::KernelInfoReply(r) => r.error.clone(),
            MessageContent::CompleteReply(r) => r.error.clone(),
            MessageContent::InspectReply(r) => r.error.clone(),
            MessageContent::InterruptReply(r) => r.error.clone(),
            MessageContent::ShutdownReply(r) => r.error.clone(),
            MessageContent::CommInfoReply(r) => r.error.clone(),
            MessageContent::Unknown { content, .. } if self.is_reply() => {
                serde_json::from_value(content.clone()).ok()
            }
            _ => None,
        }
    }

    /// The channel a message with this content travels on.
    pub fn default_channel(&self) -> Channel {
        match self {
            MessageContent::InterruptRequest(_)
            | MessageContent::InterruptReply(_)
            | MessageContent::ShutdownRequest(_)
            | MessageContent::ShutdownReply(_) => Channel::Control,
            MessageContent::InputRequest(_) | MessageContent::InputReply(_) => Channel::Stdin,
            MessageContent::Status(_)
            | MessageContent::Stream(_)
            | MessageContent::DisplayData(_)
            | MessageContent::UpdateDisplayData(_)
            | MessageContent::ExecuteInput(_)
            | MessageContent::ExecuteResult(_)
            | MessageContent::Error(_)
            | MessageContent::ClearOutput(_) => Channel::Iopub,
            _ => Channel::Shell,
        }
    }

    /// The reply type that terminates a request of this type, e.g.
    /// `execute_request` → `execute_reply`.
    pub fn expected_reply_type(&self) -> Option<String> {
        self.msg_type()
            .strip_suffix("_request")
            .filter(|_| !matches!(self, MessageContent::InputRequest(_)))
            .map(|kind| format!("{kind}_reply"))
    }
}
