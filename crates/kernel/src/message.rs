use std::sync::Arc;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::{CodecError, ReceivedFrames};

pub const PROTOCOL_VERSION: &str = "5.3";

/// MIME type → payload, e.g. `{"text/plain": "2"}`.
pub type MimeBundle = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    pub date: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            username: username.to_string(),
            session: session.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded protocol message.
///
/// `identities` are the routing prefixes that precede the delimiter frame; they
/// are empty for messages travelling over DEALER and SUB sockets. A decoded
/// message remembers the frames it came from, so fields the caller leaves
/// alone (including JSON keys no field models) encode back byte for byte.
#[derive(Debug, Clone)]
pub struct Message {
    pub identities: Vec<Bytes>,
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: Map<String, Value>,
    pub content: Content,
    pub buffers: Vec<Bytes>,
    pub(crate) received: Option<Arc<ReceivedFrames>>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.identities == other.identities
            && self.header == other.header
            && self.parent_header == other.parent_header
            && self.metadata == other.metadata
            && self.content == other.content
            && self.buffers == other.buffers
    }
}

impl Message {
    pub fn new(content: Content, session: &str, username: &str) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(content.msg_type(), session, username),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            received: None,
        }
    }

    /// Builds a message caused by `parent`, as a kernel does for replies and
    /// broadcast output.
    pub fn reply_to(parent: &Header, content: Content) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(content.msg_type(), &parent.session, &parent.username),
            parent_header: Some(parent.clone()),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            received: None,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

macro_rules! contents {
    ($($variant:ident($ty:ty) => $name:literal,)*) => {
        /// Message content, one variant per message type this client understands.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Content {
            $($variant($ty),)*
            Unknown { msg_type: String, content: Value },
        }

        impl Content {
            pub fn msg_type(&self) -> &str {
                match self {
                    $(Content::$variant(_) => $name,)*
                    Content::Unknown { msg_type, .. } => msg_type,
                }
            }

            pub(crate) fn from_json(msg_type: &str, raw: &[u8]) -> Result<Self, CodecError> {
                let schema = |source| CodecError::SchemaViolation {
                    msg_type: msg_type.to_string(),
                    source,
                };
                match msg_type {
                    $($name => serde_json::from_slice(raw).map(Content::$variant).map_err(schema),)*
                    _ => serde_json::from_slice(raw)
                        .map(|content| Content::Unknown {
                            msg_type: msg_type.to_string(),
                            content,
                        })
                        .map_err(schema),
                }
            }

            pub(crate) fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
                match self {
                    $(Content::$variant(c) => serde_json::to_vec(c),)*
                    Content::Unknown { content, .. } => serde_json::to_vec(content),
                }
            }
        }
    };
}

contents! {
    ExecuteRequest(ExecuteRequest) => "execute_request",
    ExecuteReply(ExecuteReply) => "execute_reply",
    ExecuteInput(ExecuteInput) => "execute_input",
    ExecuteResult(ExecuteResult) => "execute_result",
    Stream(Stream) => "stream",
    DisplayData(DisplayData) => "display_data",
    UpdateDisplayData(DisplayData) => "update_display_data",
    Error(ErrorContent) => "error",
    Status(Status) => "status",
    ClearOutput(ClearOutput) => "clear_output",
    CompleteRequest(CompleteRequest) => "complete_request",
    CompleteReply(CompleteReply) => "complete_reply",
    InspectRequest(InspectRequest) => "inspect_request",
    InspectReply(InspectReply) => "inspect_reply",
    KernelInfoRequest(KernelInfoRequest) => "kernel_info_request",
    KernelInfoReply(KernelInfoReply) => "kernel_info_reply",
    InterruptRequest(InterruptRequest) => "interrupt_request",
    InterruptReply(InterruptReply) => "interrupt_reply",
    ShutdownRequest(ShutdownRequest) => "shutdown_request",
    ShutdownReply(ShutdownReply) => "shutdown_reply",
    InputRequest(InputRequest) => "input_request",
    InputReply(InputReply) => "input_reply",
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub execution_count: u32,
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearOutput {
    #[serde(default)]
    pub wait: bool,
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
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    #[serde(default)]
    pub banner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptReply {
    pub status: ReplyStatus,
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}
