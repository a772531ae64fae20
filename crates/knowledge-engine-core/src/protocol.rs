//! Controller ⇄ worker wire protocol.
//!
//! Every message is one JSON document terminated by `\n` on the worker's
//! stdin/stdout pipe.
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | controller → worker | `{"id", "method", "params"}` |
//! | worker → controller | `{"id", "ok": true, "result"}` or `{"id", "ok": false, "error": {"message", "stack"?}}` |
//! | worker → controller | `{"type": "event", "event", "payload"}` (unsolicited) |
//!
//! On the worker side the string method name is parsed into [`Call`], a
//! closed enum, so dispatch is an exhaustive `match` rather than a table
//! lookup that can miss at runtime.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ImportSource, Job, SearchHit};

/// Upper bound on one encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Event name for job state transitions.
pub const JOB_UPDATE_EVENT: &str = "job:update";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
}

/// Serialize `value` as a single newline-terminated frame.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded = serde_json::to_vec(value).map_err(|e| FrameError::Encode(e.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Parse one frame; a trailing `\n` or `\r\n` is tolerated.
pub fn decode_frame<T: DeserializeOwned>(line: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = line.trim_end_matches(['\n', '\r']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|e| FrameError::Decode(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorBody> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorBody {
                message: "worker returned ok=false without an error".to_string(),
                stack: None,
            }))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTag {
    #[serde(rename = "event")]
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub tag: EventTag,
    pub event: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: EventTag::Event,
            event: event.into(),
            payload,
        }
    }
}

/// Anything the worker writes to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Event(Event),
    Response(Response),
}

/// Payload of a [`JOB_UPDATE_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub kb_id: String,
    pub job: Job,
}

// ─── Params ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbParams {
    pub kb_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub kb_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFilesParams {
    pub kb_id: String,
    pub sources: Vec<ImportSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub kb_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteParams {
    pub kb_id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKbParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKbParams {
    pub kb_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKbParams {
    pub kb_id: String,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoParams {}

// ─── Results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureInitializedResult {
    pub kb_id: String,
    pub meta_db_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdResult {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentIdResult {
    pub document_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResult {
    pub success: bool,
}

impl SuccessResult {
    pub const OK: Self = Self { success: true };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
}

// ─── Calls ──────────────────────────────────────────────────────────

/// Every method the worker serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Call {
    #[serde(rename = "kb.ensureInitialized")]
    EnsureInitialized(KbParams),
    #[serde(rename = "kb.importFiles")]
    ImportFiles(ImportFilesParams),
    #[serde(rename = "kb.listJobs")]
    ListJobs(KbParams),
    #[serde(rename = "kb.listJobItems")]
    ListJobItems(JobParams),
    #[serde(rename = "kb.pauseJob")]
    PauseJob(JobParams),
    #[serde(rename = "kb.resumeJob")]
    ResumeJob(JobParams),
    #[serde(rename = "kb.cancelJob")]
    CancelJob(JobParams),
    #[serde(rename = "kb.search")]
    Search(SearchParams),
    #[serde(rename = "kb.createNote")]
    CreateNote(CreateNoteParams),
    #[serde(rename = "kb.getStats")]
    GetStats(KbParams),
    #[serde(rename = "kb.create")]
    Create(CreateKbParams),
    #[serde(rename = "kb.list")]
    List(NoParams),
    #[serde(rename = "kb.get")]
    Get(KbParams),
    #[serde(rename = "kb.update")]
    Update(UpdateKbParams),
    #[serde(rename = "kb.delete")]
    Delete(DeleteKbParams),
}

impl Call {
    pub const METHODS: &'static [&'static str] = &[
        "kb.ensureInitialized",
        "kb.importFiles",
        "kb.listJobs",
        "kb.listJobItems",
        "kb.pauseJob",
        "kb.resumeJob",
        "kb.cancelJob",
        "kb.search",
        "kb.createNote",
        "kb.getStats",
        "kb.create",
        "kb.list",
        "kb.get",
        "kb.update",
        "kb.delete",
    ];

    pub fn method(&self) -> &'static str {
        match self {
            Call::EnsureInitialized(_) => "kb.ensureInitialized",
            Call::ImportFiles(_) => "kb.importFiles",
            Call::ListJobs(_) => "kb.listJobs",
            Call::ListJobItems(_) => "kb.listJobItems",
            Call::PauseJob(_) => "kb.pauseJob",
            Call::ResumeJob(_) => "kb.resumeJob",
            Call::CancelJob(_) => "kb.cancelJob",
            Call::Search(_) => "kb.search",
            Call::CreateNote(_) => "kb.createNote",
            Call::GetStats(_) => "kb.getStats",
            Call::Create(_) => "kb.create",
            Call::List(_) => "kb.list",
            Call::Get(_) => "kb.get",
            Call::Update(_) => "kb.update",
            Call::Delete(_) => "kb.delete",
        }
    }

    /// Parse a wire `method` + `params` pair.
    pub fn parse(method: &str, params: Value) -> Result<Self, CallError> {
        if !Self::METHODS.contains(&method) {
            return Err(CallError::UnknownMethod(method.to_string()));
        }
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        serde_json::from_value(serde_json::json!({ "method": method, "params": params })).map_err(
            |e| CallError::InvalidParams {
                method: method.to_string(),
                message: e.to_string(),
            },
        )
    }

    pub fn into_request(self, id: impl Into<String>) -> Result<Request, FrameError> {
        let method = self.method().to_string();
        let mut value = serde_json::to_value(&self).map_err(|e| FrameError::Encode(e.to_string()))?;
        let params = value
            .get_mut("params")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Request {
            id: id.into(),
            method,
            params,
        })
    }
}
