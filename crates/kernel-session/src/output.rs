//! Cell outputs in nbformat shape.

use jupyter_wire::{MessageContent, MimeBundle, StreamName, Transient};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One entry in a cell's output list.
///
/// Serializes as nbformat output JSON (`{"output_type": "stream", ...}`).
/// The transient `display_id` is kept so `update_display_data` can find the
/// output again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: StreamName,
        #[serde(deserialize_with = "deserialize_multiline")]
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    ExecuteResult {
        execution_count: Option<u64>,
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

/// nbformat allows multiline strings to be stored as a list of lines.
fn deserialize_multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        One(String),
        Lines(Vec<String>),
    }

    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::One(text) => text,
        Multiline::Lines(lines) => lines.concat(),
    })
}

impl Output {
    /// Convert iopub content to an output entry. Returns `None` for message
    /// types that are not outputs.
    pub fn from_content(content: &MessageContent) -> Option<Output> {
        match content {
            MessageContent::Stream(stream) => Some(Output::Stream {
                name: stream.name,
                text: stream.text.clone(),
            }),
            MessageContent::DisplayData(display) => Some(Output::DisplayData {
                data: display.data.clone(),
                metadata: display.metadata.clone(),
                transient: display.transient.clone().filter(|t| t.display_id.is_some()),
            }),
            MessageContent::ExecuteResult(result) => Some(Output::ExecuteResult {
                execution_count: Some(result.execution_count),
                data: result.data.clone(),
                metadata: result.metadata.clone(),
                transient: result.transient.clone().filter(|t| t.display_id.is_some()),
            }),
            MessageContent::Error(error) => Some(Output::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            }),
            _ => None,
        }
    }

    /// A `display_data` output built from an execute reply's `page` payload
    /// (IPython's `?` help).
    pub fn from_page_payload(payload: &Value) -> Option<Output> {
        if payload.get("source").and_then(Value::as_str) != Some("page") {
            return None;
        }
        let data = payload.get("data")?.as_object()?.clone();
        Some(Output::DisplayData {
            data,
            metadata: Map::new(),
            transient: None,
        })
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }

    pub fn display_id(&self) -> Option<&str> {
        match self {
            Output::DisplayData { transient, .. } | Output::ExecuteResult { transient, .. } => {
                transient.as_ref()?.display_id.as_deref()
            }
            _ => None,
        }
    }

    /// The mime bundle of a rich output.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Replace the bundle and metadata in place (`update_display_data`).
    pub(crate) fn update_display(&mut self, new_data: &MimeBundle, new_metadata: &Map<String, Value>) {
        match self {
            Output::DisplayData { data, metadata, .. }
            | Output::ExecuteResult { data, metadata, .. } => {
                *data = new_data.clone();
                *metadata = new_metadata.clone();
            }
            _ => {}
        }
    }

    /// Append `other` if both are streams with the same name.
    /// Returns `other` back if it cannot be merged.
    pub(crate) fn coalesce(&mut self, other: Output) -> Option<Output> {
        match (self, other) {
            (
                Output::Stream { name, text },
                Output::Stream {
                    name: other_name,
                    text: other_text,
                },
            ) if *name == other_name => {
                text.push_str(&other_text);
                None
            }
            (_, other) => Some(other),
        }
    }

    pub fn to_nbformat(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Append `output`, merging it into the last entry when both are streams of
/// the same name.
pub(crate) fn push_output(outputs: &mut Vec<Output>, output: Output) -> usize {
    if let Some(last) = outputs.last_mut() {
        match last.coalesce(output) {
            None => return outputs.len() - 1,
            Some(output) => outputs.push(output),
        }
    } else {
        outputs.push(output);
    }
    outputs.len() - 1
}
