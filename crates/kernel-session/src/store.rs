//! Notebook persistence.
//!
//! [`NotebookDocument`] is the nbformat v4 shape of a notebook. A
//! [`NotebookStore`] saves and loads it; [`JsonFileStore`] keeps it as a
//! `.ipynb` JSON file.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::output::Output;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid notebook JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported nbformat version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum DocumentCell {
    Code {
        id: String,
        #[serde(serialize_with = "serialize_lines", deserialize_with = "deserialize_lines")]
        source: String,
        #[serde(default)]
        metadata: Map<String, Value>,
        execution_count: Option<u64>,
        #[serde(default)]
        outputs: Vec<Output>,
    },
    Markdown {
        id: String,
        #[serde(serialize_with = "serialize_lines", deserialize_with = "deserialize_lines")]
        source: String,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Raw {
        id: String,
        #[serde(serialize_with = "serialize_lines", deserialize_with = "deserialize_lines")]
        source: String,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookDocument {
    pub cells: Vec<DocumentCell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
}

impl Default for NotebookDocument {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
        }
    }
}

/// Split source into nbformat's list of lines, each keeping its newline.
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

fn serialize_lines<S: Serializer>(source: &str, serializer: S) -> Result<S::Ok, S::Error> {
    source_to_lines(source).serialize(serializer)
}

fn deserialize_lines<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Source {
        One(String),
        Lines(Vec<String>),
    }

    Ok(match Source::deserialize(deserializer)? {
        Source::One(text) => text,
        Source::Lines(lines) => lines.concat(),
    })
}

pub trait NotebookStore: Send + Sync {
    fn save(&self, path: &Path, document: &NotebookDocument) -> Result<(), StoreError>;

    fn load(&self, path: &Path) -> Result<NotebookDocument, StoreError>;
}

/// Stores notebooks as `.ipynb` JSON files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileStore;

impl NotebookStore for JsonFileStore {
    fn save(&self, path: &Path, document: &NotebookDocument) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut json = serde_json::to_string_pretty(document)?;
        json.push('\n');
        std::fs::write(path, json)?;
        log::debug!("[notebook] Saved {}", path.display());
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<NotebookDocument, StoreError> {
        let json = std::fs::read_to_string(path)?;
        let document: NotebookDocument = serde_json::from_str(&json)?;
        if document.nbformat != 4 {
            return Err(StoreError::UnsupportedVersion(document.nbformat));
        }
        Ok(document)
    }
}
