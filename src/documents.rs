//! Index documents and the sink that receives them.
//!
//! Every summary becomes one [`IndexDocument`] whose metadata identifies what
//! it describes: a page for text summaries, an artifact id for image and
//! table summaries. The metadata is stable across runs so a re-indexed entry
//! replaces rather than duplicates its documents in a keyed index.

use crate::error::StageError;
use crate::ledger::SummarySet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// What a document summarises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    TextSummary,
    ImageSummary,
    TableSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    /// Set for text summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// Set for image and table summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Source PDF file name.
    pub source: String,
}

/// One unit of text handed to the embedding index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl SummarySet {
    /// Documents for every summary in the set.
    ///
    /// Table markdown is not indexed on its own; it travels in the ledger for
    /// consumers that render tables.
    pub fn documents(&self, source: &str) -> Vec<IndexDocument> {
        let text = self.text_summary.iter().map(|(page, content)| IndexDocument {
            content: content.clone(),
            metadata: DocumentMetadata {
                kind: DocumentKind::TextSummary,
                page: page.parse().ok(),
                id: None,
                source: source.to_string(),
            },
        });
        let by_id = |kind: DocumentKind| {
            move |(id, content): (&String, &String)| IndexDocument {
                content: content.clone(),
                metadata: DocumentMetadata {
                    kind,
                    page: None,
                    id: Some(id.clone()),
                    source: source.to_string(),
                },
            }
        };

        text.chain(self.image_summary.iter().map(by_id(DocumentKind::ImageSummary)))
            .chain(self.table_summary.iter().map(by_id(DocumentKind::TableSummary)))
            .filter(|d| !d.content.trim().is_empty())
            .collect()
    }
}

/// Receives documents destined for the embedding/vector index.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn add_documents(&self, documents: &[IndexDocument]) -> Result<(), StageError>;
}

/// Appends documents as JSON lines to a file.
///
/// Useful as the hand-off point to an external indexer, and as the default
/// sink of the CLI.
#[derive(Debug)]
pub struct JsonlDocumentSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlDocumentSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentSink for JsonlDocumentSink {
    async fn add_documents(&self, documents: &[IndexDocument]) -> Result<(), StageError> {
        let mut buf = Vec::new();
        for doc in documents {
            serde_json::to_writer(&mut buf, doc)
                .map_err(|e| StageError::MalformedInput(format!("document encoding: {e}")))?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StageError::io(&self.path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| StageError::io(&self.path, e))?;
        file.flush().await.map_err(|e| StageError::io(&self.path, e))?;

        debug!("Appended {} documents to {}", documents.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> SummarySet {
        SummarySet {
            text_summary: BTreeMap::from([("2".to_string(), "page two".to_string())]),
            image_summary: BTreeMap::from([("5".to_string(), "a bar chart".to_string())]),
            table_summary: BTreeMap::from([("9".to_string(), "revenue table".to_string())]),
            table_markdown: BTreeMap::from([("9".to_string(), "| a |\n|---|".to_string())]),
        }
    }

    #[test]
    fn documents_carry_stable_metadata() {
        let docs = sample().documents("report.pdf");
        assert_eq!(docs.len(), 3);

        let json = serde_json::to_value(&docs[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "page two",
                "metadata": {"type": "text_summary", "page": 2, "source": "report.pdf"}
            })
        );

        let json = serde_json::to_value(&docs[1]).unwrap();
        assert_eq!(json["metadata"]["type"], "image_summary");
        assert_eq!(json["metadata"]["id"], "5");
        assert!(json["metadata"].get("page").is_none());

        assert_eq!(docs[2].metadata.kind, DocumentKind::TableSummary);
    }

    #[test]
    fn blank_summaries_are_not_indexed() {
        let set = SummarySet {
            text_summary: BTreeMap::from([("1".to_string(), "   ".to_string())]),
            ..Default::default()
        };
        assert!(set.documents("x.pdf").is_empty());
    }

    #[tokio::test]
    async fn jsonl_sink_appends_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = JsonlDocumentSink::new(dir.path().join("out").join("docs.jsonl"));

        let docs = sample().documents("report.pdf");
        sink.add_documents(&docs[..1]).await.unwrap();
        sink.add_documents(&docs[1..]).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let back: IndexDocument = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(back, docs[2]);
    }
}
