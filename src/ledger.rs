//! The processed-state ledger: which PDFs were ingested and what they produced.
//!
//! ## On-disk format
//!
//! One pretty-printed JSON object keyed by the source file name:
//!
//! ```json
//! {
//!   "report.pdf": {
//!     "text_summary":   { "1": "…", "2": "…" },
//!     "image_summary":  { "7": "…" },
//!     "table_summary":  { "9": "…" },
//!     "table_markdown": { "9": "| a | b |\n|---|---|\n…" },
//!     "parsing_processed": true,
//!     "vectorstore_processed": true,
//!     "partial": false
//!   }
//! }
//! ```
//!
//! `failed_stages` is only written for partial runs.
//!
//! ## Merge semantics
//!
//! A run never replaces an entry. Its maps are merged key by key into the
//! existing ones, so summaries from an earlier run survive a re-run that only
//! produced some of the outputs.
//!
//! ## Durability
//!
//! [`LedgerStore::update`] holds an async mutex across read-modify-write and
//! persists through a temp file in the same directory followed by a rename.
//! A crash leaves either the old or the new ledger on disk, never a torn one.

use crate::error::IngestError;
use crate::graph::StageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

// ── Entry types ──────────────────────────────────────────────────────────

/// The four summary maps a run produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySet {
    #[serde(default)]
    pub text_summary: BTreeMap<String, String>,
    #[serde(default)]
    pub image_summary: BTreeMap<String, String>,
    #[serde(default)]
    pub table_summary: BTreeMap<String, String>,
    #[serde(default)]
    pub table_markdown: BTreeMap<String, String>,
}

impl SummarySet {
    /// Merge `other` into `self` key by key. Keys only present in `self` stay.
    pub fn merge(&mut self, other: SummarySet) {
        self.text_summary.extend(other.text_summary);
        self.image_summary.extend(other.image_summary);
        self.table_summary.extend(other.table_summary);
        self.table_markdown.extend(other.table_markdown);
    }

    pub fn is_empty(&self) -> bool {
        self.text_summary.is_empty()
            && self.image_summary.is_empty()
            && self.table_summary.is_empty()
            && self.table_markdown.is_empty()
    }
}

/// Everything the ledger knows about one source PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub summaries: SummarySet,
    #[serde(default)]
    pub parsing_processed: bool,
    #[serde(default)]
    pub vectorstore_processed: bool,
    /// The last run finished with failed or skipped optional stages.
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_stages: Vec<StageId>,
}

impl LedgerEntry {
    /// Parsed, but its documents never reached the index.
    pub fn needs_indexing(&self) -> bool {
        self.parsing_processed && !self.vectorstore_processed
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// In-memory ledger. Entries live until [`Ledger::prune_missing`] or
/// [`Ledger::remove`] drops them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_or_create(&mut self, key: &str) -> &mut LedgerEntry {
        self.entries.entry(key.to_string()).or_default()
    }

    pub fn remove(&mut self, key: &str) -> Option<LedgerEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LedgerEntry)> {
        self.entries.iter()
    }

    /// Merge one run's output into the entry for `key`.
    ///
    /// `incomplete` lists the optional stages that failed or were skipped;
    /// an empty list marks the entry complete. The entry is flagged for
    /// (re-)indexing because the merged maps may contain new documents.
    pub fn record_run(&mut self, key: &str, summaries: SummarySet, incomplete: Vec<StageId>) {
        let entry = self.get_or_create(key);
        entry.summaries.merge(summaries);
        entry.parsing_processed = true;
        entry.vectorstore_processed = false;
        entry.partial = !incomplete.is_empty();
        entry.failed_stages = incomplete;
    }

    /// Mark `key` as forwarded to the index. Returns `false` for unknown keys.
    pub fn mark_indexed(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.vectorstore_processed = true;
                true
            }
            None => false,
        }
    }

    /// Keys of entries that were parsed but never reached the index.
    pub fn pending_index(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.needs_indexing())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop entries whose key is not in `existing`. Returns the dropped keys.
    pub fn prune_missing(&mut self, existing: &BTreeSet<String>) -> Vec<String> {
        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|k| !existing.contains(*k))
            .cloned()
            .collect();
        for key in &gone {
            self.entries.remove(key);
        }
        gone
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// File-backed ledger with one critical section per update.
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    inner: Mutex<Ledger>,
}

impl LedgerStore {
    /// Load the ledger at `path`. A missing or empty file yields an empty ledger.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let ledger = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => Ledger::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| IngestError::LedgerCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger at {}, starting fresh", path.display());
                Ledger::new()
            }
            Err(source) => return Err(IngestError::LedgerRead { path, source }),
        };

        debug!("Ledger {} loaded: {} entries", path.display(), ledger.len());
        Ok(Self {
            path,
            inner: Mutex::new(ledger),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current ledger.
    pub async fn snapshot(&self) -> Ledger {
        self.inner.lock().await.clone()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.contains(key)
    }

    pub async fn get(&self, key: &str) -> Option<LedgerEntry> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Apply `f` and persist the result before releasing the lock.
    ///
    /// `f` works on a copy; if persisting fails the in-memory ledger is left
    /// as it was, so memory and disk never disagree.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> Result<R, IngestError> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }
}

/// Write `ledger` to `path` atomically.
async fn persist(path: &Path, ledger: &Ledger) -> Result<(), IngestError> {
    let json = serde_json::to_string_pretty(ledger)
        .map_err(|e| IngestError::Internal(format!("ledger serialisation: {e}")))?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
        .await
        .map_err(|e| IngestError::Internal(format!("Ledger write task panicked: {}", e)))?
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    let write_err = |source| IngestError::LedgerWrite {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.write_all(b"\n").map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rerun_merges_instead_of_overwriting() {
        let mut ledger = Ledger::new();
        ledger.record_run(
            "a.pdf",
            SummarySet {
                text_summary: map(&[("1", "a")]),
                ..Default::default()
            },
            vec![],
        );
        ledger.record_run(
            "a.pdf",
            SummarySet {
                table_summary: map(&[("t1", "b")]),
                ..Default::default()
            },
            vec![],
        );

        let entry = ledger.get("a.pdf").unwrap();
        assert_eq!(entry.summaries.text_summary, map(&[("1", "a")]));
        assert_eq!(entry.summaries.table_summary, map(&[("t1", "b")]));
    }

    #[test]
    fn partial_runs_are_flagged_and_cleared() {
        let mut ledger = Ledger::new();
        ledger.record_run("a.pdf", SummarySet::default(), vec![StageId::TableSummarize]);
        let entry = ledger.get("a.pdf").unwrap();
        assert!(entry.partial);
        assert_eq!(entry.failed_stages, vec![StageId::TableSummarize]);

        ledger.record_run("a.pdf", SummarySet::default(), vec![]);
        let entry = ledger.get("a.pdf").unwrap();
        assert!(!entry.partial);
        assert!(entry.failed_stages.is_empty());
    }

    #[test]
    fn pending_index_tracks_vectorstore_flag() {
        let mut ledger = Ledger::new();
        ledger.record_run("a.pdf", SummarySet::default(), vec![]);
        ledger.record_run("b.pdf", SummarySet::default(), vec![]);
        assert!(ledger.mark_indexed("a.pdf"));
        assert!(!ledger.mark_indexed("zzz.pdf"));
        assert_eq!(ledger.pending_index(), vec!["b.pdf".to_string()]);
    }

    #[test]
    fn prune_drops_only_missing_sources() {
        let mut ledger = Ledger::new();
        ledger.get_or_create("kept.pdf");
        ledger.get_or_create("gone.pdf");
        let existing = BTreeSet::from(["kept.pdf".to_string()]);
        assert_eq!(ledger.prune_missing(&existing), vec!["gone.pdf".to_string()]);
        assert!(ledger.contains("kept.pdf"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn json_shape_is_flat_per_file() {
        let mut ledger = Ledger::new();
        ledger.record_run(
            "r.pdf",
            SummarySet {
                text_summary: map(&[("1", "intro")]),
                ..Default::default()
            },
            vec![],
        );
        let value = serde_json::to_value(&ledger).unwrap();
        let entry = &value["r.pdf"];
        assert_eq!(entry["text_summary"]["1"], "intro");
        assert_eq!(entry["image_summary"], serde_json::json!({}));
        assert_eq!(entry["parsing_processed"], true);
        assert_eq!(entry["vectorstore_processed"], false);
        assert!(entry.get("failed_stages").is_none());
    }

    #[test]
    fn reads_entries_without_optional_fields() {
        let json = r#"{"old.pdf": {"text_summary": {"1": "x"}, "image_summary": {}, "table_summary": {}, "parsing_processed": true, "vectorstore_processed": true}}"#;
        let ledger: Ledger = serde_json::from_str(json).unwrap();
        let entry = ledger.get("old.pdf").unwrap();
        assert!(entry.summaries.table_markdown.is_empty());
        assert!(!entry.partial);
        assert!(!entry.needs_indexing());
    }

    #[tokio::test]
    async fn store_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("processed_states.json");

        let store = LedgerStore::open(&path).await.unwrap();
        assert!(store.snapshot().await.is_empty());

        store
            .update(|l| l.record_run("a.pdf", SummarySet::default(), vec![]))
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = LedgerStore::open(&path).await.unwrap();
        assert!(reopened.contains("a.pdf").await);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "processed_states.json")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[tokio::test]
    async fn corrupt_ledger_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = LedgerStore::open(&path).await.unwrap_err();
        assert!(matches!(err, IngestError::LedgerCorrupt { .. }));
    }
}
