//! Saved council results, newest first, kept in a JSON file.
//!
//! The in-memory list is authoritative: a failed save is reported as a
//! storage warning and the entry stays in memory.

use crate::error::{Result, VoiceError};
use crate::generation::CouncilResponse;
use crate::types::InteractionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_HISTORY_FILE: &str = "council_history.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_at: DateTime<Utc>,
    pub prompt: String,
    pub mode: InteractionMode,
    pub response: CouncilResponse,
}

impl HistoryEntry {
    pub fn new(prompt: &str, mode: InteractionMode, response: CouncilResponse) -> Self {
        Self {
            created_at: Utc::now(),
            prompt: prompt.to_string(),
            mode,
            response,
        }
    }
}

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    /// Load the store at `path`. A missing file is an empty history; an
    /// unreadable one is logged and treated as empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<HistoryEntry>>(&bytes) {
                Ok(entries) => {
                    log::debug!(
                        "History: Loaded {} entries from {}",
                        entries.len(),
                        path.display()
                    );
                    entries
                }
                Err(e) => {
                    log::warn!("History: Ignoring unreadable {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                log::warn!("History: Could not read {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Memory of the newest entry, fed into the next request
    pub fn latest_memory(&self) -> Option<serde_json::Value> {
        self.entries.first().map(|entry| entry.response.memory_json())
    }

    /// Add an entry at the front and save. The entry is kept even when the
    /// save fails.
    pub fn add(&mut self, entry: HistoryEntry) -> Result<()> {
        self.entries.insert(0, entry);
        self.save_or_warn()
    }

    pub fn remove(&mut self, index: usize) -> Result<Option<HistoryEntry>> {
        if index >= self.entries.len() {
            return Ok(None);
        }
        let removed = self.entries.remove(index);
        self.save_or_warn()?;
        Ok(Some(removed))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save_or_warn()
    }

    fn save_or_warn(&self) -> Result<()> {
        self.save().map_err(|e| {
            log::warn!("History: {}", e);
            e
        })
    }

    fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| VoiceError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| VoiceError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{DialogueTurn, EpisodicMemory};
    use crate::types::Agent;
    use tempfile::TempDir;

    fn response(summary: &str) -> CouncilResponse {
        CouncilResponse {
            context_description: "ctx".to_string(),
            dialogue: vec![DialogueTurn {
                agent: Agent::Spark,
                content: "Idea!".to_string(),
                emotion: None,
            }],
            semantic_memory: vec![],
            episodic_memory: EpisodicMemory {
                event_summary: summary.to_string(),
                timestamp_context: "now".to_string(),
                emotional_residue: "calm".to_string(),
            },
            structured_sense_making: vec![],
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::load(dir.path().join("none.json"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_persists_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::load(&path);
        store
            .add(HistoryEntry::new("first", InteractionMode::Collaborative, response("one")))
            .unwrap();
        store
            .add(HistoryEntry::new("second", InteractionMode::Hierarchical, response("two")))
            .unwrap();

        let reloaded = HistoryStore::load(&path);
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(reloaded.entries()[0].prompt, "second");
        assert_eq!(
            reloaded.latest_memory().unwrap()["episodic_memory"]["event_summary"],
            "two"
        );
    }

    #[test]
    fn test_failed_save_keeps_entry_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("history.json");

        let mut store = HistoryStore::load(&path);
        let entry = HistoryEntry::new("kept", InteractionMode::default(), response("x"));
        let result = store.add(entry);
        assert!(matches!(result, Err(VoiceError::Storage(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"[{broken").unwrap();
        assert!(HistoryStore::load(&path).is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let mut store = HistoryStore::load(&path);
        store.add(HistoryEntry::new("a", InteractionMode::default(), response("a"))).unwrap();
        store.add(HistoryEntry::new("b", InteractionMode::default(), response("b"))).unwrap();

        assert_eq!(store.remove(1).unwrap().unwrap().prompt, "a");
        assert!(store.remove(5).unwrap().is_none());
        store.clear().unwrap();
        assert!(HistoryStore::load(&path).is_empty());
    }
}
