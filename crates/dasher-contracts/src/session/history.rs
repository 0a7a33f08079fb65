use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

/// Prompt for one option of a refinement step.
pub fn refine_prompt(base: &str, detail: &str, option: &str) -> String {
    format!("{base} with {detail}: {option}")
}

/// One generated image the session kept. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub image: String,
    pub detail: Option<String>,
    pub detail_value: Option<String>,
    pub created_at: String,
}

impl HistoryEntry {
    pub fn initial(prompt: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: image.into(),
            detail: None,
            detail_value: None,
            created_at: now_utc_iso(),
        }
    }

    pub fn refined(
        prompt: impl Into<String>,
        image: impl Into<String>,
        detail: impl Into<String>,
        detail_value: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            image: image.into(),
            detail: Some(detail.into()),
            detail_value: Some(detail_value.into()),
            created_at: now_utc_iso(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEntry {
    #[serde(flatten)]
    pub entry: HistoryEntry,
    pub image_path: Option<String>,
    pub prompt_diff: Option<Vec<String>>,
}

/// On-disk record of a finished session (`history.json`).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub entries: Vec<RecordedEntry>,
}

impl SessionRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            entries: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut record = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return record;
        };

        record.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(record.schema_version);
        record.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(record.session_id);
        record.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(record.created_at);

        if let Some(entries) = obj.get("entries").and_then(Value::as_array) {
            for item in entries {
                if let Ok(parsed) = serde_json::from_value::<RecordedEntry>(item.clone()) {
                    record.entries.push(parsed);
                }
            }
        }
        record
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn push(&mut self, entry: HistoryEntry, image_path: Option<String>) -> &RecordedEntry {
        let prompt_diff = self
            .entries
            .last()
            .map(|prev| prompt_diff(&prev.entry.prompt, &entry.prompt));
        self.entries.push(RecordedEntry {
            entry,
            image_path,
            prompt_diff,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn final_prompt(&self) -> Option<&str> {
        self.entries.last().map(|row| row.entry.prompt.as_str())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "entries".to_string(),
            Value::Array(
                self.entries
                    .iter()
                    .map(|row| serde_json::to_value(row).unwrap_or(Value::Null))
                    .collect(),
            ),
        );
        write_json(&self.path, Value::Object(payload))
    }
}

fn prompt_diff(prev: &str, curr: &str) -> Vec<String> {
    TextDiff::from_words(prev, curr)
        .unified_diff()
        .header("prev", "curr")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn refine_prompt_appends_detail_and_option() {
        assert_eq!(
            refine_prompt("a red car", "color", "blue"),
            "a red car with color: blue"
        );
    }

    #[test]
    fn session_record_roundtrip_keeps_entries_and_diffs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("history.json");
        let mut record = SessionRecord::new(&path).with_session_id("session-1");

        record.push(
            HistoryEntry::initial("a red car", "blob:dasher/aa"),
            Some("images/00.png".to_string()),
        );
        let second = record.push(
            HistoryEntry::refined(
                "a red car with color: blue",
                "blob:dasher/bb",
                "color",
                "blue",
            ),
            None,
        );
        assert!(second.prompt_diff.is_some());
        record.save()?;

        let loaded = SessionRecord::load(&path);
        assert_eq!(loaded.session_id, "session-1");
        assert_eq!(loaded.entries.len(), 2);
        assert!(loaded.entries[0].prompt_diff.is_none());
        assert_eq!(loaded.entries[1].entry.detail_value.as_deref(), Some("blue"));
        assert_eq!(loaded.final_prompt(), Some("a red car with color: blue"));

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["entries"][0]["image_path"], json!("images/00.png"));
        assert_eq!(raw["entries"][0]["detail"], Value::Null);
        Ok(())
    }

    #[test]
    fn load_tolerates_missing_or_corrupt_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("history.json");
        assert!(SessionRecord::load(&path).entries.is_empty());

        std::fs::write(&path, r#"{"entries": [{"prompt": 3}, "junk"]}"#)?;
        let loaded = SessionRecord::load(&path);
        assert!(loaded.entries.is_empty());
        assert_eq!(loaded.schema_version, 1);
        Ok(())
    }
}
