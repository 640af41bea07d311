// Watermark persistence
//
// JSON state file written atomically (temp file then rename) so a crash
// mid-write can never truncate the watermark. A missing file is a fresh
// start, not an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl AgentState {
    /// Record one successfully dispatched record.
    pub fn advance(&mut self, source_id: &str, death_time: DateTime<Utc>) {
        self.last_processed_id = Some(source_id.to_string());
        self.last_processed_at = Some(death_time);
        self.total_processed += 1;
    }

    /// Move the watermark past a record without counting it as processed,
    /// used for records that were skipped rather than dispatched.
    pub fn skip(&mut self, source_id: &str, death_time: DateTime<Utc>) {
        self.last_processed_id = Some(source_id.to_string());
        self.last_processed_at = Some(death_time);
    }

    pub fn record_error(&mut self, message: &str) {
        self.last_error = Some(message.to_string());
        self.last_error_at = Some(Utc::now());
    }
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AgentState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AgentState::default())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    pub fn save(&self, state: &AgentState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_file(tag: &str) -> StateFile {
        let path = std::env::temp_dir().join(format!(
            "vigil-agent-state-{tag}-{}.json",
            uuid::Uuid::now_v7()
        ));
        StateFile::new(path)
    }

    #[test]
    fn missing_file_is_a_fresh_start() {
        let file = temp_state_file("missing");
        assert_eq!(file.load().unwrap(), AgentState::default());
    }

    #[test]
    fn round_trips_through_disk() {
        let file = temp_state_file("roundtrip");
        let mut state = AgentState::default();
        state.advance("OB-77", "2026-03-10T14:30:00Z".parse().unwrap());
        state.record_error("push failed once");

        file.save(&state).unwrap();
        assert_eq!(file.load().unwrap(), state);

        // Overwrites are atomic replacements, not appends
        state.advance("OB-78", "2026-03-10T15:00:00Z".parse().unwrap());
        file.save(&state).unwrap();
        let loaded = file.load().unwrap();
        assert_eq!(loaded.last_processed_id.as_deref(), Some("OB-78"));
        assert_eq!(loaded.total_processed, 2);

        std::fs::remove_file(file.path()).ok();
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_reset() {
        let file = temp_state_file("corrupt");
        std::fs::write(file.path(), b"{not json").unwrap();
        assert!(file.load().is_err());
        std::fs::remove_file(file.path()).ok();
    }
}
