//! Restorable checkpoints written before an approval-gated mutating tool
//! runs.
//!
//! Each checkpoint pairs a git snapshot of the target file with the
//! conversation state, so a bad edit can be rolled back together with the
//! context that produced it.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use skiff_protocol::ClientMessage;
use skiff_protocol::ToolCallRequest;

use crate::history::HistoryEntry;

/// Snapshots a file into the git-backed checkpoint store, returning the
/// resulting commit hash.
pub trait GitSnapshot: Send + Sync {
    fn snapshot_file(&self, file_path: &Path) -> Result<String>;
}

#[derive(Serialize)]
struct ToolCallBlob<'a> {
    name: &'a str,
    args: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct CheckpointBlob<'a> {
    history: &'a [HistoryEntry],
    client_history: &'a [ClientMessage],
    tool_call: ToolCallBlob<'a>,
    commit_hash: &'a str,
    file_path: &'a str,
}

pub struct CheckpointWriter {
    directory: PathBuf,
    git: Arc<dyn GitSnapshot>,
}

impl CheckpointWriter {
    pub fn new(directory: PathBuf, git: Arc<dyn GitSnapshot>) -> Self {
        Self { directory, git }
    }

    /// Persists `{timestamp}-{basename}-{tool}.json` under the checkpoint
    /// directory and returns its path. The target file comes from the tool
    /// call's `file_path` argument.
    pub fn save(
        &self,
        request: &ToolCallRequest,
        history: &[HistoryEntry],
        client_history: &[ClientMessage],
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let file_path = request
            .str_arg("file_path")
            .context("tool call has no file_path argument")?;
        let commit_hash = self
            .git
            .snapshot_file(Path::new(file_path))
            .with_context(|| format!("snapshotting {file_path}"))?;

        let basename = Path::new(file_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let filename = format!(
            "{}-{basename}-{}.json",
            now.format("%Y-%m-%dT%H-%M-%S_%3f"),
            request.name
        );

        let blob = CheckpointBlob {
            history,
            client_history,
            tool_call: ToolCallBlob {
                name: &request.name,
                args: &request.arguments,
            },
            commit_hash: &commit_hash,
            file_path,
        };

        std::fs::create_dir_all(&self.directory)
            .with_context(|| format!("creating {}", self.directory.display()))?;
        let path = self.directory.join(filename);
        let json = serde_json::to_string_pretty(&blob)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;

        tracing::debug!(path = %path.display(), tool = %request.name, "checkpoint saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::history::HistoryRecord;

    struct FixedGit;

    impl GitSnapshot for FixedGit {
        fn snapshot_file(&self, _file_path: &Path) -> Result<String> {
            Ok("abc123def".to_string())
        }
    }

    struct FailingGit;

    impl GitSnapshot for FailingGit {
        fn snapshot_file(&self, _file_path: &Path) -> Result<String> {
            anyhow::bail!("not a git repository")
        }
    }

    fn edit_request() -> ToolCallRequest {
        let mut arguments = Map::new();
        arguments.insert("file_path".to_string(), json!("/p/a.ts"));
        arguments.insert("old_string".to_string(), json!("x"));
        ToolCallRequest {
            call_id: "call-1".to_string(),
            name: "edit".to_string(),
            arguments,
            prompt_id: "sess########1".to_string(),
            client_initiated: false,
        }
    }

    fn history_with_user() -> Vec<HistoryEntry> {
        vec![HistoryEntry {
            id: 1,
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap(),
            record: HistoryRecord::User {
                text: "please edit a.ts".to_string(),
            },
        }]
    }

    #[test]
    fn writes_timestamped_blob_with_commit_hash() {
        let dir = TempDir::new().unwrap();
        let writer = CheckpointWriter::new(dir.path().to_path_buf(), Arc::new(FixedGit));
        let now = Utc
            .with_ymd_and_hms(2025, 6, 1, 9, 30, 5)
            .unwrap()
            .with_timezone(&Utc);

        let path = writer
            .save(&edit_request(), &history_with_user(), &[], now)
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "2025-06-01T09-30-05_000-a.ts-edit.json");

        let blob: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(blob["commit_hash"], "abc123def");
        assert_eq!(blob["file_path"], "/p/a.ts");
        assert_eq!(blob["tool_call"]["name"], "edit");
        assert_eq!(blob["tool_call"]["args"]["file_path"], "/p/a.ts");
        assert_eq!(blob["history"][0]["type"], "user");
        assert_eq!(blob["history"][0]["text"], "please edit a.ts");
        assert!(blob["client_history"].as_array().unwrap().is_empty());
    }

    #[test]
    fn missing_file_path_argument_is_an_error() {
        let dir = TempDir::new().unwrap();
        let writer = CheckpointWriter::new(dir.path().to_path_buf(), Arc::new(FixedGit));
        let mut request = edit_request();
        request.arguments.remove("file_path");

        let error = writer.save(&request, &[], &[], Utc::now()).unwrap_err();
        assert!(error.to_string().contains("file_path"));
    }

    #[test]
    fn git_failures_propagate() {
        let dir = TempDir::new().unwrap();
        let writer = CheckpointWriter::new(dir.path().to_path_buf(), Arc::new(FailingGit));

        let error = writer
            .save(&edit_request(), &[], &[], Utc::now())
            .unwrap_err();
        assert!(format!("{error:#}").contains("not a git repository"));
    }
}
