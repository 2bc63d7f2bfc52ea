//! Atomic JSON reader/writer over a per-issue state directory.
//!
//! Every write goes through a write-temp-then-rename so a reader never
//! observes a partially written file; reads return `None` when the file is
//! absent and a typed error when it exists but fails to parse.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::error::{CoreError, CoreResult};
use crate::types::{IssueJson, TasksJson};

/// Read `issue.json` from a state directory, if present.
pub async fn read_issue_json(state_dir: &Path) -> CoreResult<Option<IssueJson>> {
    read_json(&state_dir.join("issue.json")).await
}

/// Write `issue.json` atomically.
pub async fn write_issue_json(state_dir: &Path, value: &IssueJson) -> CoreResult<()> {
    write_json_atomic(&state_dir.join("issue.json"), value).await
}

/// Read `tasks.json` from a state directory, if present.
pub async fn read_tasks_json(state_dir: &Path) -> CoreResult<Option<TasksJson>> {
    read_json(&state_dir.join("tasks.json")).await
}

/// Write `tasks.json` atomically.
pub async fn write_tasks_json(state_dir: &Path, value: &TasksJson) -> CoreResult<()> {
    write_json_atomic(&state_dir.join("tasks.json"), value).await
}

/// Generic atomic JSON read: `None` if absent, typed error if malformed.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|source| CoreError::MalformedJson {
                path: path.display().to_string(),
                source,
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

/// Generic atomic JSON write: write-temp-in-same-directory, then rename.
///
/// The rename happens within the same directory so it is an atomic POSIX
/// rename rather than a cross-filesystem copy; a reader either sees the old
/// file whole or the new file whole, never a partial write.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let dir = path.parent().ok_or_else(|| {
        CoreError::Other(anyhow::anyhow!("path {} has no parent directory", path.display()))
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp_name = format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = dir.join(tmp_name);

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|source| CoreError::MalformedJson {
            path: path.display().to_string(),
            source,
        })?;

    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Append a single line to the append-only viewer log.
///
/// A single `write_all` call on a file opened in append mode is atomic for
/// writes up to `PIPE_BUF`/block size on POSIX filesystems, which is the
/// guarantee the viewer log relies on: interleaved writers never corrupt a
/// line, only the ordering between lines is unspecified.
pub async fn append_viewer_log(path: &Path, line: &str) -> CoreResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = line.as_bytes().to_vec();
    if !line.ends_with('\n') {
        buf.push(b'\n');
    }
    file.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueControl, IssueJson, IssueNumberField, IssueSettings, IssueStatus};
    use std::collections::HashMap;

    fn sample_issue() -> IssueJson {
        IssueJson {
            repo: "acme/widgets".to_string(),
            issue: IssueNumberField { number: 42 },
            branch: "issue/42".to_string(),
            workflow: "default".to_string(),
            phase: "hello".to_string(),
            notes: String::new(),
            settings: IssueSettings::default(),
            control: IssueControl::default(),
            status: IssueStatus::default(),
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn read_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_issue_json(dir.path()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let issue = sample_issue();
        write_issue_json(dir.path(), &issue).await.unwrap();

        let read_back = read_issue_json(dir.path()).await.unwrap().unwrap();
        assert_eq!(read_back.phase, "hello");
        assert_eq!(read_back.repo, "acme/widgets");

        // No leftover temp files after a successful write.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["issue.json"]);
    }

    #[tokio::test]
    async fn malformed_json_surfaces_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("issue.json"), b"not json")
            .await
            .unwrap();
        let err = read_issue_json(dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedJson { .. }));
    }

    #[tokio::test]
    async fn append_viewer_log_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("viewer-run.log");
        append_viewer_log(&log_path, "[RUNNER] starting").await.unwrap();
        append_viewer_log(&log_path, "[STOP] stopping").await.unwrap();

        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines, vec!["[RUNNER] starting", "[STOP] stopping"]);
    }
}
