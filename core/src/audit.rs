//! Per-session audit log: one JSONL line for every tool call the model
//! attempts, allowed or denied, so a session can be reconstructed
//! post-mortem.
//!
//! Writes happen on a dedicated task fed over a channel so the hot path
//! never blocks on disk I/O. The log can be inspected with tools such as:
//!
//! ```ignore
//! $ jq -C . ~/.atelier/sessions/audit-2026-07-12-5973b6c0.jsonl
//! ```

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Error as IoError;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::{self};
use tracing::warn;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &[FormatItem] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// How much of a tool input we keep per entry.
const MAX_INPUT_CHARS: usize = 512;

#[derive(Serialize)]
struct AuditLine<'a> {
    ts: String,
    tool: &'a str,
    call_id: &'a str,
    decision: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    input: String,
}

#[derive(Clone)]
pub struct AuditRecorder {
    tx: Sender<String>,
    path: PathBuf,
}

impl AuditRecorder {
    /// Open the audit file for this session and start the writer task. An
    /// unwritable audit directory disables auditing for the session; the
    /// caller decides whether that is fatal.
    pub fn new(audit_dir: &Path, session_id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(audit_dir)?;

        let now = OffsetDateTime::now_utc();
        let date = now
            .format(format_description!("[year]-[month]-[day]"))
            .map_err(|e| IoError::new(ErrorKind::Other, format!("format date: {e}")))?;
        let path = audit_dir.join(format!("audit-{date}-{session_id}.jsonl"));
        let file: File = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);
            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("audit writer: failed to write line: {e}");
                    break;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    warn!("audit writer: failed to write newline: {e}");
                    break;
                }
                if let Err(e) = file.flush().await {
                    warn!("audit writer: failed to flush: {e}");
                    break;
                }
            }
        });

        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one tool-call attempt. Never fails; a full or closed channel
    /// only costs the entry.
    pub async fn record(
        &self,
        tool: &str,
        call_id: &str,
        decision: &str,
        reason: Option<&str>,
        input: &serde_json::Value,
    ) {
        let ts = OffsetDateTime::now_utc()
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_default();
        let mut input = input.to_string();
        if input.len() > MAX_INPUT_CHARS {
            let mut cut = MAX_INPUT_CHARS;
            while !input.is_char_boundary(cut) {
                cut -= 1;
            }
            input.truncate(cut);
            input.push_str("[truncated]");
        }
        let line = AuditLine {
            ts,
            tool,
            call_id,
            decision,
            reason,
            input,
        };
        match serde_json::to_string(&line) {
            Ok(json) => {
                if self.tx.send(json).await.is_err() {
                    warn!("audit writer task is gone; dropping entry");
                }
            }
            Err(e) => warn!("failed to serialise audit entry: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn records_allowed_and_denied_calls() {
        let dir = TempDir::new().unwrap();
        let recorder = AuditRecorder::new(dir.path(), Uuid::new_v4()).unwrap();

        recorder
            .record("Read", "c1", "allow", None, &json!({ "file_path": "a.txt" }))
            .await;
        recorder
            .record(
                "Read",
                "c2",
                "deny",
                Some("path escapes the session workspace"),
                &json!({ "file_path": "../../etc/passwd" }),
            )
            .await;

        // Give the writer task a moment to flush.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let contents = std::fs::read_to_string(recorder.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""decision":"allow""#));
        assert!(lines[1].contains(r#""decision":"deny""#));
        assert!(lines[1].contains("etc/passwd"));
    }
}
