use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::conversation::Role;

/// Everything a session records about itself, one variant per line type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        model: String,
        camera: String,
        resend_history: bool,
    },
    CameraFrame {
        url: String,
        mime_type: String,
        width: u32,
        height: u32,
        bytes: usize,
        sha256: String,
        fetched_at: String,
    },
    CameraFailed {
        url: String,
        error: String,
        timeout: bool,
    },
    TurnAppended {
        index: usize,
        role: Role,
        text: String,
        has_image: bool,
    },
    ModelFailed {
        model: String,
        error: String,
        timeout: bool,
    },
    ModelChanged {
        model: String,
    },
    SessionFinished {
        turns: usize,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::CameraFrame { .. } => "camera_frame",
            SessionEvent::CameraFailed { .. } => "camera_failed",
            SessionEvent::TurnAppended { .. } => "turn_appended",
            SessionEvent::ModelFailed { .. } => "model_failed",
            SessionEvent::ModelChanged { .. } => "model_changed",
            SessionEvent::SessionFinished { .. } => "session_finished",
        }
    }
}

/// One JSONL line: envelope fields followed by the flattened event.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    event: &'a SessionEvent,
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append-only JSONL log for one chat session. The file is opened once
/// and shared behind a lock.
#[derive(Debug)]
pub struct EventWriter {
    path: PathBuf,
    session_id: String,
    file: Mutex<File>,
}

impl EventWriter {
    /// Opens `path` for appending under a fresh random session id.
    pub fn open_new_session(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path, format!("session-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn open(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening event log {}", path.display()))?;
        Ok(Self {
            path,
            session_id: session_id.into(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self, event: &SessionEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&EventLine {
            session_id: &self.session_id,
            ts: timestamp(Utc::now()),
            event,
        })?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        file.write_all(&line)
            .with_context(|| format!("failed writing {} event", event.kind()))
    }
}
